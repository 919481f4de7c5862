//! Witness engine: content-addressed attestation packages.
//!
//! A witness captures the changed files of a capsule at a point in time:
//! a manifest, a BLAKE3 digest per file, optional content-addressed blobs,
//! and a root hash over the manifest and hash table. Replay re-derives the
//! root hash and compares it with the recorded one.

pub mod archive;
pub mod engine;

pub use engine::{ReplayOutcome, WitnessEngine, WitnessManifest, WitnessOutcome, WitnessRecord};
