//! Capsule registry: the persistent lifecycle manager for CEL sandboxes.
//!
//! Capsules are held in an id-keyed map; the metadata file on disk is the
//! ground truth and the in-memory map is a cache. Every mutating operation
//! rewrites the metadata so a restarted server can rehydrate.

pub mod registry;

pub use registry::{CapsuleEntry, CapsuleMetadata, CapsuleRegistry, CreateOutcome, DiffOutcome};
