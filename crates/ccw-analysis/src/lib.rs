//! Analytical passes over capsule change sets.

pub mod commute;
pub mod deltamin;

pub use commute::{analyze, CommutativityResult};
pub use deltamin::{minimize, DeltaMinResult};
