//! Policy engine and promotion.
//!
//! Policies are declarative ceilings on resource usage, forbidden paths,
//! required tests, and replay verification. Promotion validates a capsule's
//! change set against merged policies and, only when every check passes,
//! applies the changes atomically to the host workspace.

pub mod engine;
pub mod promote;

pub use engine::{PolicyEngine, PolicyReport, PolicyRule, ValidationInput};
pub use promote::{promote, PromoteRequest, PromoteResult};
