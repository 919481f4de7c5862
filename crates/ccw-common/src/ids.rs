//! Monotone identifier allocation.
//!
//! Ids combine a millisecond timestamp with a process-wide counter so they
//! stay unique and ordered by issuance even within one millisecond.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static COUNTER: Lazy<AtomicU64> = Lazy::new(|| AtomicU64::new(0));

/// Allocate the next id for a prefix, e.g. `cap_` or `wit_`.
pub fn next_id(prefix: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}{millis}_{seq:04}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_ordered() {
        let a = next_id("cap_");
        let b = next_id("cap_");
        assert!(a.starts_with("cap_"));
        assert_ne!(a, b);
        assert!(a < b);
    }
}
