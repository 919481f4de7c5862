//! Resource accounting shared between the tracer and the policy engine.

use serde::{Deserialize, Serialize};

/// Resource usage accumulated over one command execution.
///
/// Counters a platform cannot supply stay zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_ms: u64,
    pub rss_max_kb: u64,
    pub io_read_kb: u64,
    pub io_write_kb: u64,
}

impl ResourceUsage {
    /// Fold a later observation into this one, keeping counters monotone.
    pub fn absorb(&mut self, other: &ResourceUsage) {
        self.cpu_ms = self.cpu_ms.max(other.cpu_ms);
        self.rss_max_kb = self.rss_max_kb.max(other.rss_max_kb);
        self.io_read_kb = self.io_read_kb.max(other.io_read_kb);
        self.io_write_kb = self.io_write_kb.max(other.io_write_kb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absorb_keeps_peaks() {
        let mut usage = ResourceUsage {
            cpu_ms: 10,
            rss_max_kb: 2048,
            io_read_kb: 4,
            io_write_kb: 0,
        };
        usage.absorb(&ResourceUsage {
            cpu_ms: 25,
            rss_max_kb: 1024,
            io_read_kb: 4,
            io_write_kb: 8,
        });
        assert_eq!(usage.cpu_ms, 25);
        assert_eq!(usage.rss_max_kb, 2048);
        assert_eq!(usage.io_write_kb, 8);
    }

    #[test]
    fn default_is_all_zero() {
        let usage = ResourceUsage::default();
        assert_eq!(usage.cpu_ms, 0);
        assert_eq!(usage.rss_max_kb, 0);
    }
}
