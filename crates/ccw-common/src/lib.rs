//! Shared utilities for CCW components.
//!
//! Content hashing, diff generation, resource accounting, and filesystem
//! scanning used by the execution layer and the engines above it.

pub mod diff;
pub mod hashing;
pub mod ids;
pub mod scan;
pub mod usage;

pub use hashing::{hash_bytes, hash_file, hash_reader, verify_file};
pub use ids::next_id;
pub use scan::{find_changed_files, scan_files, StatCache};
pub use usage::ResourceUsage;

use std::path::Path;

/// Render a workspace-relative path with forward slashes for wire payloads.
pub fn rel_display(path: &Path) -> String {
    let raw = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        raw.into_owned()
    } else {
        raw.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn rel_display_uses_forward_slashes() {
        let p = PathBuf::from("a").join("b.txt");
        assert_eq!(rel_display(&p), "a/b.txt");
    }
}
