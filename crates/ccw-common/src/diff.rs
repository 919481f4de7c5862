//! Unified and structural diff generation for capsule change sets.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use similar::TextDiff;
use std::collections::BTreeMap;
use std::path::Path;

/// Line counters extracted from unified diff text.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffCounts {
    pub added: usize,
    pub deleted: usize,
}

/// Generate a unified diff between two files.
///
/// A missing file on either side is treated as empty, so new files render as
/// pure additions and deleted files as pure removals.
pub fn unified_diff(old_path: &Path, new_path: &Path, context_lines: usize) -> Result<String> {
    let old_text = read_or_empty(old_path);
    let new_text = read_or_empty(new_path);

    let diff = TextDiff::from_lines(&old_text, &new_text);
    let text = diff
        .unified_diff()
        .context_radius(context_lines)
        .header(&old_path.to_string_lossy(), &new_path.to_string_lossy())
        .to_string();
    Ok(text)
}

fn read_or_empty(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => String::new(),
    }
}

/// Structural diff between two JSON mappings.
///
/// Non-object inputs produce an empty result, matching the mapping-only
/// contract of the structural format.
pub fn structural_diff(old: &Value, new: &Value) -> Value {
    let mut added = BTreeMap::new();
    let mut removed = BTreeMap::new();
    let mut modified = BTreeMap::new();

    if let (Value::Object(old_map), Value::Object(new_map)) = (old, new) {
        for (key, value) in new_map {
            if !old_map.contains_key(key) {
                added.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in old_map {
            match new_map.get(key) {
                None => {
                    removed.insert(key.clone(), value.clone());
                }
                Some(new_value) if new_value != value => {
                    modified.insert(
                        key.clone(),
                        serde_json::json!({"old": value, "new": new_value}),
                    );
                }
                Some(_) => {}
            }
        }
    }

    serde_json::json!({
        "added": added,
        "removed": removed,
        "modified": modified,
    })
}

/// Count added/deleted lines in unified diff text, excluding the
/// `+++`/`---` header lines.
pub fn count_changes(diff_text: &str) -> DiffCounts {
    let mut counts = DiffCounts::default();
    for line in diff_text.lines() {
        if line.starts_with('+') && !line.starts_with("+++") {
            counts.added += 1;
        } else if line.starts_with('-') && !line.starts_with("---") {
            counts.deleted += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn unified_diff_tracks_single_line_change() {
        let temp = TempDir::new().unwrap();
        let old = temp.path().join("old.txt");
        let new = temp.path().join("new.txt");
        std::fs::write(&old, "original\n").unwrap();
        std::fs::write(&new, "modified\n").unwrap();

        let text = unified_diff(&old, &new, 3).unwrap();
        assert!(text.contains("-original"));
        assert!(text.contains("+modified"));

        let counts = count_changes(&text);
        assert_eq!(counts, DiffCounts { added: 1, deleted: 1 });
    }

    #[test]
    fn missing_old_file_diffs_from_empty() {
        let temp = TempDir::new().unwrap();
        let new = temp.path().join("created.txt");
        std::fs::write(&new, "a\nb\n").unwrap();

        let text = unified_diff(&temp.path().join("absent"), &new, 3).unwrap();
        let counts = count_changes(&text);
        assert_eq!(counts, DiffCounts { added: 2, deleted: 0 });
    }

    #[test]
    fn structural_diff_buckets_keys() {
        let old = serde_json::json!({"keep": 1, "drop": 2, "change": 3});
        let new = serde_json::json!({"keep": 1, "change": 4, "fresh": 5});

        let result = structural_diff(&old, &new);
        assert_eq!(result["added"]["fresh"], 5);
        assert_eq!(result["removed"]["drop"], 2);
        assert_eq!(result["modified"]["change"]["old"], 3);
        assert_eq!(result["modified"]["change"]["new"], 4);
    }

    #[test]
    fn count_ignores_headers() {
        let text = "--- a\n+++ b\n@@ -1 +1 @@\n-x\n+y\n";
        assert_eq!(count_changes(text), DiffCounts { added: 1, deleted: 1 });
    }
}
