//! Commutativity analysis: which changes can be applied independently.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Result of one analysis pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommutativityResult {
    pub independent_sets: Vec<Vec<String>>,
    pub conflict_pairs: Vec<[String; 2]>,
}

/// Group changes by immediate parent directory and split them into
/// independent sets and conflict pairs.
///
/// Two parents conflict when one is an ancestor of the other (the root
/// parent is an ancestor of every directory). A parent with no conflicts
/// yields its file set as one independent group; conflicting parents emit
/// every cross pair. When nothing is independent but changes exist, each
/// file degrades to its own singleton group.
pub fn analyze(changes: &[String]) -> CommutativityResult {
    let mut by_dir: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
    for change in changes {
        let parent = Path::new(change)
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .to_path_buf();
        by_dir.entry(parent).or_default().push(change.clone());
    }

    let dirs: Vec<&PathBuf> = by_dir.keys().collect();
    let mut independent_sets = Vec::new();
    let mut conflict_pairs = Vec::new();

    for (i, dir) in dirs.iter().enumerate() {
        let files = &by_dir[*dir];
        let mut conflicts = false;
        for (j, other) in dirs.iter().enumerate() {
            if i == j {
                continue;
            }
            if paths_overlap(dir, other) {
                conflicts = true;
                for f1 in files {
                    for f2 in &by_dir[*other] {
                        conflict_pairs.push([f1.clone(), f2.clone()]);
                    }
                }
            }
        }
        if !conflicts && !files.is_empty() {
            independent_sets.push(files.clone());
        }
    }

    if independent_sets.is_empty() && !changes.is_empty() {
        independent_sets = changes.iter().map(|c| vec![c.clone()]).collect();
    }

    CommutativityResult {
        independent_sets,
        conflict_pairs,
    }
}

/// Whether one path is an ancestor of the other, in either direction.
fn paths_overlap(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}
