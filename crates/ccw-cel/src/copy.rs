//! Copy CEL variant: the portable fallback when overlay mounts are
//! unavailable.
//!
//! The mount root is a recursive copy of the base taken at construction.
//! Change detection compares (size, mtime) against the base, falling back to
//! byte equality and BLAKE3 for large files. Per-execution touched files come
//! from mtime snapshots taken around the spawn.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
#[cfg(unix)]
use std::process::Command;
use std::time::SystemTime;
use walkdir::WalkDir;

use crate::exec::run_command;
use crate::{remove_tree_with_retry, ExecRequest, ExecResult, Touched};
use ccw_common::{find_changed_files, rel_display, StatCache};

/// Upper bound on reported read entries, to keep payloads bounded.
const MAX_READ_ENTRIES: usize = 100;

/// Copy-based counterfactual execution layer.
pub struct CopyCel {
    pub workspace: PathBuf,
    pub base_dir: PathBuf,
    sandbox_dir: PathBuf,
    temp_root: PathBuf,
    stat_cache: StatCache,
}

impl CopyCel {
    /// Copy the base into a fresh sandbox under an exclusive temp root.
    pub fn new(workspace: &Path, base_dir: &Path) -> Result<Self> {
        let temp_root = crate::create_temp_root()?;
        let sandbox_dir = temp_root.join("sandbox");
        std::fs::create_dir_all(&sandbox_dir)
            .with_context(|| format!("Failed to create {}", sandbox_dir.display()))?;

        if base_dir.exists() {
            copy_tree(base_dir, &sandbox_dir)?;
        }

        Ok(Self {
            workspace: workspace.to_path_buf(),
            base_dir: base_dir.to_path_buf(),
            sandbox_dir,
            temp_root,
            stat_cache: StatCache::new(),
        })
    }

    /// Reattach to a sandbox persisted by a previous process, without
    /// re-copying its contents.
    pub fn rehydrate(workspace: &Path, base_dir: &Path, mount_point: &Path) -> Result<Self> {
        let temp_root = mount_point
            .parent()
            .context("mount point has no parent directory")?
            .to_path_buf();

        Ok(Self {
            workspace: workspace.to_path_buf(),
            base_dir: base_dir.to_path_buf(),
            sandbox_dir: mount_point.to_path_buf(),
            temp_root,
            stat_cache: StatCache::new(),
        })
    }

    /// The sandbox is prepared at construction; mount is a no-op.
    pub fn mount(&self) -> PathBuf {
        self.sandbox_dir.clone()
    }

    pub fn sandbox_dir(&self) -> &Path {
        &self.sandbox_dir
    }

    /// Execute a command inside the sandbox, classifying touched files from
    /// mtime snapshots taken before and after the run.
    pub fn execute(&mut self, req: &ExecRequest) -> Result<ExecResult> {
        let before = self.snapshot_mtimes();
        let raw = run_command(&self.sandbox_dir, req);
        let after = self.snapshot_mtimes();

        // Execution invalidates whatever the cache knew about the sandbox.
        self.stat_cache.clear();

        let touched = classify_touched(&before, &after);
        Ok(ExecResult {
            exit_code: raw.exit_code,
            stdout: raw.stdout,
            stderr: raw.stderr,
            usage: raw.usage,
            touched,
        })
    }

    /// Regular files in the sandbox that differ from the base.
    pub fn changes(&self) -> Result<Vec<String>> {
        if !self.base_dir.exists() {
            let mut all = Vec::new();
            for entry in WalkDir::new(&self.sandbox_dir).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file() {
                    if let Ok(rel) = entry.path().strip_prefix(&self.sandbox_dir) {
                        all.push(rel_display(rel));
                    }
                }
            }
            all.sort();
            return Ok(all);
        }

        let changed = find_changed_files(&self.base_dir, &self.sandbox_dir, Some(&self.stat_cache))?;
        Ok(changed.iter().map(|p| rel_display(p)).collect())
    }

    fn snapshot_mtimes(&self) -> BTreeMap<PathBuf, SystemTime> {
        let mut snapshot = BTreeMap::new();
        for entry in WalkDir::new(&self.sandbox_dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.sandbox_dir) else {
                continue;
            };
            if let Ok(meta) = entry.metadata() {
                if let Ok(mtime) = meta.modified() {
                    snapshot.insert(rel.to_path_buf(), mtime);
                }
            }
        }
        snapshot
    }

    /// Remove the sandbox and its temp root. Best-effort with retries.
    pub fn cleanup(&mut self) {
        let temp_root = self.temp_root.clone();
        remove_tree_with_retry(&temp_root);
    }
}

fn classify_touched(
    before: &BTreeMap<PathBuf, SystemTime>,
    after: &BTreeMap<PathBuf, SystemTime>,
) -> Touched {
    let mut touched = Touched::default();

    for (path, mtime) in after {
        match before.get(path) {
            None => touched.written.push(rel_display(path)),
            Some(previous) if previous != mtime => touched.written.push(rel_display(path)),
            Some(_) => {
                if touched.read.len() < MAX_READ_ENTRIES {
                    touched.read.push(rel_display(path));
                }
            }
        }
    }

    // Deletions surface as decorated entries in the written list.
    for path in before.keys() {
        if !after.contains_key(path) {
            touched.written.push(format!("[deleted] {}", rel_display(path)));
        }
    }

    touched
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;

    // Prefer cp -a --reflink=auto for speed; fall back to a walking copy.
    #[cfg(unix)]
    {
        let status = Command::new("cp")
            .arg("-a")
            .arg("--reflink=auto")
            .arg(format!("{}/.", from.display()))
            .arg(to)
            .status();
        if matches!(status, Ok(s) if s.success()) {
            return Ok(());
        }
    }

    for entry in WalkDir::new(from) {
        let entry = entry?;
        let rel = match entry.path().strip_prefix(from) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let dest = to.join(rel);
        let kind = entry.file_type();
        if kind.is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if kind.is_file() {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &dest).with_context(|| {
                format!("copy {} -> {}", entry.path().display(), dest.display())
            })?;
        } else if kind.is_symlink() {
            if let Ok(target) = std::fs::read_link(entry.path()) {
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                #[cfg(unix)]
                std::os::unix::fs::symlink(target, &dest)
                    .with_context(|| format!("symlink {}", dest.display()))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_base() -> TempDir {
        let base = TempDir::new().unwrap();
        std::fs::write(base.path().join("a.txt"), "alpha").unwrap();
        std::fs::create_dir_all(base.path().join("sub")).unwrap();
        std::fs::write(base.path().join("sub/b.txt"), "beta").unwrap();
        base
    }

    fn exec(cel: &mut CopyCel, script: &str) -> ExecResult {
        let req = ExecRequest::new(vec!["sh".into(), "-c".into(), script.into()]);
        cel.execute(&req).unwrap()
    }

    #[test]
    fn sandbox_receives_base_contents() {
        let base = make_base();
        let cel = CopyCel::new(base.path(), base.path()).unwrap();
        let mount = cel.mount();
        assert_eq!(std::fs::read_to_string(mount.join("a.txt")).unwrap(), "alpha");
        assert_eq!(
            std::fs::read_to_string(mount.join("sub/b.txt")).unwrap(),
            "beta"
        );
    }

    #[test]
    fn fresh_sandbox_has_no_changes() {
        let base = make_base();
        let cel = CopyCel::new(base.path(), base.path()).unwrap();
        assert!(cel.changes().unwrap().is_empty());
    }

    #[test]
    fn writes_show_up_as_changes_and_touched() {
        let base = make_base();
        let mut cel = CopyCel::new(base.path(), base.path()).unwrap();
        let result = exec(&mut cel, "printf gamma > c.txt");
        assert_eq!(result.exit_code, 0);
        assert!(result.touched.written.contains(&"c.txt".to_string()));

        let changes = cel.changes().unwrap();
        assert_eq!(changes, vec!["c.txt".to_string()]);
        assert!(!base.path().join("c.txt").exists());
        cel.cleanup();
    }

    #[test]
    fn deletions_are_decorated_in_touched() {
        let base = make_base();
        let mut cel = CopyCel::new(base.path(), base.path()).unwrap();
        let result = exec(&mut cel, "rm a.txt");
        assert!(result
            .touched
            .written
            .contains(&"[deleted] a.txt".to_string()));
        assert!(base.path().join("a.txt").exists());
        cel.cleanup();
    }

    #[test]
    fn rehydrate_reuses_existing_sandbox() {
        let base = make_base();
        let mut first = CopyCel::new(base.path(), base.path()).unwrap();
        exec(&mut first, "printf marker > marker.txt");
        let mount = first.mount();

        let second = CopyCel::rehydrate(base.path(), base.path(), &mount).unwrap();
        assert_eq!(
            std::fs::read_to_string(second.mount().join("marker.txt")).unwrap(),
            "marker"
        );
        assert!(second.changes().unwrap().contains(&"marker.txt".to_string()));
        first.cleanup();
    }

    #[test]
    fn modified_content_with_same_size_is_detected() {
        let base = make_base();
        let mut cel = CopyCel::new(base.path(), base.path()).unwrap();
        exec(&mut cel, "printf gamma > a.txt"); // same length as "alpha"
        assert!(cel.changes().unwrap().contains(&"a.txt".to_string()));
        cel.cleanup();
    }
}
