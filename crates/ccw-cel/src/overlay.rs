//! Kernel overlay CEL variant (Linux).
//!
//! The writable view is an overlay mount of `base` (lower, read-only),
//! `upper` (writes), and `work` (scratch) at `merged`. The change set is
//! exactly the regular files present under `upper`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::exec::run_command;
use crate::{remove_tree_with_retry, ExecRequest, ExecResult, Touched};

/// Overlay-mounted counterfactual execution layer.
pub struct OverlayCel {
    pub workspace: PathBuf,
    pub base_dir: PathBuf,
    pub mount_point: PathBuf,
    upper_dir: PathBuf,
    work_dir: PathBuf,
    temp_root: PathBuf,
    is_mounted: bool,
}

impl OverlayCel {
    /// Prepare the overlay directory structure. The mount itself happens in
    /// [`OverlayCel::mount`] so the caller can fall back on refusal.
    pub fn new(workspace: &Path, base_dir: &Path) -> Result<Self> {
        let temp_root = crate::create_temp_root()?;
        let overlay_dir = temp_root.join("overlay");
        let upper_dir = overlay_dir.join("upper");
        let work_dir = overlay_dir.join("work");
        let mount_point = overlay_dir.join("merged");

        for dir in [&upper_dir, &work_dir, &mount_point] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        Ok(Self {
            workspace: workspace.to_path_buf(),
            base_dir: base_dir.to_path_buf(),
            mount_point,
            upper_dir,
            work_dir,
            temp_root,
            is_mounted: false,
        })
    }

    /// Reattach to an overlay sandbox persisted by a previous process.
    pub fn rehydrate(workspace: &Path, base_dir: &Path, mount_point: &Path) -> Result<Self> {
        let overlay_dir = mount_point
            .parent()
            .context("mount point has no parent directory")?
            .to_path_buf();
        let temp_root = overlay_dir
            .parent()
            .context("overlay directory has no parent")?
            .to_path_buf();

        Ok(Self {
            workspace: workspace.to_path_buf(),
            base_dir: base_dir.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            upper_dir: overlay_dir.join("upper"),
            work_dir: overlay_dir.join("work"),
            temp_root,
            // The directory usually survives a restart while the kernel
            // mount does not; trust the mount table, not the path.
            is_mounted: is_path_mounted(mount_point),
        })
    }

    /// Establish the overlay mount. Idempotent.
    pub fn mount(&mut self) -> Result<PathBuf> {
        if self.is_mounted {
            return Ok(self.mount_point.clone());
        }

        self.mount_overlay()?;
        self.is_mounted = true;
        Ok(self.mount_point.clone())
    }

    #[cfg(target_os = "linux")]
    fn mount_overlay(&self) -> Result<()> {
        use nix::mount::{mount, MsFlags};

        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            self.base_dir.display(),
            self.upper_dir.display(),
            self.work_dir.display()
        );

        mount(
            Some("overlay"),
            &self.mount_point,
            Some("overlay"),
            MsFlags::empty(),
            Some(options.as_bytes()),
        )
        .with_context(|| format!("Failed to mount overlay at {}", self.mount_point.display()))?;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn mount_overlay(&self) -> Result<()> {
        anyhow::bail!("overlay mounts are only supported on Linux")
    }

    /// Execute a command inside the merged view.
    pub fn execute(&mut self, req: &ExecRequest) -> Result<ExecResult> {
        let mount = self.mount()?;
        let raw = run_command(&mount, req);

        // Everything in the upper layer was written; reads are not traced.
        let written = self.changes()?;
        Ok(ExecResult {
            exit_code: raw.exit_code,
            stdout: raw.stdout,
            stderr: raw.stderr,
            usage: raw.usage,
            touched: Touched {
                read: Vec::new(),
                written,
            },
        })
    }

    /// Regular files present anywhere under the upper layer.
    pub fn changes(&self) -> Result<Vec<String>> {
        let mut changes = Vec::new();
        if !self.upper_dir.exists() {
            return Ok(changes);
        }
        for entry in WalkDir::new(&self.upper_dir).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.upper_dir) {
                    changes.push(ccw_common::rel_display(rel));
                }
            }
        }
        changes.sort();
        Ok(changes)
    }

    fn unmount(&mut self) {
        if !self.is_mounted {
            return;
        }

        #[cfg(target_os = "linux")]
        {
            use nix::mount::{umount2, MntFlags};
            if let Err(e) = umount2(&self.mount_point, MntFlags::MNT_DETACH) {
                tracing::warn!(mount = %self.mount_point.display(), error = %e, "overlay unmount failed");
            }
        }

        self.is_mounted = false;
    }

    /// Release the mount and remove the temporary tree. Best-effort.
    pub fn cleanup(&mut self) {
        self.unmount();
        let temp_root = self.temp_root.clone();
        remove_tree_with_retry(&temp_root);
    }
}

/// Check whether a path is currently a mountpoint via /proc/self/mounts.
#[cfg(target_os = "linux")]
fn is_path_mounted(path: &Path) -> bool {
    let Ok(mounts) = std::fs::read_to_string("/proc/self/mounts") else {
        return false;
    };
    let target = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    for line in mounts.lines() {
        if let Some(mount_point) = line.split_whitespace().nth(1) {
            if let Ok(real) = std::fs::canonicalize(mount_point) {
                if real == target {
                    return true;
                }
            }
        }
    }
    false
}

#[cfg(not(target_os = "linux"))]
fn is_path_mounted(_path: &Path) -> bool {
    false
}

impl Drop for OverlayCel {
    fn drop(&mut self) {
        if self.is_mounted {
            self.unmount();
        }
    }
}
