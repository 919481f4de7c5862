//! Counterfactual execution layer (CEL).
//!
//! A CEL materializes a writable view of a workspace without touching the
//! base directory. On Linux the view is a kernel overlay mount; everywhere
//! else (and whenever the mount is refused) it degrades to a recursive copy
//! with snapshot-based change tracking.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub mod copy;
pub mod exec;
pub mod overlay;
pub mod tracer;

pub use ccw_common::ResourceUsage;
pub use copy::CopyCel;
pub use overlay::OverlayCel;

/// Default execution timeout: ten minutes.
pub const DEFAULT_TIMEOUT_MS: u64 = 600_000;

/// Request to run one command inside a CEL.
#[derive(Clone, Debug)]
pub struct ExecRequest {
    /// Command and arguments; the first element is the program.
    pub cmd: Vec<String>,
    /// Working directory, resolved against the mount root.
    pub cwd: Option<PathBuf>,
    /// Extra environment overlaid on the host environment.
    pub env: HashMap<String, String>,
    pub timeout_ms: u64,
    pub stdin: Option<String>,
}

impl ExecRequest {
    pub fn new(cmd: Vec<String>) -> Self {
        Self {
            cmd,
            cwd: None,
            env: HashMap::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            stdin: None,
        }
    }
}

/// Files observed during the last execution.
///
/// `read` is approximate: the copy variant reports pre-existing files whose
/// timestamps did not move (capped at 100 entries), the overlay variant
/// reports nothing.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Touched {
    pub read: Vec<String>,
    pub written: Vec<String>,
}

/// Result of one command execution inside a CEL.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub usage: ResourceUsage,
    pub touched: Touched,
}

/// A counterfactual execution layer instance.
///
/// The variant is chosen once at construction and all code paths branch
/// explicitly on it.
pub enum Cel {
    Overlay(OverlayCel),
    Copy(CopyCel),
}

impl Cel {
    /// Build a CEL for `workspace`, reading from `base_dir` (defaults to the
    /// workspace). Tries the overlay variant first on Linux and silently
    /// falls back to the copy variant when the mount is refused.
    pub fn new(workspace: &Path, base_dir: Option<&Path>) -> Result<Self> {
        let base = base_dir.unwrap_or(workspace);

        #[cfg(target_os = "linux")]
        {
            match OverlayCel::new(workspace, base) {
                Ok(mut cel) => match cel.mount() {
                    Ok(_) => return Ok(Cel::Overlay(cel)),
                    Err(e) => {
                        tracing::debug!(error = %e, "overlay mount refused, falling back to copy");
                        cel.cleanup();
                    }
                },
                Err(e) => {
                    tracing::debug!(error = %e, "overlay setup failed, falling back to copy");
                }
            }
        }

        Ok(Cel::Copy(CopyCel::new(workspace, base)?))
    }

    /// Reattach to a sandbox that already exists on disk without copying or
    /// re-initializing its contents.
    pub fn rehydrate(workspace: &Path, base_dir: Option<&Path>, mount_point: &Path) -> Result<Self> {
        let base = base_dir.unwrap_or(workspace);
        let looks_like_overlay = mount_point
            .parent()
            .map(|p| p.join("upper").is_dir())
            .unwrap_or(false);

        if looks_like_overlay {
            Ok(Cel::Overlay(OverlayCel::rehydrate(
                workspace,
                base,
                mount_point,
            )?))
        } else {
            Ok(Cel::Copy(CopyCel::rehydrate(workspace, base, mount_point)?))
        }
    }

    /// Return the mount root, establishing it if needed. Idempotent.
    pub fn mount(&mut self) -> Result<PathBuf> {
        match self {
            Cel::Overlay(cel) => cel.mount(),
            Cel::Copy(cel) => Ok(cel.mount()),
        }
    }

    /// Execute a command inside the writable view.
    pub fn execute(&mut self, req: &ExecRequest) -> Result<ExecResult> {
        match self {
            Cel::Overlay(cel) => cel.execute(req),
            Cel::Copy(cel) => cel.execute(req),
        }
    }

    /// Workspace-relative paths of regular files that differ from the base.
    pub fn changes(&self) -> Result<Vec<String>> {
        match self {
            Cel::Overlay(cel) => cel.changes(),
            Cel::Copy(cel) => cel.changes(),
        }
    }

    /// Release the mount (if any) and remove the temporary tree.
    pub fn cleanup(&mut self) {
        match self {
            Cel::Overlay(cel) => cel.cleanup(),
            Cel::Copy(cel) => cel.cleanup(),
        }
    }

    pub fn workspace(&self) -> &Path {
        match self {
            Cel::Overlay(cel) => &cel.workspace,
            Cel::Copy(cel) => &cel.workspace,
        }
    }

    pub fn base_dir(&self) -> &Path {
        match self {
            Cel::Overlay(cel) => &cel.base_dir,
            Cel::Copy(cel) => &cel.base_dir,
        }
    }

    /// The stable mount root for this CEL's lifetime.
    pub fn mount_point(&self) -> &Path {
        match self {
            Cel::Overlay(cel) => &cel.mount_point,
            Cel::Copy(cel) => cel.sandbox_dir(),
        }
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            Cel::Overlay(_) => "overlay",
            Cel::Copy(_) => "copy",
        }
    }
}

/// Remove a temporary tree, retrying with exponential backoff for platforms
/// that keep file handles open briefly after process exit. Final failure is
/// logged, never raised.
pub(crate) fn remove_tree_with_retry(root: &Path) {
    const ATTEMPTS: u32 = 3;
    if !root.exists() {
        return;
    }
    for attempt in 0..ATTEMPTS {
        match std::fs::remove_dir_all(root) {
            Ok(()) => return,
            Err(_) if attempt + 1 < ATTEMPTS => {
                std::thread::sleep(std::time::Duration::from_millis(100 << attempt));
            }
            Err(e) => {
                tracing::warn!(path = %root.display(), error = %e, "temp tree cleanup failed");
            }
        }
    }
}

/// Create an exclusive temporary root for one CEL.
pub(crate) fn create_temp_root() -> Result<PathBuf> {
    let dir = tempfile::Builder::new()
        .prefix("ccw-")
        .tempdir()
        .context("Failed to create CEL temp root")?;
    Ok(dir.into_path())
}
