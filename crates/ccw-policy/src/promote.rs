//! Policy-gated atomic promotion of capsule changes to the host.

use filetime::FileTime;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::engine::{PolicyEngine, PolicyReport, ValidationInput};
use ccw_common::ResourceUsage;

/// Inputs to one promotion attempt.
pub struct PromoteRequest<'a> {
    pub mount: &'a Path,
    pub target: &'a Path,
    pub changes: &'a [String],
    pub policies: &'a [String],
    pub usage: ResourceUsage,
    pub replay_hash: Option<&'a str>,
    pub expected_hash: Option<&'a str>,
    pub dry_run: bool,
}

/// Result of `capsule/promote`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromoteResult {
    pub promoted: bool,
    pub applied: Vec<String>,
    pub policy_report: PolicyReport,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Validate and, when every check passes, copy changes into the target.
///
/// Each file is installed atomically: content goes to a `.<name>.tmp`
/// sibling first and is renamed over the destination, preserving the source
/// mode and mtime. An I/O error aborts the batch; files already renamed
/// stay in place and are reported in `applied` so callers can retry.
pub fn promote(engine: &PolicyEngine, req: &PromoteRequest) -> PromoteResult {
    let report = engine.validate(&ValidationInput {
        policy_names: req.policies,
        changed_paths: req.changes,
        usage: req.usage,
        replay_hash: req.replay_hash,
        expected_hash: req.expected_hash,
        workspace: Some(req.target),
    });

    if !report.passed {
        return PromoteResult {
            promoted: false,
            applied: Vec::new(),
            error: format!("Policy validation failed: {}", report.details),
            policy_report: report,
        };
    }

    if req.dry_run {
        return PromoteResult {
            promoted: false,
            applied: req.changes.to_vec(),
            error: "Dry run - no changes applied".to_string(),
            policy_report: report,
        };
    }

    let mut applied = Vec::new();
    for change in req.changes {
        let src = req.mount.join(change);
        if !src.is_file() {
            continue;
        }
        if let Err(e) = install_file(&src, req.target, change) {
            warn!(change, error = %e, "promotion aborted mid-batch");
            return PromoteResult {
                promoted: false,
                applied,
                policy_report: report,
                error: format!("Failed to apply changes: {e}"),
            };
        }
        applied.push(change.clone());
    }

    info!(count = applied.len(), "changes promoted");
    PromoteResult {
        promoted: true,
        applied,
        policy_report: report,
        error: String::new(),
    }
}

fn install_file(src: &Path, target: &Path, change: &str) -> std::io::Result<()> {
    let dst = target.join(change);
    let parent = dst.parent().unwrap_or(target);
    std::fs::create_dir_all(parent)?;

    let file_name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| change.to_string());
    let tmp = parent.join(format!(".{file_name}.tmp"));

    let result = (|| {
        std::fs::copy(src, &tmp)?;
        // Carry the source mode and mtime across the rename.
        let meta = std::fs::metadata(src)?;
        std::fs::set_permissions(&tmp, meta.permissions())?;
        filetime::set_file_mtime(&tmp, FileTime::from_last_modification_time(&meta))?;
        std::fs::rename(&tmp, &dst)
    })();

    if result.is_err() && tmp.exists() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PolicyRule;
    use tempfile::TempDir;

    fn permissive_engine() -> PolicyEngine {
        let mut engine = PolicyEngine::new();
        engine.set_policy(PolicyRule {
            name: "open".to_string(),
            max_rss_mb: None,
            max_cpu_ms: None,
            deny_paths: vec![],
            require_tests: vec![],
            require_replay_ok: false,
        });
        engine
    }

    fn request<'a>(
        mount: &'a Path,
        target: &'a Path,
        changes: &'a [String],
        policies: &'a [String],
    ) -> PromoteRequest<'a> {
        PromoteRequest {
            mount,
            target,
            changes,
            policies,
            usage: ResourceUsage::default(),
            replay_hash: None,
            expected_hash: None,
            dry_run: false,
        }
    }

    #[test]
    fn promote_applies_changes_atomically() {
        let mount = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        std::fs::create_dir_all(mount.path().join("sub")).unwrap();
        std::fs::write(mount.path().join("sub/file.txt"), "promoted").unwrap();

        let engine = permissive_engine();
        let changes = vec!["sub/file.txt".to_string()];
        let policies = vec!["open".to_string()];
        let result = promote(&engine, &request(mount.path(), target.path(), &changes, &policies));

        assert!(result.promoted);
        assert_eq!(result.applied, changes);
        assert_eq!(
            std::fs::read_to_string(target.path().join("sub/file.txt")).unwrap(),
            "promoted"
        );
        // No temp residue.
        assert!(!target.path().join("sub/.file.txt.tmp").exists());
    }

    #[test]
    fn dry_run_leaves_target_untouched() {
        let mount = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        std::fs::write(mount.path().join("f.txt"), "x").unwrap();

        let engine = permissive_engine();
        let changes = vec!["f.txt".to_string()];
        let policies = vec!["open".to_string()];
        let mut req = request(mount.path(), target.path(), &changes, &policies);
        req.dry_run = true;
        let result = promote(&engine, &req);

        assert!(!result.promoted);
        assert_eq!(result.applied, changes);
        assert!(result.policy_report.passed);
        assert!(!target.path().join("f.txt").exists());
    }

    #[test]
    fn failed_policy_blocks_promotion() {
        let mount = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        std::fs::write(mount.path().join("test.txt"), "x").unwrap();

        let mut engine = PolicyEngine::new();
        engine.set_policy(PolicyRule {
            name: "p".to_string(),
            max_rss_mb: None,
            max_cpu_ms: None,
            deny_paths: vec!["test.txt".to_string()],
            require_tests: vec![],
            require_replay_ok: false,
        });

        let changes = vec!["test.txt".to_string()];
        let policies = vec!["p".to_string()];
        let result = promote(&engine, &request(mount.path(), target.path(), &changes, &policies));

        assert!(!result.promoted);
        assert!(result.applied.is_empty());
        assert!(!result.policy_report.paths_ok);
        assert!(result
            .policy_report
            .deny_paths
            .contains(&"test.txt".to_string()));
        assert!(!target.path().join("test.txt").exists());
    }

    #[test]
    fn missing_sources_are_skipped() {
        let mount = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        std::fs::write(mount.path().join("real.txt"), "here").unwrap();

        let engine = permissive_engine();
        let changes = vec!["real.txt".to_string(), "ghost.txt".to_string()];
        let policies = vec!["open".to_string()];
        let result = promote(&engine, &request(mount.path(), target.path(), &changes, &policies));

        assert!(result.promoted);
        assert_eq!(result.applied, vec!["real.txt".to_string()]);
    }

    #[test]
    fn mode_is_preserved() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let mount = TempDir::new().unwrap();
            let target = TempDir::new().unwrap();
            let script = mount.path().join("run.sh");
            std::fs::write(&script, "#!/bin/sh\n").unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

            let engine = permissive_engine();
            let changes = vec!["run.sh".to_string()];
            let policies = vec!["open".to_string()];
            let result =
                promote(&engine, &request(mount.path(), target.path(), &changes, &policies));
            assert!(result.promoted);

            let mode = std::fs::metadata(target.path().join("run.sh"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }
}
