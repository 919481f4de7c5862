//! Capsule lifecycle, metadata persistence, and crash rehydration.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use ccw_cel::{Cel, ExecRequest, ExecResult};
use ccw_common::diff::{count_changes, structural_diff, unified_diff};
use ccw_common::{next_id, ResourceUsage};

/// Environment variable injected into children of clock-shifted capsules.
pub const CLOCK_OFFSET_ENV: &str = "CCW_CLOCK_OFFSET";

/// Persisted description of one capsule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapsuleMetadata {
    pub capsule_id: String,
    pub workspace: PathBuf,
    pub base_dir: Option<PathBuf>,
    /// ISO-8601 UTC creation time.
    pub created_at: String,
    #[serde(default)]
    pub clock_offset_sec: i64,
    #[serde(default)]
    pub env_whitelist: Vec<String>,
    pub mount_point: Option<PathBuf>,
}

/// One live capsule: metadata plus its CEL and the usage of its last run.
pub struct CapsuleEntry {
    pub metadata: CapsuleMetadata,
    pub cel: Cel,
    pub last_usage: ResourceUsage,
}

/// Result of `capsule/create` and `capsule/clone`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateOutcome {
    pub capsule_id: String,
    pub mount: String,
    pub clock: String,
}

/// Result of `capsule/diff`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiffOutcome {
    pub summary: DiffSummary,
    pub diff: Value,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct DiffSummary {
    pub added: usize,
    pub deleted: usize,
    pub modified: usize,
}

/// Registry of capsules backed by `<storage>/capsules`.
pub struct CapsuleRegistry {
    storage_dir: PathBuf,
    capsules: HashMap<String, CapsuleEntry>,
}

impl CapsuleRegistry {
    pub fn new(storage_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(storage_dir)
            .with_context(|| format!("Failed to create {}", storage_dir.display()))?;
        Ok(Self {
            storage_dir: storage_dir.to_path_buf(),
            capsules: HashMap::new(),
        })
    }

    /// Create a capsule over `workspace` and persist its metadata.
    pub fn create(
        &mut self,
        workspace: &Path,
        base: Option<&Path>,
        clock_offset_sec: i64,
        env_whitelist: Vec<String>,
    ) -> Result<CreateOutcome> {
        let capsule_id = next_id("cap_");
        let workspace = workspace
            .canonicalize()
            .with_context(|| format!("workspace {} does not exist", workspace.display()))?;
        let base = match base {
            Some(p) => Some(
                p.canonicalize()
                    .with_context(|| format!("base {} does not exist", p.display()))?,
            ),
            None => None,
        };

        let mut cel = Cel::new(&workspace, base.as_deref())?;
        let mount = cel.mount()?;

        let metadata = CapsuleMetadata {
            capsule_id: capsule_id.clone(),
            workspace,
            base_dir: base,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            clock_offset_sec,
            env_whitelist,
            mount_point: Some(mount.clone()),
        };
        self.persist_metadata(&metadata)?;
        info!(capsule_id = %capsule_id, variant = cel.variant_name(), "capsule created");

        let outcome = CreateOutcome {
            capsule_id: capsule_id.clone(),
            mount: mount.to_string_lossy().into_owned(),
            clock: metadata.created_at.clone(),
        };
        self.capsules.insert(
            capsule_id,
            CapsuleEntry {
                metadata,
                cel,
                last_usage: ResourceUsage::default(),
            },
        );
        Ok(outcome)
    }

    /// Fetch a capsule, rehydrating from disk when it is not live.
    pub fn get(&mut self, capsule_id: &str) -> Option<&mut CapsuleEntry> {
        if !self.capsules.contains_key(capsule_id) {
            match self.rehydrate_one(capsule_id) {
                Ok(Some(entry)) => {
                    self.capsules.insert(capsule_id.to_string(), entry);
                }
                Ok(None) => return None,
                Err(e) => {
                    warn!(capsule_id, error = %e, "capsule rehydration failed");
                    return None;
                }
            }
        }
        self.capsules.get_mut(capsule_id)
    }

    /// Ids of all live capsules, ordered by issuance.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.capsules.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Delete a capsule: CEL cleanup plus metadata removal.
    pub fn delete(&mut self, capsule_id: &str) -> bool {
        let Some(mut entry) = self.capsules.remove(capsule_id) else {
            return false;
        };
        entry.cel.cleanup();
        let dir = self.storage_dir.join(capsule_id);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!(capsule_id, error = %e, "failed to remove capsule metadata");
            }
        }
        true
    }

    /// Execute a command in a capsule, restricting the host environment to
    /// the whitelist and injecting the clock offset.
    pub fn execute(
        &mut self,
        capsule_id: &str,
        cmd: Vec<String>,
        cwd: Option<PathBuf>,
        timeout_ms: u64,
        stdin: Option<String>,
    ) -> Result<ExecResult> {
        let Some(entry) = self.get(capsule_id) else {
            return Ok(not_found_result(capsule_id));
        };

        let mut env = HashMap::new();
        for var in &entry.metadata.env_whitelist {
            if let Ok(value) = std::env::var(var) {
                env.insert(var.clone(), value);
            }
        }
        if entry.metadata.clock_offset_sec != 0 {
            env.insert(
                CLOCK_OFFSET_ENV.to_string(),
                entry.metadata.clock_offset_sec.to_string(),
            );
        }

        let req = ExecRequest {
            cmd,
            cwd,
            env,
            timeout_ms,
            stdin,
        };
        let result = entry.cel.execute(&req)?;
        entry.last_usage = result.usage;

        let metadata = entry.metadata.clone();
        self.persist_metadata(&metadata)?;
        Ok(result)
    }

    /// Diff the capsule's changes against its base.
    ///
    /// `format` is `"unified"` (default) or `"json"`; summary counts for the
    /// unified form are derived from the diff text itself.
    pub fn diff(&mut self, capsule_id: &str, format: &str) -> Result<DiffOutcome> {
        let Some(entry) = self.get(capsule_id) else {
            return Ok(DiffOutcome {
                summary: DiffSummary::default(),
                diff: Value::String(String::new()),
            });
        };

        let changes = entry.cel.changes()?;
        let mount = entry.cel.mount_point().to_path_buf();
        let base = entry
            .metadata
            .base_dir
            .clone()
            .unwrap_or_else(|| entry.metadata.workspace.clone());

        let mut summary = DiffSummary::default();
        let mut unified_parts = Vec::new();
        let mut structural = serde_json::Map::new();

        for rel in &changes {
            let base_file = base.join(rel);
            let new_file = mount.join(rel);
            if base_file.exists() {
                summary.modified += 1;
            } else {
                summary.added += 1;
            }

            if format == "json" {
                let old = read_json(&base_file);
                let new = read_json(&new_file);
                structural.insert(rel.clone(), structural_diff(&old, &new));
            } else {
                unified_parts.push(unified_diff(&base_file, &new_file, 3)?);
            }
        }

        let diff = if format == "json" {
            Value::Object(structural)
        } else {
            let combined = unified_parts.join("\n");
            if !combined.is_empty() {
                let counts = count_changes(&combined);
                summary.added = counts.added;
                summary.deleted = counts.deleted;
            }
            Value::String(combined)
        };

        Ok(DiffOutcome { summary, diff })
    }

    /// Clone a capsule: a fresh CEL over the same base with the source's
    /// current changes replayed into the new mount.
    pub fn clone_capsule(
        &mut self,
        source_id: &str,
        new_workspace: Option<&Path>,
    ) -> Result<CreateOutcome> {
        let (workspace, base, changes, source_mount, clock_offset_sec, env_whitelist) = {
            let entry = self
                .get(source_id)
                .with_context(|| format!("capsule {source_id} not found"))?;
            (
                entry.metadata.workspace.clone(),
                entry.metadata.base_dir.clone(),
                entry.cel.changes()?,
                entry.cel.mount_point().to_path_buf(),
                entry.metadata.clock_offset_sec,
                entry.metadata.env_whitelist.clone(),
            )
        };

        let workspace = new_workspace.map(Path::to_path_buf).unwrap_or(workspace);
        let outcome = self.create(&workspace, base.as_deref(), clock_offset_sec, env_whitelist)?;

        // Replay the source's visible changes into the clone's mount.
        let clone_mount = PathBuf::from(&outcome.mount);
        for rel in &changes {
            let src = source_mount.join(rel);
            if !src.is_file() {
                continue;
            }
            let dst = clone_mount.join(rel);
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&src, &dst)
                .with_context(|| format!("Failed to replay {rel} into clone"))?;
        }

        Ok(outcome)
    }

    /// Rebuild the live map from persisted metadata. Invalid entries are
    /// logged and skipped. Returns the number of capsules recovered.
    pub fn rehydrate_on_startup(&mut self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.storage_dir) else {
            return 0;
        };
        let mut recovered = 0;
        for dir_entry in entries.flatten() {
            let id = dir_entry.file_name().to_string_lossy().into_owned();
            if self.capsules.contains_key(&id) {
                continue;
            }
            match self.rehydrate_one(&id) {
                Ok(Some(entry)) => {
                    self.capsules.insert(id, entry);
                    recovered += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(capsule_id = %id, error = %e, "skipping unrecoverable capsule"),
            }
        }
        if recovered > 0 {
            info!(recovered, "capsules rehydrated from storage");
        }
        recovered
    }

    /// Cleanup every live capsule's sandbox. Metadata stays on disk so the
    /// capsules can be rehydrated later.
    pub fn cleanup_all(&mut self) {
        for (id, entry) in self.capsules.iter_mut() {
            debug!(capsule_id = %id, "cleaning up capsule");
            entry.cel.cleanup();
        }
        self.capsules.clear();
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn rehydrate_one(&mut self, capsule_id: &str) -> Result<Option<CapsuleEntry>> {
        let meta_file = self.storage_dir.join(capsule_id).join("metadata.json");
        if !meta_file.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&meta_file)
            .with_context(|| format!("Failed to read {}", meta_file.display()))?;
        let mut metadata: CapsuleMetadata =
            serde_json::from_str(&raw).context("Failed to parse capsule metadata")?;

        let cel = match metadata.mount_point.as_deref() {
            Some(mount) if mount.exists() => Cel::rehydrate(
                &metadata.workspace,
                metadata.base_dir.as_deref(),
                mount,
            )?,
            _ => {
                // Sandbox is gone; rebuild a fresh mount from the base.
                let mut cel = Cel::new(&metadata.workspace, metadata.base_dir.as_deref())?;
                let mount = cel.mount()?;
                metadata.mount_point = Some(mount);
                self.persist_metadata(&metadata)?;
                cel
            }
        };

        debug!(capsule_id, "capsule rehydrated");
        Ok(Some(CapsuleEntry {
            metadata,
            cel,
            last_usage: ResourceUsage::default(),
        }))
    }

    fn persist_metadata(&self, metadata: &CapsuleMetadata) -> Result<()> {
        let dir = self.storage_dir.join(&metadata.capsule_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let file = dir.join("metadata.json");
        let json = serde_json::to_string_pretty(metadata)?;
        std::fs::write(&file, json)
            .with_context(|| format!("Failed to write {}", file.display()))?;
        Ok(())
    }
}

fn not_found_result(capsule_id: &str) -> ExecResult {
    ExecResult {
        exit_code: -1,
        stdout: String::new(),
        stderr: format!("Capsule {capsule_id} not found"),
        usage: ResourceUsage::default(),
        touched: Default::default(),
    }
}

fn read_json(path: &Path) -> Value {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _storage: TempDir,
        _workspace: TempDir,
        registry: CapsuleRegistry,
        workspace: PathBuf,
    }

    fn fixture() -> Fixture {
        let storage = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        std::fs::write(workspace.path().join("test.txt"), "original").unwrap();
        let registry = CapsuleRegistry::new(&storage.path().join("capsules")).unwrap();
        let path = workspace.path().to_path_buf();
        Fixture {
            _storage: storage,
            _workspace: workspace,
            registry,
            workspace: path,
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[test]
    fn create_persists_metadata() {
        let mut fx = fixture();
        let outcome = fx.registry.create(&fx.workspace, None, 0, vec![]).unwrap();
        assert!(outcome.capsule_id.starts_with("cap_"));

        let meta_file = fx
            .registry
            .storage_dir()
            .join(&outcome.capsule_id)
            .join("metadata.json");
        let metadata: CapsuleMetadata =
            serde_json::from_str(&std::fs::read_to_string(meta_file).unwrap()).unwrap();
        assert_eq!(metadata.capsule_id, outcome.capsule_id);
        assert_eq!(metadata.mount_point.unwrap().to_string_lossy(), outcome.mount);
    }

    #[test]
    fn exec_and_diff_track_modification() {
        let mut fx = fixture();
        let outcome = fx.registry.create(&fx.workspace, None, 0, vec![]).unwrap();
        let result = fx
            .registry
            .execute(
                &outcome.capsule_id,
                sh("printf modified > test.txt"),
                None,
                60_000,
                None,
            )
            .unwrap();
        assert_eq!(result.exit_code, 0);

        let diff = fx.registry.diff(&outcome.capsule_id, "unified").unwrap();
        assert_eq!(diff.summary.added, 1);
        assert_eq!(diff.summary.deleted, 1);
        assert_eq!(diff.summary.modified, 1);
        let text = diff.diff.as_str().unwrap();
        assert!(text.contains("-original"));
        assert!(text.contains("+modified"));

        // The host workspace is untouched.
        assert_eq!(
            std::fs::read_to_string(fx.workspace.join("test.txt")).unwrap(),
            "original"
        );
    }

    #[test]
    fn unknown_capsule_exec_is_soft_error() {
        let mut fx = fixture();
        let result = fx
            .registry
            .execute("cap_missing", sh("true"), None, 60_000, None)
            .unwrap();
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("not found"));
    }

    #[test]
    fn clock_offset_is_injected() {
        let mut fx = fixture();
        let outcome = fx.registry.create(&fx.workspace, None, 3600, vec![]).unwrap();
        let result = fx
            .registry
            .execute(
                &outcome.capsule_id,
                sh("printf '%s' \"$CCW_CLOCK_OFFSET\""),
                None,
                60_000,
                None,
            )
            .unwrap();
        assert_eq!(result.stdout, "3600");
    }

    #[test]
    fn rehydration_preserves_sandbox_state() {
        let mut fx = fixture();
        let outcome = fx.registry.create(&fx.workspace, None, 0, vec![]).unwrap();
        fx.registry
            .execute(
                &outcome.capsule_id,
                sh("printf hello > marker.txt"),
                None,
                60_000,
                None,
            )
            .unwrap();

        // Simulate a restart with the same storage directory.
        let storage = fx.registry.storage_dir().to_path_buf();
        drop(std::mem::replace(
            &mut fx.registry,
            CapsuleRegistry::new(&storage).unwrap(),
        ));
        let recovered = fx.registry.rehydrate_on_startup();
        assert_eq!(recovered, 1);

        let result = fx
            .registry
            .execute(&outcome.capsule_id, sh("cat marker.txt"), None, 60_000, None)
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hello");
    }

    #[test]
    fn delete_removes_sandbox_and_metadata() {
        let mut fx = fixture();
        let outcome = fx.registry.create(&fx.workspace, None, 0, vec![]).unwrap();
        let mount = PathBuf::from(&outcome.mount);
        assert!(fx.registry.delete(&outcome.capsule_id));
        assert!(!mount.exists());
        assert!(!fx
            .registry
            .storage_dir()
            .join(&outcome.capsule_id)
            .join("metadata.json")
            .exists());
        assert!(!fx.registry.delete(&outcome.capsule_id));
    }

    #[test]
    fn clone_carries_changes() {
        let mut fx = fixture();
        let source = fx.registry.create(&fx.workspace, None, 0, vec![]).unwrap();
        fx.registry
            .execute(
                &source.capsule_id,
                sh("printf cloned > pending.txt"),
                None,
                60_000,
                None,
            )
            .unwrap();

        let clone = fx.registry.clone_capsule(&source.capsule_id, None).unwrap();
        assert_ne!(clone.capsule_id, source.capsule_id);
        let content =
            std::fs::read_to_string(PathBuf::from(&clone.mount).join("pending.txt")).unwrap();
        assert_eq!(content, "cloned");
    }
}
