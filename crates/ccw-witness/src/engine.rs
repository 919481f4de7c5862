//! Witness build, persistence, and replay verification.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::archive;
use ccw_common::{hash_bytes, hash_file, next_id};

const MANIFEST_FILE: &str = "manifest.json";
const HASHES_FILE: &str = "hashes.json";
const RECORD_FILE: &str = "witness.json";

/// Manifest written at the root of every witness directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WitnessManifest {
    pub witness_id: String,
    pub capsule_id: String,
    pub created_at: String,
    pub changes: Vec<String>,
    pub compress: String,
    pub include_blobs: bool,
}

/// Engine metadata record, persisted beside the manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WitnessRecord {
    pub witness_id: String,
    pub capsule_id: String,
    pub created_at: String,
    pub root_hash: String,
    pub compressed: bool,
    pub size_bytes: u64,
}

/// Result of `capsule/witness`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WitnessOutcome {
    pub witness_id: String,
    pub path: String,
    pub root_hash: String,
    pub size_bytes: u64,
}

/// Result of `capsule/replay`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplayOutcome {
    pub replay_ok: bool,
    pub root_hash: String,
    pub metrics: ReplayMetrics,
}

/// Placeholder metric shape kept stable for consumers.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ReplayMetrics {
    pub cpu_ms: u64,
    pub rss_max_kb: u64,
}

/// Witness engine backed by `<storage>/witnesses`.
pub struct WitnessEngine {
    storage_dir: PathBuf,
    records: HashMap<String, WitnessRecord>,
}

impl WitnessEngine {
    pub fn new(storage_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(storage_dir)
            .with_context(|| format!("Failed to create {}", storage_dir.display()))?;
        Ok(Self {
            storage_dir: storage_dir.to_path_buf(),
            records: HashMap::new(),
        })
    }

    /// Build a witness package from a capsule's mount and change set.
    pub fn create(
        &mut self,
        capsule_id: &str,
        mount: &Path,
        changes: &[String],
        compress: &str,
        include_blobs: bool,
    ) -> Result<WitnessOutcome> {
        let witness_id = next_id("wit_");
        let witness_dir = self.storage_dir.join(&witness_id);
        std::fs::create_dir_all(&witness_dir)
            .with_context(|| format!("Failed to create {}", witness_dir.display()))?;

        let manifest = WitnessManifest {
            witness_id: witness_id.clone(),
            capsule_id: capsule_id.to_string(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            changes: changes.to_vec(),
            compress: compress.to_string(),
            include_blobs,
        };
        let manifest_path = witness_dir.join(MANIFEST_FILE);
        std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)
            .context("Failed to write manifest")?;

        // Hash every change that is a regular file at witness time; dedupe
        // blobs by their hex digest.
        let mut hashes: BTreeMap<String, String> = BTreeMap::new();
        let blobs_dir = witness_dir.join("blobs");
        if include_blobs {
            std::fs::create_dir_all(&blobs_dir)?;
        }
        for change in changes {
            let file_path = mount.join(change);
            if !file_path.is_file() {
                continue;
            }
            let digest = hash_file(&file_path)?;
            if include_blobs {
                let blob_path = blobs_dir.join(digest.trim_start_matches("blake3:"));
                if !blob_path.exists() {
                    std::fs::copy(&file_path, &blob_path).with_context(|| {
                        format!("Failed to copy blob for {change}")
                    })?;
                }
            }
            hashes.insert(change.clone(), digest);
        }
        let hashes_path = witness_dir.join(HASHES_FILE);
        std::fs::write(&hashes_path, serde_json::to_string_pretty(&hashes)?)
            .context("Failed to write hashes")?;

        let root_hash = compute_root_hash(&witness_dir)?;

        let mut compressed = false;
        if compress == "zstd" {
            let archive_name = format!("{witness_id}.tar.zst");
            let archive_path = witness_dir.join(&archive_name);
            match archive::pack(&witness_dir, &archive_path, &[archive_name.as_str(), RECORD_FILE]) {
                Ok(()) => compressed = true,
                Err(e) => warn!(witness_id = %witness_id, error = %e, "witness archiving failed"),
            }
        }

        let size_bytes = dir_size(&witness_dir);
        let record = WitnessRecord {
            witness_id: witness_id.clone(),
            capsule_id: capsule_id.to_string(),
            created_at: manifest.created_at.clone(),
            root_hash: root_hash.clone(),
            compressed,
            size_bytes,
        };
        std::fs::write(
            witness_dir.join(RECORD_FILE),
            serde_json::to_string_pretty(&record)?,
        )
        .context("Failed to write witness record")?;
        self.records.insert(witness_id.clone(), record);
        info!(witness_id = %witness_id, capsule_id, files = hashes.len(), "witness created");

        Ok(WitnessOutcome {
            witness_id,
            path: witness_dir.to_string_lossy().into_owned(),
            root_hash,
            size_bytes,
        })
    }

    /// Re-derive a witness's root hash and compare it with the recorded one.
    ///
    /// A witness whose directory contents were replaced by its archive is
    /// unpacked first. When no record is known the computed root is returned
    /// with `replay_ok = true` for the caller to compare.
    pub fn replay(&mut self, witness_id: &str) -> Result<ReplayOutcome> {
        let witness_dir = self.storage_dir.join(witness_id);
        if !witness_dir.exists() {
            return Ok(ReplayOutcome {
                replay_ok: false,
                root_hash: String::new(),
                metrics: ReplayMetrics::default(),
            });
        }

        let archive_path = witness_dir.join(format!("{witness_id}.tar.zst"));
        if !witness_dir.join(MANIFEST_FILE).exists() && archive_path.exists() {
            archive::unpack(&archive_path, &witness_dir)?;
        }

        let root_hash = compute_root_hash(&witness_dir)?;
        let expected = self
            .records
            .get(witness_id)
            .map(|r| r.root_hash.clone())
            .or_else(|| load_record(&witness_dir).map(|r| r.root_hash));

        let replay_ok = match expected {
            Some(expected) => expected == root_hash,
            None => true,
        };

        Ok(ReplayOutcome {
            replay_ok,
            root_hash,
            metrics: ReplayMetrics::default(),
        })
    }

    /// Load persisted witness records back into memory. Returns how many
    /// were recovered.
    pub fn rehydrate_on_startup(&mut self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.storage_dir) else {
            return 0;
        };
        let mut recovered = 0;
        for entry in entries.flatten() {
            let id = entry.file_name().to_string_lossy().into_owned();
            if self.records.contains_key(&id) {
                continue;
            }
            if let Some(record) = load_record(&entry.path()) {
                self.records.insert(id, record);
                recovered += 1;
            }
        }
        recovered
    }

    /// Ids of all known witnesses, ordered by issuance.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn record(&self, witness_id: &str) -> Option<&WitnessRecord> {
        self.records.get(witness_id)
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }
}

/// Root hash = BLAKE3 over manifest.json bytes followed by hashes.json bytes.
fn compute_root_hash(witness_dir: &Path) -> Result<String> {
    let mut combined = Vec::new();
    for name in [MANIFEST_FILE, HASHES_FILE] {
        let path = witness_dir.join(name);
        if path.exists() {
            combined.extend(
                std::fs::read(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
            );
        }
    }
    Ok(hash_bytes(&combined))
}

fn load_record(witness_dir: &Path) -> Option<WitnessRecord> {
    let raw = std::fs::read_to_string(witness_dir.join(RECORD_FILE)).ok()?;
    serde_json::from_str(&raw).ok()
}

fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mount_with_files() -> TempDir {
        let mount = TempDir::new().unwrap();
        std::fs::write(mount.path().join("test.txt"), "modified").unwrap();
        std::fs::create_dir_all(mount.path().join("sub")).unwrap();
        std::fs::write(mount.path().join("sub/other.txt"), "content").unwrap();
        mount
    }

    #[test]
    fn create_then_replay_round_trips() {
        let storage = TempDir::new().unwrap();
        let mount = mount_with_files();
        let mut engine = WitnessEngine::new(storage.path()).unwrap();

        let changes = vec!["test.txt".to_string(), "sub/other.txt".to_string()];
        let outcome = engine
            .create("cap_1", mount.path(), &changes, "none", true)
            .unwrap();
        assert!(outcome.witness_id.starts_with("wit_"));
        assert!(outcome.root_hash.starts_with("blake3:"));
        assert!(outcome.size_bytes > 0);

        let replay = engine.replay(&outcome.witness_id).unwrap();
        assert!(replay.replay_ok);
        assert_eq!(replay.root_hash, outcome.root_hash);
    }

    #[test]
    fn blobs_are_content_addressed() {
        let storage = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        // Two files with identical contents share one blob.
        std::fs::write(mount.path().join("a.txt"), "same").unwrap();
        std::fs::write(mount.path().join("b.txt"), "same").unwrap();

        let mut engine = WitnessEngine::new(storage.path()).unwrap();
        let changes = vec!["a.txt".to_string(), "b.txt".to_string()];
        let outcome = engine
            .create("cap_1", mount.path(), &changes, "none", true)
            .unwrap();

        let blobs_dir = PathBuf::from(&outcome.path).join("blobs");
        let blobs: Vec<_> = std::fs::read_dir(blobs_dir).unwrap().collect();
        assert_eq!(blobs.len(), 1);
    }

    #[test]
    fn missing_files_are_skipped() {
        let storage = TempDir::new().unwrap();
        let mount = mount_with_files();
        let mut engine = WitnessEngine::new(storage.path()).unwrap();

        let changes = vec!["test.txt".to_string(), "ghost.txt".to_string()];
        let outcome = engine
            .create("cap_1", mount.path(), &changes, "none", true)
            .unwrap();

        let hashes: BTreeMap<String, String> = serde_json::from_str(
            &std::fs::read_to_string(PathBuf::from(&outcome.path).join("hashes.json")).unwrap(),
        )
        .unwrap();
        assert!(hashes.contains_key("test.txt"));
        assert!(!hashes.contains_key("ghost.txt"));
    }

    #[test]
    fn tampering_breaks_replay() {
        let storage = TempDir::new().unwrap();
        let mount = mount_with_files();
        let mut engine = WitnessEngine::new(storage.path()).unwrap();

        let changes = vec!["test.txt".to_string()];
        let outcome = engine
            .create("cap_1", mount.path(), &changes, "none", false)
            .unwrap();

        let hashes_path = PathBuf::from(&outcome.path).join("hashes.json");
        std::fs::write(&hashes_path, "{\"test.txt\": \"blake3:bad\"}").unwrap();

        let replay = engine.replay(&outcome.witness_id).unwrap();
        assert!(!replay.replay_ok);
    }

    #[test]
    fn compressed_witness_replays_after_content_loss() {
        let storage = TempDir::new().unwrap();
        let mount = mount_with_files();
        let mut engine = WitnessEngine::new(storage.path()).unwrap();

        let changes = vec!["test.txt".to_string()];
        let outcome = engine
            .create("cap_1", mount.path(), &changes, "zstd", true)
            .unwrap();

        let witness_dir = PathBuf::from(&outcome.path);
        assert!(witness_dir
            .join(format!("{}.tar.zst", outcome.witness_id))
            .exists());

        // Drop the plain files; replay must restore them from the archive.
        std::fs::remove_file(witness_dir.join("manifest.json")).unwrap();
        std::fs::remove_file(witness_dir.join("hashes.json")).unwrap();
        std::fs::remove_dir_all(witness_dir.join("blobs")).unwrap();

        let replay = engine.replay(&outcome.witness_id).unwrap();
        assert!(replay.replay_ok);
        assert_eq!(replay.root_hash, outcome.root_hash);
    }

    #[test]
    fn unknown_witness_fails_replay() {
        let storage = TempDir::new().unwrap();
        let mut engine = WitnessEngine::new(storage.path()).unwrap();
        let replay = engine.replay("wit_nope").unwrap();
        assert!(!replay.replay_ok);
        assert!(replay.root_hash.is_empty());
    }

    #[test]
    fn records_survive_restart() {
        let storage = TempDir::new().unwrap();
        let mount = mount_with_files();
        let outcome = {
            let mut engine = WitnessEngine::new(storage.path()).unwrap();
            engine
                .create("cap_1", mount.path(), &["test.txt".to_string()], "none", false)
                .unwrap()
        };

        let mut engine = WitnessEngine::new(storage.path()).unwrap();
        assert_eq!(engine.rehydrate_on_startup(), 1);
        assert_eq!(
            engine.record(&outcome.witness_id).unwrap().root_hash,
            outcome.root_hash
        );
        let replay = engine.replay(&outcome.witness_id).unwrap();
        assert!(replay.replay_ok);
    }

    #[test]
    fn empty_change_set_still_witnesses() {
        let storage = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        let mut engine = WitnessEngine::new(storage.path()).unwrap();

        let outcome = engine.create("cap_1", mount.path(), &[], "none", true).unwrap();
        assert!(outcome.root_hash.starts_with("blake3:"));
        let replay = engine.replay(&outcome.witness_id).unwrap();
        assert!(replay.replay_ok);
        assert_eq!(replay.root_hash, outcome.root_hash);
    }
}
