//! Directory scanning and change detection with a bounded worker pool.
//!
//! The scanner walks breadth-first, fanning each level out over at most
//! `SCAN_WORKERS` threads. Stat results can be cached in a [`StatCache`]
//! to keep repeated change-detection passes cheap.

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use crate::hashing::hash_file;

const SCAN_WORKERS: usize = 4;
const CACHE_CAPACITY: usize = 10_000;

/// Size threshold above which changed-file detection compares BLAKE3 digests
/// instead of raw bytes.
const LARGE_FILE_BYTES: u64 = 1024 * 1024;

/// Cached stat result for one path.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FileMeta {
    pub size: u64,
    pub mtime: SystemTime,
}

/// Thread-safe stat cache with FIFO eviction.
#[derive(Debug, Default)]
pub struct StatCache {
    inner: Mutex<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<PathBuf, FileMeta>,
    order: VecDeque<PathBuf>,
}

impl StatCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stat a path through the cache. Returns `None` for missing files.
    pub fn stat(&self, path: &Path) -> Option<FileMeta> {
        if let Some(meta) = self.get(path) {
            return Some(meta);
        }
        let meta = stat_file(path)?;
        self.put(path.to_path_buf(), meta);
        Some(meta)
    }

    pub fn get(&self, path: &Path) -> Option<FileMeta> {
        let inner = self.inner.lock().ok()?;
        inner.entries.get(path).copied()
    }

    pub fn put(&self, path: PathBuf, meta: FileMeta) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.entries.len() >= CACHE_CAPACITY {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
        if inner.entries.insert(path.clone(), meta).is_none() {
            inner.order.push_back(path);
        }
    }

    pub fn invalidate(&self, path: &Path) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.remove(path);
            inner.order.retain(|p| p != path);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
            inner.order.clear();
        }
    }
}

fn stat_file(path: &Path) -> Option<FileMeta> {
    let meta = fs::symlink_metadata(path).ok()?;
    if !meta.is_file() {
        return None;
    }
    Some(FileMeta {
        size: meta.len(),
        mtime: meta.modified().ok()?,
    })
}

/// Recursively list all regular files under `root`.
///
/// Levels of the directory tree are scanned in parallel with a bounded pool;
/// unreadable entries are skipped.
pub fn scan_files(root: &Path) -> Vec<PathBuf> {
    if !root.is_dir() {
        return Vec::new();
    }

    let mut files = Vec::new();
    let mut level = vec![root.to_path_buf()];

    while !level.is_empty() {
        let chunk_size = level.len().div_ceil(SCAN_WORKERS);
        let results: Vec<(Vec<PathBuf>, Vec<PathBuf>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = level
                .chunks(chunk_size)
                .map(|dirs| scope.spawn(move || scan_level(dirs)))
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().ok())
                .collect()
        });

        let mut next_level = Vec::new();
        for (found, dirs) in results {
            files.extend(found);
            next_level.extend(dirs);
        }
        level = next_level;
    }

    files.sort();
    files
}

fn scan_level(dirs: &[PathBuf]) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mut files = Vec::new();
    let mut subdirs = Vec::new();
    for dir in dirs {
        let Ok(entries) = fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(kind) = entry.file_type() else {
                continue;
            };
            if kind.is_file() {
                files.push(entry.path());
            } else if kind.is_dir() && !kind.is_symlink() {
                subdirs.push(entry.path());
            }
        }
    }
    (files, subdirs)
}

/// Find regular files under `new_dir` that differ from `base_dir`.
///
/// Comparison is (size, mtime) first; when sizes match but mtimes differ the
/// contents are compared byte-for-byte, switching to BLAKE3 digests for files
/// larger than 1 MiB. Files absent from the base are always reported.
pub fn find_changed_files(
    base_dir: &Path,
    new_dir: &Path,
    cache: Option<&StatCache>,
) -> Result<BTreeSet<PathBuf>> {
    let mut changed = BTreeSet::new();

    let base_map = relative_map(base_dir);
    let new_map = relative_map(new_dir);

    for (rel, new_path) in &new_map {
        let Some(base_path) = base_map.get(rel) else {
            changed.insert(rel.clone());
            continue;
        };

        let base_meta = stat_via(cache, base_path);
        let new_meta = stat_via(cache, new_path);
        let (Some(base_meta), Some(new_meta)) = (base_meta, new_meta) else {
            changed.insert(rel.clone());
            continue;
        };

        if base_meta.size != new_meta.size {
            changed.insert(rel.clone());
        } else if base_meta.mtime != new_meta.mtime
            && !contents_equal(base_path, new_path, base_meta.size)?
        {
            changed.insert(rel.clone());
        }
    }

    Ok(changed)
}

fn stat_via(cache: Option<&StatCache>, path: &Path) -> Option<FileMeta> {
    match cache {
        Some(cache) => cache.stat(path),
        None => stat_file(path),
    }
}

fn relative_map(root: &Path) -> BTreeMap<PathBuf, PathBuf> {
    let mut map = BTreeMap::new();
    for file in scan_files(root) {
        if let Ok(rel) = file.strip_prefix(root) {
            map.insert(rel.to_path_buf(), file.clone());
        }
    }
    map
}

fn contents_equal(a: &Path, b: &Path, size: u64) -> Result<bool> {
    if size > LARGE_FILE_BYTES {
        return Ok(hash_file(a)? == hash_file(b)?);
    }
    let bytes_a = fs::read(a)?;
    let bytes_b = fs::read(b)?;
    Ok(bytes_a == bytes_b)
}
