//! File Version Tracker - content fingerprints for build inputs
//!
//! Features:
//! - BLAKE3 content hashing, never mtime alone
//! - Re-hash skipped while modification time and size are unchanged
//! - Parallel file hashing with Rayon
//! - Optional persistent hash cache (sled DB) shared across runs

use crate::error::Result;
use crate::hasher::ObjectId;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

/// Cached fingerprint of one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    pub modified_secs: u64,
    pub modified_nanos: u32,
    pub size: u64,
    pub hash: ObjectId,
}

impl FileVersion {
    fn matches(&self, stamp: &(u64, u32, u64)) -> bool {
        (self.modified_secs, self.modified_nanos, self.size) == *stamp
    }
}

/// Maps file paths to content fingerprints
pub struct FileVersionTracker {
    cache: RwLock<HashMap<PathBuf, FileVersion>>,
    db: Option<sled::Db>,
    hashed: AtomicUsize,
}

impl FileVersionTracker {
    /// In-memory tracker; fingerprints last for the life of the process
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            db: None,
            hashed: AtomicUsize::new(0),
        }
    }

    /// Tracker backed by a sled database at `db_path`
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let db = sled::open(db_path)?;
        debug!(path = %db_path.display(), entries = db.len(), "opened file version database");

        Ok(Self {
            cache: RwLock::new(HashMap::new()),
            db: Some(db),
            hashed: AtomicUsize::new(0),
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.db.is_some()
    }

    /// Current content hash of `path`, or `None` if it is not a readable file
    pub fn compute_file_hash(&self, path: impl AsRef<Path>) -> Option<ObjectId> {
        let path = path.as_ref();
        let metadata = fs::metadata(path).ok()?;
        if !metadata.is_file() {
            return None;
        }
        let modified = metadata
            .modified()
            .ok()
            .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
            .unwrap_or_default();
        let stamp = (modified.as_secs(), modified.subsec_nanos(), metadata.len());

        if let Some(version) = self.lookup(path) {
            if version.matches(&stamp) {
                return Some(version.hash);
            }
        }

        let hash = ObjectId::from_file(path).ok()?;
        self.hashed.fetch_add(1, Ordering::Relaxed);
        self.store(
            path,
            FileVersion {
                modified_secs: stamp.0,
                modified_nanos: stamp.1,
                size: stamp.2,
                hash,
            },
        );
        Some(hash)
    }

    /// Hash many files in parallel (Rayon)
    pub fn compute_file_hashes(&self, paths: &[PathBuf]) -> Vec<(PathBuf, Option<ObjectId>)> {
        paths
            .par_iter()
            .map(|path| (path.clone(), self.compute_file_hash(path)))
            .collect()
    }

    /// Forget the cached fingerprint of `path`
    pub fn invalidate(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        self.cache.write().unwrap().remove(path);
        if let Some(db) = &self.db {
            if let Err(e) = db.remove(db_key(path)) {
                warn!(path = %path.display(), "failed to drop file version: {}", e);
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        self.cache.write().unwrap().clear();
        if let Some(db) = &self.db {
            db.clear()?;
            db.flush()?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        if let Some(db) = &self.db {
            db.flush()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> TrackerStats {
        let cache = self.cache.read().unwrap();
        TrackerStats {
            tracked_files: cache.len(),
            hashed_files: self.hashed.load(Ordering::Relaxed),
            total_size: cache.values().map(|v| v.size).sum(),
        }
    }

    fn lookup(&self, path: &Path) -> Option<FileVersion> {
        if let Some(version) = self.cache.read().unwrap().get(path) {
            return Some(*version);
        }
        let db = self.db.as_ref()?;
        let bytes = db.get(db_key(path)).ok()??;
        let version: FileVersion = serde_json::from_slice(&bytes).ok()?;
        self.cache
            .write()
            .unwrap()
            .insert(path.to_path_buf(), version);
        Some(version)
    }

    fn store(&self, path: &Path, version: FileVersion) {
        self.cache
            .write()
            .unwrap()
            .insert(path.to_path_buf(), version);
        if let Some(db) = &self.db {
            let stored = serde_json::to_vec(&version)
                .map_err(|e| e.to_string())
                .and_then(|data| db.insert(db_key(path), data).map_err(|e| e.to_string()));
            if let Err(e) = stored {
                warn!(path = %path.display(), "failed to persist file version: {}", e);
            }
        }
    }
}

impl Default for FileVersionTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn db_key(path: &Path) -> Vec<u8> {
    path.to_string_lossy().as_bytes().to_vec()
}

#[derive(Debug)]
pub struct TrackerStats {
    pub tracked_files: usize,
    /// Files whose content was actually read and hashed
    pub hashed_files: usize,
    pub total_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_unchanged_file_is_not_rehashed() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("texture.png");
        fs::write(&file, b"pixels").unwrap();

        let tracker = FileVersionTracker::new();
        let first = tracker.compute_file_hash(&file).unwrap();
        let second = tracker.compute_file_hash(&file).unwrap();

        assert_eq!(first, second);
        assert_eq!(first, ObjectId::from_content(b"pixels"));
        assert_eq!(tracker.stats().hashed_files, 1);
    }

    #[test]
    fn test_content_change_is_detected() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("model.fbx");
        fs::write(&file, b"v1").unwrap();

        let tracker = FileVersionTracker::new();
        let before = tracker.compute_file_hash(&file).unwrap();
        fs::write(&file, b"version two").unwrap();
        let after = tracker.compute_file_hash(&file).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn test_missing_file_and_directory_have_no_hash() {
        let dir = tempdir().unwrap();
        let tracker = FileVersionTracker::new();
        assert!(tracker.compute_file_hash(dir.path().join("nope")).is_none());
        assert!(tracker.compute_file_hash(dir.path()).is_none());
    }

    #[test]
    fn test_persisted_versions_survive_reopen() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("sound.wav");
        fs::write(&file, b"samples").unwrap();
        let db_path = dir.path().join("db").join("versions");

        let expected = {
            let tracker = FileVersionTracker::open(&db_path).unwrap();
            let hash = tracker.compute_file_hash(&file).unwrap();
            tracker.flush().unwrap();
            hash
        };

        let tracker = FileVersionTracker::open(&db_path).unwrap();
        assert_eq!(tracker.compute_file_hash(&file), Some(expected));
        assert_eq!(tracker.stats().hashed_files, 0);
    }

    #[test]
    fn test_parallel_hashing() {
        let dir = tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..8)
            .map(|i| {
                let path = dir.path().join(format!("file{}.txt", i));
                fs::write(&path, format!("content {}", i)).unwrap();
                path
            })
            .collect();

        let tracker = FileVersionTracker::new();
        let hashes = tracker.compute_file_hashes(&paths);
        assert_eq!(hashes.len(), 8);
        assert!(hashes.iter().all(|(_, h)| h.is_some()));
        assert_eq!(tracker.stats().tracked_files, 8);
    }
}
