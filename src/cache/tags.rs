//! Tag index: tag -> set of logical keys, persisted as one JSON file.
//!
//! The whole file is rewritten (temp file + rename) on every structural
//! change. Each mutation re-reads the file under an exclusive lock so that
//! several engine instances sharing a root do not lose each other's updates.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::cache::lock::{KeyLock, LockManager, LockMode};
use crate::error::{CacheError, Result};

/// Lock name guarding the index file.
const TAG_INDEX_LOCK: &str = "tag_index";

type TagMap = BTreeMap<String, BTreeSet<String>>;

// == Tag Index ==
#[derive(Debug, Clone)]
pub struct TagIndex {
    path: PathBuf,
    locks: LockManager,
}

impl TagIndex {
    pub fn new(path: impl Into<PathBuf>, locks: LockManager) -> Self {
        Self {
            path: path.into(),
            locks,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // == Reads ==
    /// Keys currently indexed under `tag`, sorted.
    pub fn keys_for(&self, tag: &str) -> Result<Vec<String>> {
        let _guard = self.lock(LockMode::Shared)?;
        Ok(self
            .load()?
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default())
    }

    // == Mutations ==
    /// Reconciles `key`: drops it from every bucket, then adds it under `tags`.
    pub fn replace_key_tags(&self, key: &str, tags: &[String]) -> Result<()> {
        self.mutate(|map| {
            let before = map.clone();
            detach_key(map, key);
            for tag in tags {
                map.entry(tag.clone()).or_default().insert(key.to_string());
            }
            *map != before
        })
    }

    /// Drops `key` from every bucket.
    pub fn remove_key(&self, key: &str) -> Result<()> {
        self.mutate(|map| detach_key(map, key))
    }

    /// Removes the bucket for `tag`.
    pub fn drop_tag(&self, tag: &str) -> Result<()> {
        self.mutate(|map| map.remove(tag).is_some())
    }

    /// Keeps only keys for which `keep` returns true.
    pub fn retain_keys(&self, mut keep: impl FnMut(&str) -> bool) -> Result<usize> {
        let mut removed = 0;
        self.mutate(|map| {
            for keys in map.values_mut() {
                let before = keys.len();
                keys.retain(|k| keep(k));
                removed += before - keys.len();
            }
            map.retain(|_, keys| !keys.is_empty());
            removed > 0
        })?;
        Ok(removed)
    }

    /// Deletes the index file.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock(LockMode::Exclusive)?;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn mutate(&self, apply: impl FnOnce(&mut TagMap) -> bool) -> Result<()> {
        let _guard = self.lock(LockMode::Exclusive)?;
        let mut map = self.load()?;
        if apply(&mut map) {
            self.save(&map)?;
        }
        Ok(())
    }

    fn lock(&self, mode: LockMode) -> Result<KeyLock> {
        self.locks.acquire(TAG_INDEX_LOCK, mode)?.ok_or_else(|| {
            CacheError::LockTimeout(format!("{:?} lock on tag index not acquired", mode))
        })
    }

    /// Reads the index; a missing file is empty, a corrupt one is discarded.
    fn load(&self) -> Result<TagMap> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(TagMap::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&raw) {
            Ok(map) => Ok(map),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Tag index is corrupt, starting empty");
                Ok(TagMap::new())
            }
        }
    }

    fn save(&self, map: &TagMap) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| CacheError::Configuration("tag index has no parent".to_string()))?;
        fs::create_dir_all(parent)?;
        let bytes =
            serde_json::to_vec(map).map_err(|e| CacheError::Serialization(e.to_string()))?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(&bytes)?;
        tmp.persist(&self.path).map_err(|e| CacheError::Io(e.error))?;
        debug!(tags = map.len(), "Tag index saved");
        Ok(())
    }
}

fn detach_key(map: &mut TagMap, key: &str) -> bool {
    let mut changed = false;
    map.retain(|_, keys| {
        changed |= keys.remove(key);
        !keys.is_empty()
    });
    changed
}
