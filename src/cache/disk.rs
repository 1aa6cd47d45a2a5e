//! Entry file storage.
//!
//! Reads and writes envelope files under shared/exclusive advisory locks.
//! With atomic writes enabled the bytes go to a temp file in the target's
//! directory and are renamed over the final name, so readers never observe
//! a partial file. Corrupt files are reported as [`ReadOutcome::Corrupt`],
//! never as errors.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::cache::codec::Codec;
use crate::cache::entry::Envelope;
use crate::cache::key::KeyResolver;
use crate::cache::lock::{KeyLock, LockManager, LockMode};
use crate::config::Config;
use crate::error::{CacheError, Result};

// == Read Outcome ==
/// Result of reading one entry file.
#[derive(Debug)]
pub enum ReadOutcome {
    /// No file at the path
    Missing,
    /// File exists but does not decode; carries the decode error text
    Corrupt(String),
    /// Decoded envelope plus the file's modification time
    Found(Envelope, Option<SystemTime>),
}

/// One entry file discovered by a directory scan.
#[derive(Debug, Clone)]
pub struct EntryFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

// == Disk Store ==
#[derive(Debug)]
pub struct DiskStore {
    codec: Codec,
    locks: LockManager,
    atomic: bool,
    fsync: bool,
    file_mode: u32,
    dir_mode: u32,
    max_item_size: Option<usize>,
}

impl DiskStore {
    pub fn new(codec: Codec, locks: LockManager, config: &Config) -> Self {
        Self {
            codec,
            locks,
            atomic: config.atomic_writes,
            fsync: config.fsync,
            file_mode: config.file_mode,
            dir_mode: config.dir_mode,
            max_item_size: config.max_item_size,
        }
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    // == Encode ==
    /// Serializes an envelope and enforces the per-item size cap.
    ///
    /// Runs before any file I/O so oversized items never touch the disk.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let bytes = self.codec.encode(envelope)?;
        if let Some(max) = self.max_item_size {
            if bytes.len() > max {
                return Err(CacheError::Validation(format!(
                    "Item '{}' is {} bytes, exceeding the maximum of {} bytes",
                    envelope.key,
                    bytes.len(),
                    max
                )));
            }
        }
        Ok(bytes)
    }

    // == Read ==
    /// Reads `path` under a shared lock on `hash`.
    pub fn read(&self, hash: &str, path: &Path) -> Result<ReadOutcome> {
        if !path.exists() {
            return Ok(ReadOutcome::Missing);
        }
        let _guard = self.lock(hash, LockMode::Shared)?;
        self.read_unlocked(path)
    }

    /// Reads `path` while the caller already holds the key's lock.
    pub fn read_held(&self, path: &Path, _guard: &KeyLock) -> Result<ReadOutcome> {
        self.read_unlocked(path)
    }

    fn read_unlocked(&self, path: &Path) -> Result<ReadOutcome> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ReadOutcome::Missing),
            Err(e) => return Err(e.into()),
        };
        let modified = fs::metadata(path).and_then(|m| m.modified()).ok();
        match self.codec.decode(&bytes) {
            Ok(envelope) => Ok(ReadOutcome::Found(envelope, modified)),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Entry file failed to decode");
                Ok(ReadOutcome::Corrupt(e.to_string()))
            }
        }
    }

    // == Write ==
    /// Writes pre-encoded bytes while the caller holds the key's exclusive
    /// lock; callers keep it until their bookkeeping for the key is done.
    pub fn write_held(&self, path: &Path, bytes: &[u8], _guard: &KeyLock) -> Result<()> {
        self.write_unlocked(path, bytes)
    }

    fn write_unlocked(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| CacheError::Configuration(format!("no parent for {}", path.display())))?;
        self.ensure_dir(parent)?;

        if self.atomic {
            let mut tmp = NamedTempFile::new_in(parent)?;
            tmp.write_all(bytes)?;
            self.apply_file_mode(tmp.path())?;
            if self.fsync {
                tmp.as_file().sync_all()?;
            }
            tmp.persist(path).map_err(|e| CacheError::Io(e.error))?;
            if self.fsync {
                sync_dir(parent);
            }
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            file.write_all(bytes)?;
            if self.fsync {
                file.sync_all()?;
            }
            self.apply_file_mode(path)?;
        }
        Ok(())
    }

    // == Remove ==
    /// Deletes `path` under an exclusive lock; `Ok(false)` if already gone.
    pub fn remove(&self, hash: &str, path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        let _guard = self.lock(hash, LockMode::Exclusive)?;
        remove_file_if_exists(path)
    }

    pub fn remove_held(&self, path: &Path, _guard: &KeyLock) -> Result<bool> {
        remove_file_if_exists(path)
    }

    /// Acquires a key lock, turning a timeout into [`CacheError::LockTimeout`].
    pub fn lock(&self, hash: &str, mode: LockMode) -> Result<KeyLock> {
        self.locks.acquire(hash, mode)?.ok_or_else(|| {
            CacheError::LockTimeout(format!("{:?} lock on {} not acquired", mode, hash))
        })
    }

    /// Creates `dir` and any missing parents with the configured mode.
    pub fn ensure_dir(&self, dir: &Path) -> Result<()> {
        if dir.is_dir() {
            return Ok(());
        }
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(self.dir_mode);
        }
        builder.create(dir)?;
        Ok(())
    }

    #[cfg(unix)]
    fn apply_file_mode(&self, path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(self.file_mode))?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn apply_file_mode(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), error = %e, "Directory fsync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

// == Directory Scans ==
/// Lists every entry file under the resolver's root.
///
/// Unreadable directories are logged and skipped.
pub fn scan_entries(resolver: &KeyResolver) -> Vec<EntryFile> {
    let mut files = Vec::new();
    if !resolver.root().is_dir() {
        return files;
    }
    let lock_dir = resolver.lock_dir();
    let walker = WalkDir::new(resolver.root())
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.path() != lock_dir);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "Failed to read directory during entry scan");
                continue;
            }
        };
        if !entry.file_type().is_file() || !resolver.is_entry_file(entry.path()) {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            files.push(EntryFile {
                path: entry.into_path(),
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
    }
    files
}

/// Removes empty shard directories left behind by deletions.
pub fn prune_empty_dirs(resolver: &KeyResolver) {
    let lock_dir = resolver.lock_dir();
    let dirs: Vec<PathBuf> = WalkDir::new(resolver.root())
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_entry(|e| e.path() != lock_dir)
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect();
    for dir in dirs {
        // Fails harmlessly on non-empty directories.
        if fs::remove_dir(&dir).is_ok() {
            debug!(dir = %dir.display(), "Removed empty shard directory");
        }
    }
}

/// Best-effort removal of stale temp files from interrupted atomic writes.
pub fn remove_stale_temp_files(resolver: &KeyResolver, older_than: SystemTime) -> usize {
    let lock_dir = resolver.lock_dir();
    let mut removed = 0;
    for entry in WalkDir::new(resolver.root())
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.path() != lock_dir)
        .filter_map(|e| e.ok())
    {
        let is_temp = entry.file_type().is_file()
            && entry.file_name().to_string_lossy().starts_with(".tmp");
        if !is_temp {
            continue;
        }
        let stale = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .is_some_and(|modified| modified < older_than);
        if stale {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to remove stale temp file"),
            }
        }
    }
    removed
}
