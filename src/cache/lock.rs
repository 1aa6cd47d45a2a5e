//! Advisory per-key locking.
//!
//! Each key hash gets a lock file under `<root>/locks/<hash>.lock`. Readers
//! take a shared `flock`, writers an exclusive one. Acquisition is
//! non-blocking and retried with jittered delays within a bounded budget, so
//! a stuck holder makes the caller fail instead of hanging.
//!
//! Lock files may be pruned while nobody holds them. A holder checks after
//! locking that its descriptor still refers to the file at the lock path and
//! retries otherwise, so a pruned file never splits the lock.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Result;

/// Spread applied to each retry delay, as a fraction of the base delay.
const JITTER_FRACTION: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

// == Key Lock ==
/// RAII guard for an acquired advisory lock; released on drop.
#[derive(Debug)]
pub struct KeyLock {
    file: Option<File>,
    name: String,
}

impl KeyLock {
    /// Guard for a disabled lock manager; holds nothing.
    fn unlocked(name: &str) -> Self {
        Self {
            file: None,
            name: name.to_string(),
        }
    }

    /// False when locking is disabled and this guard is a placeholder.
    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                debug!(lock = %self.name, error = %e, "Failed to release lock explicitly");
            }
        }
    }
}

// == Lock Manager ==
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    enabled: bool,
    timeout: Duration,
    retries: u32,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>, config: &Config) -> Self {
        Self {
            dir: dir.into(),
            enabled: config.locking,
            timeout: Duration::from_millis(config.lock_timeout_ms),
            retries: config.lock_retries.max(1),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", name))
    }

    /// Acquires the lock called `name`.
    ///
    /// Returns `Ok(None)` when the lock stayed contended for the whole
    /// retry budget, and `Err` only for filesystem failures.
    pub fn acquire(&self, name: &str, mode: LockMode) -> Result<Option<KeyLock>> {
        if !self.enabled {
            return Ok(Some(KeyLock::unlocked(name)));
        }

        fs::create_dir_all(&self.dir)?;
        let path = self.lock_path(name);
        let base_delay = self.timeout / self.retries;
        let deadline = Instant::now() + self.timeout;
        let mut rng = rand::thread_rng();

        for attempt in 1..=self.retries {
            let file = open_lock_file(&path)?;
            match try_lock(&file, mode) {
                Ok(()) => {
                    if still_linked(&file, &path)? {
                        return Ok(Some(KeyLock {
                            file: Some(file),
                            name: name.to_string(),
                        }));
                    }
                    // Pruned between open and lock; reopen the fresh file.
                    debug!(lock = name, "Lock file replaced while locking, retrying");
                }
                Err(e) if is_contended(&e) => {}
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if attempt == self.retries || now >= deadline {
                break;
            }
            thread::sleep(jittered(base_delay, &mut rng).min(deadline - now));
        }

        warn!(
            lock = name,
            ?mode,
            timeout_ms = self.timeout.as_millis() as u64,
            retries = self.retries,
            "Lock acquisition timed out"
        );
        Ok(None)
    }

    /// Deletes lock files nobody currently holds.
    ///
    /// Each file is locked exclusively before it is unlinked; busy files are
    /// left in place.
    ///
    /// # Returns
    /// Number of lock files removed.
    pub fn prune(&self) -> Result<usize> {
        if !self.enabled {
            return Ok(0);
        }
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "lock") {
                continue;
            }
            let Ok(file) = open_lock_file(&path) else {
                continue;
            };
            if FileExt::try_lock_exclusive(&file).is_err() {
                continue;
            }
            if still_linked(&file, &path)? && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
            let _ = FileExt::unlock(&file);
        }
        debug!(removed, dir = %self.dir.display(), "Pruned idle lock files");
        Ok(removed)
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
    match mode {
        LockMode::Shared => FileExt::try_lock_shared(file),
        LockMode::Exclusive => FileExt::try_lock_exclusive(file),
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Base delay +/- 20%.
fn jittered(base: Duration, rng: &mut impl Rng) -> Duration {
    base.mul_f64(1.0 + rng.gen_range(-JITTER_FRACTION..=JITTER_FRACTION))
}

/// True when `file` is still the file found at `path`.
#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> io::Result<bool> {
    Ok(path.exists())
}
