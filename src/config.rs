//! Configuration Module
//!
//! Handles loading, validating and managing cache engine configuration from
//! environment variables or a JSON file.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{CacheError, Result};

/// Deepest supported shard nesting (two hash characters per level).
pub const MAX_SHARD_DEPTH: usize = 8;

// == Serializer Kind ==
/// On-disk envelope format, chosen once per cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    /// Compact in-process binary format (bincode)
    Native,
    /// JSON text
    Json,
    /// MessagePack
    #[serde(alias = "messagepack")]
    Msgpack,
}

impl FromStr for SerializerKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "native" | "bincode" => Ok(Self::Native),
            "json" => Ok(Self::Json),
            "msgpack" | "messagepack" => Ok(Self::Msgpack),
            other => Err(CacheError::Validation(format!(
                "unknown serializer '{}'",
                other
            ))),
        }
    }
}

// == Hash Algorithm ==
/// Hash used to turn a full key into a file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-256, 64 hex characters
    Sha256,
    /// xxh3 128-bit, 32 hex characters
    Xxh3,
}

impl FromStr for HashAlgorithm {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "xxh3" | "xxhash" => Ok(Self::Xxh3),
            other => Err(CacheError::Validation(format!(
                "unknown hash algorithm '{}'",
                other
            ))),
        }
    }
}

// == Error Mode ==
/// How facade operations surface failures to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    /// Return the error
    Throw,
    /// Log a warning and return a safe default
    Log,
    /// Return a safe default without logging
    Silent,
}

impl FromStr for ErrorMode {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "throw" => Ok(Self::Throw),
            "log" => Ok(Self::Log),
            "silent" => Ok(Self::Silent),
            other => Err(CacheError::Validation(format!(
                "unknown error mode '{}'",
                other
            ))),
        }
    }
}

/// Cache engine configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Absolute root directory owning every cache file
    pub cache_dir: PathBuf,
    /// Permission bits for created directories (unix only)
    pub dir_mode: u32,
    /// Permission bits for entry files (unix only)
    pub file_mode: u32,
    /// Entry file extension, including the leading dot
    pub extension: String,
    /// Nest entries under hash-derived shard directories
    pub sharding: bool,
    /// Number of two-character shard levels
    pub shard_depth: usize,
    /// TTL in seconds applied when a write gives none; None = never expires
    pub default_ttl: Option<i64>,
    /// Upper bound for any TTL in seconds
    pub max_ttl: Option<i64>,
    /// GC runs on a write with probability `gc_probability / gc_divisor`
    pub gc_probability: u32,
    pub gc_divisor: u32,
    /// Check `expires` on every read; when false only GC removes stale data
    pub check_expiry_on_read: bool,
    pub serializer: SerializerKind,
    pub compression: bool,
    /// zlib level, 1..=9
    pub compression_level: u32,
    /// Minimum serialized size in bytes before compression kicks in
    pub compression_threshold: usize,
    pub locking: bool,
    /// Total time budget for acquiring one lock
    pub lock_timeout_ms: u64,
    /// Attempts made within the time budget
    pub lock_retries: u32,
    /// Write through a temp file + rename
    pub atomic_writes: bool,
    pub namespace: String,
    pub prefix: String,
    pub hash_algorithm: HashAlgorithm,
    /// fsync entry files before they become visible
    pub fsync: bool,
    /// Skip the memory mirror on reads and always go to disk
    pub stat_cache_bypass: bool,
    /// Load every live entry into the memory mirror on open
    pub preload_on_startup: bool,
    /// Total on-disk byte budget for entry files
    pub max_cache_size: Option<u64>,
    /// Maximum serialized (post-compression) size of one entry
    pub max_item_size: Option<usize>,
    /// Maintain hit counters on disk
    pub statistics: bool,
    pub error_mode: ErrorMode,
    /// Memory mirror capacity in entries; 0 disables the mirror
    pub memory_cache_entries: usize,
    /// Interval for the maintenance binary's GC loop
    pub gc_interval_secs: u64,
}

impl Config {
    /// Creates a config rooted at `cache_dir` with every other option defaulted.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `FILECACHE_DIR` - Cache root (default: `<tmp>/mini_filecache`)
    /// - `FILECACHE_EXTENSION` - Entry file extension (default: `.cache`)
    /// - `FILECACHE_SHARDING` / `FILECACHE_SHARD_DEPTH` - (default: true / 2)
    /// - `FILECACHE_DEFAULT_TTL` / `FILECACHE_MAX_TTL` - seconds, `none` disables
    /// - `FILECACHE_GC_PROBABILITY` / `FILECACHE_GC_DIVISOR` - (default: 1 / 100)
    /// - `FILECACHE_SERIALIZER` - `native`, `json` or `msgpack`
    /// - `FILECACHE_COMPRESSION`, `FILECACHE_COMPRESSION_LEVEL`, `FILECACHE_COMPRESSION_THRESHOLD`
    /// - `FILECACHE_LOCKING`, `FILECACHE_LOCK_TIMEOUT_MS`, `FILECACHE_LOCK_RETRIES`
    /// - `FILECACHE_MAX_CACHE_SIZE`, `FILECACHE_MAX_ITEM_SIZE` - bytes
    /// - `FILECACHE_ERROR_MODE` - `throw`, `log` or `silent`
    /// - `FILECACHE_GC_INTERVAL` - maintenance loop interval in seconds
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cache_dir: env::var("FILECACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            dir_mode: env_octal("FILECACHE_DIR_MODE").unwrap_or(defaults.dir_mode),
            file_mode: env_octal("FILECACHE_FILE_MODE").unwrap_or(defaults.file_mode),
            extension: env::var("FILECACHE_EXTENSION").unwrap_or(defaults.extension),
            sharding: env_parse("FILECACHE_SHARDING").unwrap_or(defaults.sharding),
            shard_depth: env_parse("FILECACHE_SHARD_DEPTH").unwrap_or(defaults.shard_depth),
            default_ttl: env_optional("FILECACHE_DEFAULT_TTL").unwrap_or(defaults.default_ttl),
            max_ttl: env_optional("FILECACHE_MAX_TTL").unwrap_or(defaults.max_ttl),
            gc_probability: env_parse("FILECACHE_GC_PROBABILITY")
                .unwrap_or(defaults.gc_probability),
            gc_divisor: env_parse("FILECACHE_GC_DIVISOR").unwrap_or(defaults.gc_divisor),
            check_expiry_on_read: env_parse("FILECACHE_CHECK_EXPIRY_ON_READ")
                .unwrap_or(defaults.check_expiry_on_read),
            serializer: env_parse("FILECACHE_SERIALIZER").unwrap_or(defaults.serializer),
            compression: env_parse("FILECACHE_COMPRESSION").unwrap_or(defaults.compression),
            compression_level: env_parse("FILECACHE_COMPRESSION_LEVEL")
                .unwrap_or(defaults.compression_level),
            compression_threshold: env_parse("FILECACHE_COMPRESSION_THRESHOLD")
                .unwrap_or(defaults.compression_threshold),
            locking: env_parse("FILECACHE_LOCKING").unwrap_or(defaults.locking),
            lock_timeout_ms: env_parse("FILECACHE_LOCK_TIMEOUT_MS")
                .unwrap_or(defaults.lock_timeout_ms),
            lock_retries: env_parse("FILECACHE_LOCK_RETRIES").unwrap_or(defaults.lock_retries),
            atomic_writes: env_parse("FILECACHE_ATOMIC_WRITES").unwrap_or(defaults.atomic_writes),
            namespace: env::var("FILECACHE_NAMESPACE").unwrap_or(defaults.namespace),
            prefix: env::var("FILECACHE_PREFIX").unwrap_or(defaults.prefix),
            hash_algorithm: env_parse("FILECACHE_HASH_ALGORITHM")
                .unwrap_or(defaults.hash_algorithm),
            fsync: env_parse("FILECACHE_FSYNC").unwrap_or(defaults.fsync),
            stat_cache_bypass: env_parse("FILECACHE_STAT_CACHE_BYPASS")
                .unwrap_or(defaults.stat_cache_bypass),
            preload_on_startup: env_parse("FILECACHE_PRELOAD")
                .unwrap_or(defaults.preload_on_startup),
            max_cache_size: env_optional("FILECACHE_MAX_CACHE_SIZE")
                .unwrap_or(defaults.max_cache_size),
            max_item_size: env_optional("FILECACHE_MAX_ITEM_SIZE")
                .unwrap_or(defaults.max_item_size),
            statistics: env_parse("FILECACHE_STATISTICS").unwrap_or(defaults.statistics),
            error_mode: env_parse("FILECACHE_ERROR_MODE").unwrap_or(defaults.error_mode),
            memory_cache_entries: env_parse("FILECACHE_MEMORY_ENTRIES")
                .unwrap_or(defaults.memory_cache_entries),
            gc_interval_secs: env_parse("FILECACHE_GC_INTERVAL")
                .unwrap_or(defaults.gc_interval_secs),
        }
    }

    /// Loads a config from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&raw).map_err(|e| {
            CacheError::Configuration(format!(
                "invalid config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })
    }

    /// Checks option ranges and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if !self.cache_dir.is_absolute() {
            return Err(CacheError::Configuration(format!(
                "cache directory must be absolute: {}",
                self.cache_dir.display()
            )));
        }
        if self.extension.contains(['/', '\\']) {
            return Err(CacheError::Validation(format!(
                "extension may not contain path separators: {}",
                self.extension
            )));
        }
        if self.sharding && self.shard_depth > MAX_SHARD_DEPTH {
            return Err(CacheError::Validation(format!(
                "shard depth {} exceeds maximum of {}",
                self.shard_depth, MAX_SHARD_DEPTH
            )));
        }
        if self.gc_divisor == 0 {
            return Err(CacheError::Validation("gc divisor must be positive".into()));
        }
        if self.gc_probability > self.gc_divisor {
            return Err(CacheError::Validation(format!(
                "gc probability {} exceeds divisor {}",
                self.gc_probability, self.gc_divisor
            )));
        }
        if !(1..=9).contains(&self.compression_level) {
            return Err(CacheError::Validation(format!(
                "compression level must be within 1..=9, got {}",
                self.compression_level
            )));
        }
        if let Some(default_ttl) = self.default_ttl {
            if default_ttl <= 0 {
                return Err(CacheError::Validation(
                    "default ttl must be positive; use none for no expiry".into(),
                ));
            }
        }
        if let Some(max_ttl) = self.max_ttl {
            if max_ttl <= 0 {
                return Err(CacheError::Validation("max ttl must be positive".into()));
            }
        }
        if self.locking && self.lock_retries == 0 {
            return Err(CacheError::Validation(
                "lock retries must be at least 1 when locking is enabled".into(),
            ));
        }
        if self.max_cache_size == Some(0) || self.max_item_size == Some(0) {
            return Err(CacheError::Validation(
                "size limits must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: env::temp_dir().join("mini_filecache"),
            dir_mode: 0o775,
            file_mode: 0o664,
            extension: ".cache".to_string(),
            sharding: true,
            shard_depth: 2,
            default_ttl: Some(3600),
            max_ttl: None,
            gc_probability: 1,
            gc_divisor: 100,
            check_expiry_on_read: true,
            serializer: SerializerKind::Native,
            compression: false,
            compression_level: 6,
            compression_threshold: 1024,
            locking: true,
            lock_timeout_ms: 1000,
            lock_retries: 10,
            atomic_writes: true,
            namespace: String::new(),
            prefix: String::new(),
            hash_algorithm: HashAlgorithm::Sha256,
            fsync: false,
            stat_cache_bypass: false,
            preload_on_startup: false,
            max_cache_size: None,
            max_item_size: None,
            statistics: false,
            error_mode: ErrorMode::Throw,
            memory_cache_entries: 1000,
            gc_interval_secs: 60,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// `Some(None)` when the variable is set to `none`/empty, `None` when unset or invalid.
fn env_optional<T: FromStr>(name: &str) -> Option<Option<T>> {
    let raw = env::var(name).ok()?;
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("none") {
        return Some(None);
    }
    raw.parse().ok().map(Some)
}

fn env_octal(name: &str) -> Option<u32> {
    env::var(name)
        .ok()
        .and_then(|v| u32::from_str_radix(v.trim().trim_start_matches("0o"), 8).ok())
}
