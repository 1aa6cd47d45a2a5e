//! Entry lifecycle policy: TTL normalisation, GC sampling and
//! size-bounded eviction planning.
//!
//! Eviction is oldest-first by file modification time, not by access time,
//! so reads never have to update an access-order structure.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::cache::disk::EntryFile;
use crate::config::Config;

// == TTL ==
/// Explicit TTL given to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Seconds; zero or negative means "delete instead of store"
    Seconds(i64),
    Duration(Duration),
}

impl Ttl {
    pub fn seconds(secs: i64) -> Self {
        Ttl::Seconds(secs)
    }

    fn as_millis(self) -> i64 {
        match self {
            Ttl::Seconds(secs) => secs.saturating_mul(1000),
            Ttl::Duration(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
        }
    }
}

impl From<i64> for Ttl {
    fn from(secs: i64) -> Self {
        Ttl::Seconds(secs)
    }
}

impl From<Duration> for Ttl {
    fn from(d: Duration) -> Self {
        Ttl::Duration(d)
    }
}

/// What a write should do after TTL normalisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlDecision {
    /// Store with this absolute expiry (Unix ms), None = never expires
    Store(Option<u64>),
    /// Effective TTL is zero or negative
    Delete,
}

// == Eviction Result ==
/// Outcome of one size-bounded eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionResult {
    pub files_deleted: usize,
    pub bytes_freed: u64,
    pub size_before: u64,
    pub size_after: u64,
}

/// Outcome of a GC sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    /// Entry files examined
    pub scanned: usize,
    /// Entries deleted because they had expired
    pub expired: usize,
    /// Entries deleted because they failed to decode
    pub corrupt: usize,
    /// Tag index memberships dropped for keys with no entry file
    pub orphaned_tags: usize,
    pub eviction: Option<EvictionResult>,
}

impl GcReport {
    /// Entries removed for being expired or undecodable.
    pub fn deleted(&self) -> usize {
        self.expired + self.corrupt
    }
}

// == Lifecycle Policy ==
#[derive(Debug, Clone)]
pub struct LifecyclePolicy {
    default_ttl: Option<i64>,
    max_ttl: Option<i64>,
    gc_probability: u32,
    gc_divisor: u32,
    check_expiry_on_read: bool,
    max_cache_size: Option<u64>,
}

impl LifecyclePolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_ttl: config.default_ttl,
            max_ttl: config.max_ttl,
            gc_probability: config.gc_probability,
            gc_divisor: config.gc_divisor.max(1),
            check_expiry_on_read: config.check_expiry_on_read,
            max_cache_size: config.max_cache_size,
        }
    }

    pub fn check_expiry_on_read(&self) -> bool {
        self.check_expiry_on_read
    }

    pub fn max_cache_size(&self) -> Option<u64> {
        self.max_cache_size
    }

    /// Resolves the expiry for a write made at `now_ms`.
    ///
    /// An explicit TTL overrides the default; `max_ttl` clamps larger values,
    /// including "never expires".
    pub fn normalize_ttl(&self, explicit: Option<Ttl>, now_ms: u64) -> TtlDecision {
        let ttl_ms = match explicit {
            Some(ttl) => Some(ttl.as_millis()),
            None => self.default_ttl.map(|secs| secs.saturating_mul(1000)),
        };
        self.decide(ttl_ms, now_ms)
    }

    /// Expiry for a write that asks for no expiry at all.
    pub fn forever(&self, now_ms: u64) -> TtlDecision {
        self.decide(None, now_ms)
    }

    fn decide(&self, ttl_ms: Option<i64>, now_ms: u64) -> TtlDecision {
        let max_ms = self.max_ttl.map(|secs| secs.saturating_mul(1000));
        let ttl_ms = match (ttl_ms, max_ms) {
            (Some(ttl), Some(max)) => Some(ttl.min(max)),
            (None, Some(max)) => Some(max),
            (ttl, None) => ttl,
        };
        match ttl_ms {
            None => TtlDecision::Store(None),
            Some(ttl) if ttl <= 0 => TtlDecision::Delete,
            Some(ttl) => TtlDecision::Store(Some(now_ms.saturating_add(ttl as u64))),
        }
    }

    /// Samples whether a write should trigger a GC sweep.
    pub fn should_run_gc(&self, rng: &mut impl Rng) -> bool {
        if self.gc_probability == 0 {
            return false;
        }
        rng.gen_range(1..=self.gc_divisor) <= self.gc_probability
    }
}

/// Picks the files to delete so that the remaining total fits `budget`.
///
/// Files are taken oldest mtime first; ties break on path for determinism.
/// Returns the chosen files and the total size before eviction.
pub fn plan_eviction(mut files: Vec<EntryFile>, budget: u64) -> (Vec<EntryFile>, u64) {
    let total: u64 = files.iter().map(|f| f.size).sum();
    if total <= budget {
        return (Vec::new(), total);
    }
    files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));

    let mut remaining = total;
    let mut victims = Vec::new();
    for file in files {
        if remaining <= budget {
            break;
        }
        remaining = remaining.saturating_sub(file.size);
        victims.push(file);
    }
    (victims, total)
}
