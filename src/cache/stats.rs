//! Cache Statistics Module
//!
//! Tracks per-instance operation counters plus an on-disk usage snapshot.

use serde::Serialize;

// == Cache Stats ==
/// Operation counters for one engine instance.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Number of successful cache retrievals
    pub hits: u64,
    /// Number of failed cache retrievals (absent, expired or corrupt)
    pub misses: u64,
    /// Number of entries written
    pub writes: u64,
    /// Number of entries removed by explicit deletes, GC or eviction
    pub deletes: u64,
    /// Number of entries removed by size-bounded eviction
    pub evictions: u64,
    /// Number of completed GC sweeps
    pub gc_runs: u64,
    /// Number of corrupt entry files discarded
    pub corrupt: u64,
    /// Entry files currently on disk (filled in by snapshots)
    pub total_entries: usize,
    /// Bytes used by entry files (filled in by snapshots)
    pub total_bytes: u64,
    /// Envelopes held in the memory mirror
    pub memory_entries: usize,
}

impl CacheStats {
    // == Constructor ==
    /// Creates a new CacheStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no reads have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_write(&mut self) {
        self.writes += 1;
    }

    pub fn record_delete(&mut self) {
        self.deletes += 1;
    }

    /// An eviction is also a delete.
    pub fn record_eviction(&mut self) {
        self.evictions += 1;
        self.deletes += 1;
    }

    pub fn record_gc_run(&mut self) {
        self.gc_runs += 1;
    }

    pub fn record_corrupt(&mut self) {
        self.corrupt += 1;
    }

    /// Fills in the usage fields of a snapshot.
    pub fn set_usage(&mut self, entries: usize, bytes: u64, memory_entries: usize) {
        self.total_entries = entries;
        self.total_bytes = bytes;
        self.memory_entries = memory_entries;
    }
}
