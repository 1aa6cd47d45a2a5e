//! Cache Store Module
//!
//! The public facade. Combines key resolution, the entry store, the tag
//! index, the memory mirror and the lifecycle policy behind one owned engine
//! instance. Operations are synchronous and blocking; several instances
//! (threads or processes) may share one root directory and coordinate
//! through per-key advisory locks.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::cache::codec::Codec;
use crate::cache::disk::{
    prune_empty_dirs, remove_stale_temp_files, scan_entries, DiskStore, EntryFile, ReadOutcome,
};
use crate::cache::entry::{current_timestamp_ms, CacheValue, Envelope};
use crate::cache::health::{self, HealthReport};
use crate::cache::key::KeyResolver;
use crate::cache::lifecycle::{
    plan_eviction, EvictionResult, GcReport, LifecyclePolicy, Ttl, TtlDecision,
};
use crate::cache::lock::{KeyLock, LockManager, LockMode};
use crate::cache::memory::MemoryMirror;
use crate::cache::stats::CacheStats;
use crate::cache::tags::TagIndex;
use crate::config::{Config, ErrorMode};
use crate::error::{CacheError, Result};

/// Temp files from interrupted atomic writes older than this are swept by GC.
const STALE_TEMP_AGE: Duration = Duration::from_secs(3600);

// == Cache Store ==
/// File-backed key/value cache engine.
#[derive(Debug)]
pub struct CacheStore {
    config: Config,
    resolver: KeyResolver,
    disk: DiskStore,
    tag_index: TagIndex,
    mirror: MemoryMirror,
    policy: LifecyclePolicy,
    stats: CacheStats,
    /// Tags consumed by the next `set`/`set_many`
    pending_tags: Option<Vec<String>>,
}

impl CacheStore {
    // == Constructor ==
    /// Opens (and creates if needed) a cache rooted at `config.cache_dir`.
    ///
    /// Configuration problems, including a serializer or compressor that is
    /// not compiled in, fail here rather than on first use. These errors are
    /// returned regardless of the configured error mode.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let codec = Codec::from_config(&config)?;
        let resolver = KeyResolver::from_config(&config);
        let locks = LockManager::new(resolver.lock_dir(), &config);
        let disk = DiskStore::new(codec, locks.clone(), &config);
        disk.ensure_dir(resolver.root()).map_err(|e| {
            CacheError::Configuration(format!(
                "cannot create cache directory {}: {}",
                resolver.root().display(),
                e
            ))
        })?;
        let tag_index = TagIndex::new(resolver.tag_index_path(), locks);

        let mut store = Self {
            mirror: MemoryMirror::new(config.memory_cache_entries),
            policy: LifecyclePolicy::from_config(&config),
            stats: CacheStats::new(),
            pending_tags: None,
            config,
            resolver,
            disk,
            tag_index,
        };

        info!(
            root = %store.resolver.root().display(),
            serializer = store.disk.codec().format_name(),
            compression = store.disk.codec().compression_enabled(),
            locking = store.disk.locks().enabled(),
            "Cache store opened"
        );

        if store.config.preload_on_startup {
            let loaded = store.preload();
            info!(loaded, "Preloaded entries into memory mirror");
        }
        Ok(store)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Entry file path for `key`.
    pub fn entry_path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.resolver.resolve(key)?.1)
    }

    // == Tags ==
    /// Sets the tags attached by the next `set` or `set_many` call.
    ///
    /// ```ignore
    /// cache.tags(["users"]).set("user.1", "alice", None)?;
    /// ```
    pub fn tags<I, S>(&mut self, tags: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pending_tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    // == Get ==
    /// Retrieves the value stored under `key`.
    ///
    /// # Returns
    /// - `Ok(Some(value))` if the key exists and has not expired
    /// - `Ok(None)` if the key is absent, expired or its file was corrupt
    pub fn get(&mut self, key: &str) -> Result<Option<CacheValue>> {
        let result = self.get_inner(key);
        apply_error_mode(self.config.error_mode, "get", result, || None)
    }

    /// Like [`CacheStore::get`], falling back to `default` on a miss.
    pub fn get_or(&mut self, key: &str, default: impl Into<CacheValue>) -> Result<CacheValue> {
        Ok(self.get(key)?.unwrap_or_else(|| default.into()))
    }

    /// Retrieves a value stored with [`CacheValue::from_serde`] as `T`.
    pub fn get_as<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>> {
        let result = self
            .get_inner(key)
            .and_then(|value| value.map(|v| v.deserialize_into()).transpose());
        apply_error_mode(self.config.error_mode, "get_as", result, || None)
    }

    /// Reads several keys; absent keys map to `None`.
    pub fn get_many<I, S>(&mut self, keys: I) -> Result<BTreeMap<String, Option<CacheValue>>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut values = BTreeMap::new();
        for key in keys {
            let key = key.as_ref();
            values.insert(key.to_string(), self.get(key)?);
        }
        Ok(values)
    }

    /// Checks whether `key` holds a live entry. Does not touch statistics.
    pub fn has(&mut self, key: &str) -> Result<bool> {
        let result = self.read_entry(key).map(|found| found.is_some());
        apply_error_mode(self.config.error_mode, "has", result, || false)
    }

    /// Remaining lifetime of `key` in whole seconds, rounded up.
    ///
    /// # Returns
    /// - `Ok(None)` if the key is absent
    /// - `Ok(Some(-1))` if the entry never expires
    pub fn ttl(&mut self, key: &str) -> Result<Option<i64>> {
        let result = self.read_entry(key).map(|found| {
            found.map(|envelope| match envelope.ttl_remaining_ms() {
                Some(ms) => i64::try_from(ms.div_ceil(1000)).unwrap_or(i64::MAX),
                None => -1,
            })
        });
        apply_error_mode(self.config.error_mode, "ttl", result, || None)
    }

    // == Set ==
    /// Stores `value` under `key`.
    ///
    /// # Arguments
    /// * `key` - Logical key, at most 255 bytes, no reserved characters
    /// * `value` - Anything convertible into a [`CacheValue`]
    /// * `ttl` - Explicit TTL; `None` applies the configured default. A zero
    ///   or negative TTL deletes the key instead of storing it.
    ///
    /// Consumes tags set with [`CacheStore::tags`].
    pub fn set(&mut self, key: &str, value: impl Into<CacheValue>, ttl: Option<Ttl>) -> Result<bool> {
        let tags = self.pending_tags.take().unwrap_or_default();
        let decision = self.policy.normalize_ttl(ttl, current_timestamp_ms());
        let result = self.set_inner(key, value.into(), decision, tags);
        if result.is_ok() {
            self.after_write();
        }
        apply_error_mode(self.config.error_mode, "set", result.map(|_| true), || false)
    }

    /// Stores `value` with no expiry, still clamped by `max_ttl`.
    pub fn forever(&mut self, key: &str, value: impl Into<CacheValue>) -> Result<bool> {
        let tags = self.pending_tags.take().unwrap_or_default();
        let decision = self.policy.forever(current_timestamp_ms());
        let result = self.set_inner(key, value.into(), decision, tags);
        if result.is_ok() {
            self.after_write();
        }
        apply_error_mode(self.config.error_mode, "forever", result.map(|_| true), || false)
    }

    /// Stores `value` only if `key` has no live entry.
    ///
    /// The check and the write happen under the key's exclusive lock.
    pub fn add(&mut self, key: &str, value: impl Into<CacheValue>, ttl: Option<Ttl>) -> Result<bool> {
        let tags = self.pending_tags.take().unwrap_or_default();
        let result = self.add_inner(key, value.into(), ttl, tags);
        if matches!(result, Ok(true)) {
            self.after_write();
        }
        apply_error_mode(self.config.error_mode, "add", result, || false)
    }

    /// Stores several entries with one TTL; pending tags apply to all of them.
    pub fn set_many<I, K, V>(&mut self, entries: I, ttl: Option<Ttl>) -> Result<bool>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<CacheValue>,
    {
        let tags = self.pending_tags.take().unwrap_or_default();
        let decision = self.policy.normalize_ttl(ttl, current_timestamp_ms());
        let result = entries.into_iter().try_for_each(|(key, value)| {
            self.set_inner(key.as_ref(), value.into(), decision, tags.clone())
                .map(|_| ())
        });
        if result.is_ok() {
            self.after_write();
        }
        apply_error_mode(self.config.error_mode, "set_many", result.map(|_| true), || false)
    }

    // == Delete ==
    /// Removes `key`. Deleting an absent key succeeds.
    ///
    /// The tag index is reconciled even when the file is already gone.
    pub fn delete(&mut self, key: &str) -> Result<bool> {
        let result = self.delete_inner(key).map(|_| true);
        apply_error_mode(self.config.error_mode, "delete", result, || false)
    }

    pub fn delete_many<I, S>(&mut self, keys: I) -> Result<bool>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let result = keys
            .into_iter()
            .try_for_each(|key| self.delete_inner(key.as_ref()).map(|_| ()))
            .map(|_| true);
        apply_error_mode(self.config.error_mode, "delete_many", result, || false)
    }

    /// Returns the value under `key` and deletes it.
    pub fn pull(&mut self, key: &str) -> Result<Option<CacheValue>> {
        let value = self.get(key)?;
        self.delete(key)?;
        Ok(value)
    }

    /// Removes every entry, the tag index and idle lock files.
    pub fn clear(&mut self) -> Result<bool> {
        let result = self.clear_inner().map(|_| true);
        apply_error_mode(self.config.error_mode, "clear", result, || false)
    }

    // == Counters ==
    /// Adds `by` to the integer under `key` and returns the new value.
    ///
    /// A missing or expired key starts from 0 with the default TTL; an
    /// existing entry keeps its expiry and tags.
    ///
    /// # Returns
    /// - `Ok(Some(n))` with the new value
    /// - `Ok(None)` if the key lock could not be acquired in time
    /// - `Err(CacheError::Type)` if the stored value is not an integer
    /// - `Err(CacheError::Validation)` on overflow
    pub fn increment(&mut self, key: &str, by: i64) -> Result<Option<i64>> {
        let result = self.increment_inner(key, by);
        if matches!(result, Ok(Some(_))) {
            self.after_write();
        }
        apply_error_mode(self.config.error_mode, "increment", result, || None)
    }

    pub fn decrement(&mut self, key: &str, by: i64) -> Result<Option<i64>> {
        match by.checked_neg() {
            Some(negated) => self.increment(key, negated),
            None => {
                let result = Err(CacheError::Validation(format!("cannot decrement by {}", by)));
                apply_error_mode(self.config.error_mode, "decrement", result, || None)
            }
        }
    }

    // == Touch ==
    /// Rewrites the expiry of a live entry.
    ///
    /// # Returns
    /// `Ok(false)` if the key is absent or already expired.
    pub fn touch(&mut self, key: &str, ttl: Option<Ttl>) -> Result<bool> {
        let result = self.touch_inner(key, ttl);
        apply_error_mode(self.config.error_mode, "touch", result, || false)
    }

    // == Remember ==
    /// Returns the cached value or computes, stores and returns it.
    ///
    /// `producer` runs at most once per call and only on a miss. There is no
    /// cross-process single flight: concurrent callers on a cold key may all
    /// compute, and the last write wins.
    pub fn remember<F, V>(&mut self, key: &str, ttl: Option<Ttl>, producer: F) -> Result<CacheValue>
    where
        F: FnOnce() -> V,
        V: Into<CacheValue>,
    {
        let tags = self.pending_tags.take();
        if let Some(value) = self.get(key)? {
            return Ok(value);
        }
        let value = producer().into();
        self.pending_tags = tags;
        self.set(key, value.clone(), ttl)?;
        Ok(value)
    }

    /// [`CacheStore::remember`] with no expiry.
    pub fn remember_forever<F, V>(&mut self, key: &str, producer: F) -> Result<CacheValue>
    where
        F: FnOnce() -> V,
        V: Into<CacheValue>,
    {
        let tags = self.pending_tags.take();
        if let Some(value) = self.get(key)? {
            return Ok(value);
        }
        let value = producer().into();
        self.pending_tags = tags;
        self.forever(key, value.clone())?;
        Ok(value)
    }

    // == Warmup ==
    /// Loads existing, live entries into the memory mirror.
    ///
    /// Returns how many of `keys` ended up mirrored.
    pub fn warmup<I, S>(&mut self, keys: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let result = keys.into_iter().try_fold(0, |loaded, key| {
            let key = key.as_ref();
            self.read_entry(key)
                .map(|found| loaded + usize::from(found.is_some() && self.mirror.contains(key)))
        });
        apply_error_mode(self.config.error_mode, "warmup", result, || 0)
    }

    // == Tag Invalidation ==
    /// Keys currently indexed under `tag`.
    pub fn tagged_keys(&self, tag: &str) -> Result<Vec<String>> {
        let result = self.tag_index.keys_for(tag);
        apply_error_mode(self.config.error_mode, "tagged_keys", result, Vec::new)
    }

    /// Deletes every key indexed under `tag`, then drops the tag.
    ///
    /// Not atomic across keys: a failure part way leaves the remaining keys
    /// in place and still indexed.
    ///
    /// # Returns
    /// Number of entry files removed.
    pub fn delete_by_tag(&mut self, tag: &str) -> Result<usize> {
        let result = self.delete_by_tag_inner(tag);
        apply_error_mode(self.config.error_mode, "delete_by_tag", result, || 0)
    }

    pub fn delete_by_tags<I, S>(&mut self, tags: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let result = tags.into_iter().try_fold(0, |removed, tag| {
            self.delete_by_tag_inner(tag.as_ref()).map(|n| removed + n)
        });
        apply_error_mode(self.config.error_mode, "delete_by_tags", result, || 0)
    }

    // == Locks ==
    /// Takes the exclusive advisory lock on `key` until the guard drops.
    ///
    /// Returns `Ok(None)` when the lock stays contended for the configured
    /// timeout. While the guard is alive, writes to the same key from this
    /// instance also wait on it and time out.
    pub fn lock(&self, key: &str) -> Result<Option<KeyLock>> {
        let result = self
            .resolver
            .resolve(key)
            .and_then(|(hash, _)| self.disk.locks().acquire(&hash, LockMode::Exclusive));
        apply_error_mode(self.config.error_mode, "lock", result, || None)
    }

    // == Garbage Collection ==
    /// Runs a GC sweep when `force` is set or the probability sample hits.
    ///
    /// # Returns
    /// Number of expired or corrupt entries deleted.
    pub fn gc(&mut self, force: bool) -> Result<usize> {
        if !force && !self.policy.should_run_gc(&mut rand::thread_rng()) {
            return Ok(0);
        }
        let result = self.sweep_inner().map(|report| report.deleted());
        apply_error_mode(self.config.error_mode, "gc", result, || 0)
    }

    /// Runs a full GC sweep and returns its report.
    pub fn sweep(&mut self) -> Result<GcReport> {
        let result = self.sweep_inner();
        apply_error_mode(self.config.error_mode, "sweep", result, GcReport::default)
    }

    /// Deletes oldest entries until the cache fits `max_cache_size`.
    pub fn evict_if_needed(&mut self) -> Result<EvictionResult> {
        let result = self.evict_inner();
        apply_error_mode(self.config.error_mode, "evict", result, EvictionResult::default)
    }

    // == Diagnostics ==
    /// Counter snapshot with the current on-disk usage filled in.
    pub fn stats(&self) -> CacheStats {
        let files = scan_entries(&self.resolver);
        let mut snapshot = self.stats.clone();
        snapshot.set_usage(files.len(), total_size(&files), self.mirror.len());
        snapshot
    }

    /// Advisory health snapshot; never fails.
    pub fn health_check(&self) -> HealthReport {
        let files = scan_entries(&self.resolver);
        health::check(&self.config, files.len(), total_size(&files))
    }

    // == Internals ==
    /// Mirror, then disk, then expiry. Corrupt and expired entries are
    /// deleted and reported as absent.
    fn read_entry(&mut self, key: &str) -> Result<Option<Envelope>> {
        let (hash, path) = self.resolver.resolve(key)?;
        let now = current_timestamp_ms();
        let check_expiry = self.policy.check_expiry_on_read();

        if !self.config.stat_cache_bypass {
            if let Some((envelope, modified)) = self.mirror.get(key, check_expiry.then_some(now)) {
                if modified.is_some() && file_mtime(&path) == modified {
                    return Ok(Some(envelope));
                }
                self.mirror.remove(key);
            }
        }

        match self.disk.read(&hash, &path)? {
            ReadOutcome::Missing => {
                self.mirror.remove(key);
                Ok(None)
            }
            ReadOutcome::Corrupt(reason) => {
                warn!(key, path = %path.display(), %reason, "Discarding corrupt cache entry");
                self.stats.record_corrupt();
                self.discard_stale(key, &hash, &path, now)?;
                Ok(None)
            }
            ReadOutcome::Found(envelope, _) if envelope.key != key => {
                debug!(key, stored = %envelope.key, "Hash collision, treating as miss");
                Ok(None)
            }
            ReadOutcome::Found(envelope, _) if check_expiry && envelope.is_expired_at(now) => {
                debug!(key, "Entry expired");
                self.discard_stale(key, &hash, &path, now)?;
                Ok(None)
            }
            ReadOutcome::Found(envelope, modified) => {
                self.mirror.insert(envelope.clone(), modified);
                Ok(Some(envelope))
            }
        }
    }

    fn get_inner(&mut self, key: &str) -> Result<Option<CacheValue>> {
        match self.read_entry(key)? {
            Some(envelope) => {
                self.stats.record_hit();
                debug!(key, "Cache hit");
                if self.config.statistics {
                    self.persist_hit(key);
                }
                Ok(Some(envelope.value))
            }
            None => {
                self.stats.record_miss();
                debug!(key, "Cache miss");
                Ok(None)
            }
        }
    }

    /// Removes an entry a lock-free read found expired or corrupt.
    ///
    /// The file is re-read under the exclusive lock and only removed if it
    /// is still stale, so a value written meanwhile by another instance
    /// survives. A busy entry is left for GC.
    fn discard_stale(&mut self, key: &str, hash: &str, path: &Path, now: u64) -> Result<()> {
        let guard = match self.disk.lock(hash, LockMode::Exclusive) {
            Ok(guard) => guard,
            Err(CacheError::LockTimeout(_)) => {
                debug!(key, "Stale entry busy, left for GC");
                self.mirror.remove(key);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let stale = match self.disk.read_held(path, &guard)? {
            ReadOutcome::Corrupt(_) => true,
            ReadOutcome::Found(envelope, _) => envelope.key == key && envelope.is_expired_at(now),
            ReadOutcome::Missing => false,
        };
        if stale {
            self.forget_held(key, path, &guard)?;
        } else {
            self.mirror.remove(key);
        }
        Ok(())
    }

    /// Bumps the on-disk hit counter; failures only cost the count.
    fn persist_hit(&mut self, key: &str) {
        if let Err(e) = self.bump_hits(key) {
            debug!(key, error = %e, "Failed to persist hit counter");
        }
    }

    /// Re-reads the entry under its exclusive lock and rewrites it with one
    /// more hit. Does nothing if the entry is gone, belongs to another key or
    /// the lock is busy.
    fn bump_hits(&mut self, key: &str) -> Result<()> {
        let (hash, path) = self.resolver.resolve(key)?;
        let Some(guard) = self.disk.locks().acquire(&hash, LockMode::Exclusive)? else {
            return Ok(());
        };
        let mut envelope = match self.disk.read_held(&path, &guard)? {
            ReadOutcome::Found(envelope, _) if envelope.key == key => envelope,
            _ => return Ok(()),
        };
        envelope.hits += 1;
        let bytes = self.disk.encode(&envelope)?;
        self.disk.write_held(&path, &bytes, &guard)?;
        self.mirror.insert(envelope, file_mtime(&path));
        Ok(())
    }

    fn set_inner(
        &mut self,
        key: &str,
        value: CacheValue,
        decision: TtlDecision,
        tags: Vec<String>,
    ) -> Result<()> {
        let (hash, path) = self.resolver.resolve(key)?;
        let expires = match decision {
            TtlDecision::Store(expires) => expires,
            TtlDecision::Delete => {
                debug!(key, "Non-positive TTL, deleting instead of storing");
                self.forget(key, &hash, &path)?;
                return Ok(());
            }
        };
        let mut envelope = Envelope::new(key, value, expires);
        envelope.set_tags(tags);
        self.write_envelope(&hash, &path, envelope, None)
    }

    fn add_inner(
        &mut self,
        key: &str,
        value: CacheValue,
        ttl: Option<Ttl>,
        tags: Vec<String>,
    ) -> Result<bool> {
        let (hash, path) = self.resolver.resolve(key)?;
        let guard = self.disk.lock(&hash, LockMode::Exclusive)?;
        let now = current_timestamp_ms();
        if let ReadOutcome::Found(existing, _) = self.disk.read_held(&path, &guard)? {
            if existing.key == key && !existing.is_expired_at(now) {
                return Ok(false);
            }
        }
        let expires = match self.policy.normalize_ttl(ttl, now) {
            TtlDecision::Store(expires) => expires,
            TtlDecision::Delete => return Ok(false),
        };
        let mut envelope = Envelope::new(key, value, expires);
        envelope.set_tags(tags);
        self.write_envelope(&hash, &path, envelope, Some(&guard))?;
        Ok(true)
    }

    /// Encodes and writes an envelope, then reconciles tags and the mirror.
    ///
    /// The key's exclusive lock is held until the tag index agrees with the
    /// new file. With `guard` the caller already holds it.
    fn write_envelope(
        &mut self,
        hash: &str,
        path: &Path,
        envelope: Envelope,
        guard: Option<&KeyLock>,
    ) -> Result<()> {
        let bytes = self.disk.encode(&envelope)?;
        let owned;
        let guard = match guard {
            Some(guard) => guard,
            None => {
                owned = self.disk.lock(hash, LockMode::Exclusive)?;
                &owned
            }
        };
        self.disk.write_held(path, &bytes, guard)?;
        self.tag_index.replace_key_tags(&envelope.key, &envelope.tags)?;
        debug!(key = %envelope.key, bytes = bytes.len(), expires = ?envelope.expires, "Entry written");
        self.mirror.insert(envelope, file_mtime(path));
        self.stats.record_write();
        Ok(())
    }

    fn delete_inner(&mut self, key: &str) -> Result<bool> {
        let (hash, path) = self.resolver.resolve(key)?;
        self.forget(key, &hash, &path)
    }

    /// Removes the entry file and every trace of `key`.
    fn forget(&mut self, key: &str, hash: &str, path: &Path) -> Result<bool> {
        let guard = self.disk.lock(hash, LockMode::Exclusive)?;
        self.forget_held(key, path, &guard)
    }

    /// [`CacheStore::forget`] for a caller holding the key's exclusive lock.
    fn forget_held(&mut self, key: &str, path: &Path, guard: &KeyLock) -> Result<bool> {
        let removed = self.disk.remove_held(path, guard)?;
        self.tag_index.remove_key(key)?;
        self.mirror.remove(key);
        if removed {
            self.stats.record_delete();
            debug!(key, "Entry deleted");
        }
        Ok(removed)
    }

    fn increment_inner(&mut self, key: &str, by: i64) -> Result<Option<i64>> {
        let (hash, path) = self.resolver.resolve(key)?;
        let Some(guard) = self.disk.locks().acquire(&hash, LockMode::Exclusive)? else {
            return Ok(None);
        };
        let now = current_timestamp_ms();

        let current = match self.disk.read_held(&path, &guard)? {
            ReadOutcome::Found(envelope, _)
                if envelope.key == key && !envelope.is_expired_at(now) =>
            {
                Some(envelope)
            }
            ReadOutcome::Corrupt(reason) => {
                warn!(key, %reason, "Overwriting corrupt counter entry");
                self.stats.record_corrupt();
                None
            }
            _ => None,
        };
        let mut envelope = match current {
            Some(envelope) => envelope,
            None => {
                let expires = match self.policy.normalize_ttl(None, now) {
                    TtlDecision::Store(expires) => expires,
                    TtlDecision::Delete => None,
                };
                Envelope::new(key, CacheValue::Int(0), expires)
            }
        };

        let value = envelope.value.as_int().ok_or_else(|| {
            CacheError::Type(format!("value under '{}' is not an integer", key))
        })?;
        let next = value.checked_add(by).ok_or_else(|| {
            CacheError::Validation(format!("adding {} to '{}' overflows", by, key))
        })?;
        envelope.rewrite(CacheValue::Int(next));
        self.write_envelope(&hash, &path, envelope, Some(&guard))?;
        Ok(Some(next))
    }

    fn touch_inner(&mut self, key: &str, ttl: Option<Ttl>) -> Result<bool> {
        let (hash, path) = self.resolver.resolve(key)?;
        if !path.exists() {
            return Ok(false);
        }
        let guard = self.disk.lock(&hash, LockMode::Exclusive)?;
        let now = current_timestamp_ms();
        let mut envelope = match self.disk.read_held(&path, &guard)? {
            ReadOutcome::Found(envelope, _)
                if envelope.key == key && !envelope.is_expired_at(now) =>
            {
                envelope
            }
            _ => return Ok(false),
        };

        match self.policy.normalize_ttl(ttl, now) {
            TtlDecision::Store(expires) => {
                envelope.expires = expires;
                let bytes = self.disk.encode(&envelope)?;
                self.disk.write_held(&path, &bytes, &guard)?;
                self.mirror.insert(envelope, file_mtime(&path));
            }
            TtlDecision::Delete => {
                self.forget_held(key, &path, &guard)?;
            }
        }
        Ok(true)
    }

    fn delete_by_tag_inner(&mut self, tag: &str) -> Result<usize> {
        let keys = self.tag_index.keys_for(tag)?;
        let mut removed = 0;
        for key in &keys {
            if self.delete_inner(key)? {
                removed += 1;
            }
        }
        self.tag_index.drop_tag(tag)?;
        info!(tag, keys = keys.len(), removed, "Invalidated tag");
        Ok(removed)
    }

    /// Size eviction and probabilistic GC after a successful write.
    ///
    /// Failures are logged; the write itself already succeeded.
    fn after_write(&mut self) {
        if self.policy.max_cache_size().is_some() {
            if let Err(e) = self.evict_inner() {
                warn!(error = %e, "Eviction after write failed");
            }
        }
        if self.policy.should_run_gc(&mut rand::thread_rng()) {
            if let Err(e) = self.sweep_inner() {
                warn!(error = %e, "Garbage collection after write failed");
            }
        }
    }

    fn sweep_inner(&mut self) -> Result<GcReport> {
        let now = current_timestamp_ms();
        let mut report = GcReport::default();

        for file in scan_entries(&self.resolver) {
            report.scanned += 1;
            let Some(hash) = self.resolver.hash_of(&file.path) else {
                continue;
            };
            let guard = match self.disk.lock(&hash, LockMode::Exclusive) {
                Ok(guard) => guard,
                Err(CacheError::LockTimeout(_)) => {
                    debug!(path = %file.path.display(), "Entry busy, skipped by GC");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match self.disk.read_held(&file.path, &guard)? {
                ReadOutcome::Found(envelope, _) if envelope.is_expired_at(now) => {
                    if self.disk.remove_held(&file.path, &guard)? {
                        report.expired += 1;
                        self.stats.record_delete();
                    }
                    self.detach_removed(&envelope, &guard)?;
                }
                ReadOutcome::Corrupt(reason) => {
                    debug!(path = %file.path.display(), %reason, "GC removing corrupt entry");
                    if self.disk.remove_held(&file.path, &guard)? {
                        report.corrupt += 1;
                        self.stats.record_corrupt();
                        self.stats.record_delete();
                    }
                }
                ReadOutcome::Found(..) | ReadOutcome::Missing => {}
            }
        }

        let resolver = &self.resolver;
        report.orphaned_tags = self.tag_index.retain_keys(|key| {
            resolver
                .resolve(key)
                .map(|(_, path)| path.exists())
                .unwrap_or(false)
        })?;

        if self.policy.max_cache_size().is_some() {
            report.eviction = Some(self.evict_inner()?);
        }
        prune_empty_dirs(&self.resolver);
        let stale_before = SystemTime::now()
            .checked_sub(STALE_TEMP_AGE)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let stale_temps = remove_stale_temp_files(&self.resolver, stale_before);

        self.stats.record_gc_run();
        info!(
            scanned = report.scanned,
            expired = report.expired,
            corrupt = report.corrupt,
            orphaned_tags = report.orphaned_tags,
            stale_temps,
            "GC sweep complete"
        );
        Ok(report)
    }

    /// Drops the tag memberships and mirror copy of an envelope whose file
    /// was just removed under `_guard`.
    fn detach_removed(&mut self, envelope: &Envelope, _guard: &KeyLock) -> Result<()> {
        if !envelope.tags.is_empty() {
            self.tag_index.remove_key(&envelope.key)?;
        }
        self.mirror.remove(&envelope.key);
        Ok(())
    }

    fn evict_inner(&mut self) -> Result<EvictionResult> {
        let Some(budget) = self.policy.max_cache_size() else {
            return Ok(EvictionResult::default());
        };
        let (victims, total) = plan_eviction(scan_entries(&self.resolver), budget);
        let mut result = EvictionResult {
            size_before: total,
            size_after: total,
            ..EvictionResult::default()
        };
        if victims.is_empty() {
            return Ok(result);
        }

        for file in &victims {
            let Some(hash) = self.resolver.hash_of(&file.path) else {
                continue;
            };
            let guard = match self.disk.lock(&hash, LockMode::Exclusive) {
                Ok(guard) => guard,
                Err(CacheError::LockTimeout(_)) => continue,
                Err(e) => return Err(e),
            };
            let outcome = self.disk.read_held(&file.path, &guard)?;
            if self.disk.remove_held(&file.path, &guard)? {
                result.files_deleted += 1;
                result.bytes_freed += file.size;
                self.stats.record_eviction();
            }
            if let ReadOutcome::Found(envelope, _) = outcome {
                self.detach_removed(&envelope, &guard)?;
            }
        }
        result.size_after = total.saturating_sub(result.bytes_freed);
        prune_empty_dirs(&self.resolver);

        info!(
            budget,
            files_deleted = result.files_deleted,
            bytes_freed = result.bytes_freed,
            size_after = result.size_after,
            "Evicted oldest entries"
        );
        Ok(result)
    }

    fn clear_inner(&mut self) -> Result<()> {
        let mut removed = 0;
        for file in scan_entries(&self.resolver) {
            let Some(hash) = self.resolver.hash_of(&file.path) else {
                continue;
            };
            if self.disk.remove(&hash, &file.path)? {
                removed += 1;
                self.stats.record_delete();
            }
        }
        self.tag_index.clear()?;
        self.mirror.clear();
        prune_empty_dirs(&self.resolver);
        let lock_files = self.disk.locks().prune()?;
        info!(removed, lock_files, "Cache cleared");
        Ok(())
    }

    /// Loads live entries into the mirror until it is full.
    fn preload(&mut self) -> usize {
        let now = current_timestamp_ms();
        let mut loaded = 0;
        for file in scan_entries(&self.resolver) {
            if loaded >= self.config.memory_cache_entries {
                break;
            }
            let Some(hash) = self.resolver.hash_of(&file.path) else {
                continue;
            };
            if let Ok(ReadOutcome::Found(envelope, modified)) = self.disk.read(&hash, &file.path) {
                if !envelope.is_expired_at(now) {
                    self.mirror.insert(envelope, modified);
                    loaded += 1;
                }
            }
        }
        loaded
    }
}

// == Helper Functions ==
/// Applies the configured error mode to a facade result.
///
/// `Throw` passes errors through; `Log` and `Silent` replace them with the
/// operation's safe default, `Log` after a warning.
fn apply_error_mode<T>(
    mode: ErrorMode,
    operation: &'static str,
    result: Result<T>,
    fallback: impl FnOnce() -> T,
) -> Result<T> {
    match (result, mode) {
        (Ok(value), _) => Ok(value),
        (Err(e), ErrorMode::Throw) => Err(e),
        (Err(e), ErrorMode::Log) => {
            warn!(operation, kind = e.kind(), error = %e, "Cache operation failed");
            Ok(fallback())
        }
        (Err(_), ErrorMode::Silent) => Ok(fallback()),
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn total_size(files: &[EntryFile]) -> u64 {
    files.iter().map(|f| f.size).sum()
}
