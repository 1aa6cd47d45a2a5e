//! In-process memory mirror.
//!
//! Holds recently touched envelopes for the lifetime of one engine instance
//! to skip redundant disk reads. It is never authoritative: every hit is
//! checked against the same expiry rule as disk entries, and optionally
//! against the entry file's modification time.

use std::collections::{HashMap, VecDeque};
use std::time::SystemTime;

use crate::cache::entry::Envelope;

#[derive(Debug, Clone)]
struct MirrorSlot {
    envelope: Envelope,
    /// mtime of the entry file when the envelope was read or written
    modified: Option<SystemTime>,
}

// == Memory Mirror ==
/// Bounded map of logical key to envelope with least-recently-used eviction.
///
/// Access order is kept in a deque:
/// - Front = most recently used
/// - Back = least recently used
#[derive(Debug, Default)]
pub struct MemoryMirror {
    slots: HashMap<String, MirrorSlot>,
    order: VecDeque<String>,
    capacity: usize,
}

impl MemoryMirror {
    /// Creates a mirror holding at most `capacity` entries; 0 disables it.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    pub fn enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Stores an envelope, evicting the least recently used one when full.
    pub fn insert(&mut self, envelope: Envelope, modified: Option<SystemTime>) {
        if !self.enabled() {
            return;
        }
        let key = envelope.key.clone();
        if !self.slots.contains_key(&key) && self.slots.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_back() {
                self.slots.remove(&oldest);
            }
        }
        self.slots.insert(key.clone(), MirrorSlot { envelope, modified });
        self.touch(&key);
    }

    /// Returns the mirrored envelope and the mtime recorded with it.
    ///
    /// With `now_ms` set, expired envelopes are dropped and reported as
    /// absent; `None` skips the expiry check like disk reads do when
    /// expiry-on-read is disabled.
    pub fn get(
        &mut self,
        key: &str,
        now_ms: Option<u64>,
    ) -> Option<(Envelope, Option<SystemTime>)> {
        let slot = self.slots.get(key)?;
        let expired = now_ms.is_some_and(|now| slot.envelope.is_expired_at(now));
        if expired {
            self.remove(key);
            return None;
        }
        self.touch(key);
        self.slots
            .get(key)
            .map(|slot| (slot.envelope.clone(), slot.modified))
    }

    pub fn remove(&mut self, key: &str) {
        if self.slots.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push_front(key.to_string());
    }
}
