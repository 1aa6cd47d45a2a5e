//! Mini Filecache - a file-backed key/value cache engine
//!
//! Stores one envelope file per key under a configured root directory, with
//! TTL expiration, tag-based invalidation, advisory per-key locking and
//! size-bounded eviction.

pub mod cache;
pub mod config;
pub mod error;
pub mod tasks;

pub use cache::{CacheStore, CacheValue, Ttl};
pub use config::Config;
pub use error::{CacheError, Result};
pub use tasks::spawn_gc_task;
