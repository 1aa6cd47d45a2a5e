//! Cache Module
//!
//! File-backed key/value cache engine with TTL expiration, tag invalidation
//! and size-bounded eviction.

pub mod codec;
pub mod disk;
mod entry;
pub mod health;
pub mod key;
pub mod lifecycle;
pub mod lock;
mod memory;
mod stats;
mod store;
pub mod tags;


// Re-export public types
pub use entry::{current_timestamp_ms, CacheValue, Envelope};
pub use health::{HealthReport, HealthStatus};
pub use lifecycle::{EvictionResult, GcReport, Ttl};
pub use lock::{KeyLock, LockMode};
pub use stats::CacheStats;
pub use store::CacheStore;

// == Public Constants ==
/// Maximum allowed key length in bytes
pub const MAX_KEY_LENGTH: usize = 255;
