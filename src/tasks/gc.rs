//! Periodic GC Task
//!
//! Background task that periodically sweeps expired and corrupt entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;

/// Spawns a background task that runs a forced GC sweep every interval.
///
/// Each sweep runs on the blocking thread pool because the engine does
/// synchronous file I/O.
///
/// # Arguments
/// * `cache` - Arc<Mutex<CacheStore>> shared reference to the engine
/// * `interval_secs` - Interval in seconds between sweeps
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during graceful shutdown.
///
/// # Example
/// ```ignore
/// let cache = Arc::new(Mutex::new(CacheStore::open(config)?));
/// let gc_handle = spawn_gc_task(cache.clone(), 60);
/// // Later, during shutdown:
/// gc_handle.abort();
/// ```
pub fn spawn_gc_task(cache: Arc<Mutex<CacheStore>>, interval_secs: u64) -> JoinHandle<()> {
    let interval = Duration::from_secs(interval_secs.max(1));

    tokio::spawn(async move {
        info!("Starting GC task with interval of {} seconds", interval.as_secs());

        loop {
            tokio::time::sleep(interval).await;

            let cache = cache.clone();
            let swept = tokio::task::spawn_blocking(move || {
                let mut guard = cache.blocking_lock();
                guard.gc(true)
            })
            .await;

            match swept {
                Ok(Ok(removed)) if removed > 0 => {
                    info!("GC: removed {} expired or corrupt entries", removed)
                }
                Ok(Ok(_)) => debug!("GC: nothing to remove"),
                Ok(Err(e)) => warn!(error = %e, "GC sweep failed"),
                Err(e) => warn!(error = %e, "GC sweep task panicked"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Ttl;
    use crate::config::Config;
    use tempfile::TempDir;

    fn shared_cache(dir: &TempDir) -> Arc<Mutex<CacheStore>> {
        let mut config = Config::new(dir.path());
        config.gc_probability = 0;
        Arc::new(Mutex::new(CacheStore::open(config).unwrap()))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_gc_task_removes_expired_entries() {
        let dir = TempDir::new().unwrap();
        let cache = shared_cache(&dir);

        // Add an entry with very short TTL
        let path = {
            let mut guard = cache.lock().await;
            guard.set("expire_soon", "value", Some(Ttl::seconds(1))).unwrap();
            guard.entry_path("expire_soon").unwrap()
        };

        let handle = spawn_gc_task(cache.clone(), 1);

        // Wait for the entry to expire and a sweep to run
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert!(!path.exists(), "Expired entry should have been swept");
        assert!(cache.lock().await.stats().gc_runs >= 1);

        handle.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_gc_task_preserves_valid_entries() {
        let dir = TempDir::new().unwrap();
        let cache = shared_cache(&dir);

        {
            let mut guard = cache.lock().await;
            guard.set("long_lived", "value", Some(Ttl::seconds(3600))).unwrap();
        }

        let handle = spawn_gc_task(cache.clone(), 1);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        {
            let mut guard = cache.lock().await;
            assert!(guard.has("long_lived").unwrap(), "Valid entry should not be removed");
        }

        handle.abort();
    }

    #[tokio::test]
    async fn test_gc_task_can_be_aborted() {
        let dir = TempDir::new().unwrap();
        let handle = spawn_gc_task(shared_cache(&dir), 1);

        handle.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_finished(), "Task should be finished after abort");
    }
}
