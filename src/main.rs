//! Mini Filecache maintenance daemon
//!
//! Opens the cache described by the environment and keeps it tidy with
//! periodic GC sweeps until asked to stop.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mini_filecache::cache::HealthStatus;
use mini_filecache::{spawn_gc_task, CacheStore, Config};

/// Main entry point for the maintenance daemon.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Open the cache engine and log its health
/// 4. Start the periodic GC task
/// 5. Wait for SIGINT/SIGTERM and stop the GC task
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mini_filecache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Mini Filecache maintenance daemon");

    let config = Config::from_env();
    info!(
        "Configuration loaded: cache_dir={}, serializer={:?}, default_ttl={:?}, max_cache_size={:?}, gc_interval={}s",
        config.cache_dir.display(),
        config.serializer,
        config.default_ttl,
        config.max_cache_size,
        config.gc_interval_secs
    );
    let gc_interval = config.gc_interval_secs;

    let cache = CacheStore::open(config).context("failed to open cache")?;
    let health = cache.health_check();
    match health.status {
        HealthStatus::Healthy => info!(
            entries = health.entries,
            total_bytes = health.total_bytes,
            free_space_bytes = ?health.free_space_bytes,
            "Cache healthy"
        ),
        status => warn!(
            ?status,
            report = %serde_json::to_string(&health).unwrap_or_default(),
            "Cache health check reported problems"
        ),
    }

    let cache = Arc::new(Mutex::new(cache));
    let gc_handle = spawn_gc_task(cache.clone(), gc_interval);
    info!("Background GC task started");

    shutdown_signal().await?;

    gc_handle.abort();
    warn!("GC task aborted");

    let stats = cache.lock().await.stats();
    info!(
        gc_runs = stats.gc_runs,
        deletes = stats.deletes,
        entries = stats.total_entries,
        "Shutdown complete"
    );
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.context("failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<anyhow::Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        }
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
    Ok(())
}
