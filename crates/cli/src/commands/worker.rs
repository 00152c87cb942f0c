//! Worker commands.

use anyhow::{Context, Result};
use queuectl_core::{ShellExecutor, WorkerConfig, WorkerPool};
use std::future::Future;
use std::io;
use std::time::Duration;

use super::Store;

pub async fn start(store: &Store, count: usize, stale_after: u64) -> Result<()> {
    let queue = store.open().await?;
    let config = worker_config(Duration::from_secs(stale_after));

    let mut pool = WorkerPool::new(queue, ShellExecutor::new(), config);
    serve(&mut pool, count, tokio::signal::ctrl_c()).await?;
    println!("All workers stopped.");
    Ok(())
}

/// Run the pool until `shutdown` resolves. A failed shutdown signal still
/// stops the pool, then surfaces as an error.
async fn serve<S>(pool: &mut WorkerPool, count: usize, shutdown: S) -> Result<()>
where
    S: Future<Output = io::Result<()>>,
{
    pool.start(count).await?;
    println!("{} worker(s) started. Press Ctrl+C to stop.", count);

    let signal = shutdown.await;
    tracing::info!("Shutdown requested");
    pool.stop().await;
    signal.context("failed to listen for Ctrl+C")
}

/// Heartbeats must land well inside the stale threshold.
fn worker_config(stale_threshold: Duration) -> WorkerConfig {
    let heartbeat = WorkerConfig::default()
        .heartbeat_interval
        .min(stale_threshold / 3);
    WorkerConfig::builder()
        .stale_threshold(stale_threshold)
        .heartbeat_interval(heartbeat)
        .build()
}
