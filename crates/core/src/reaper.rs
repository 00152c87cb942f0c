//! Recovery of orphaned jobs.
//!
//! A job is left in `processing` when the process dies between claiming it
//! and resolving it. Live workers refresh the jobs they run, so a
//! `processing` job untouched for the stale threshold has no owner. The
//! pool sweeps once before spawning workers and then periodically while it
//! runs.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::error::{QueueError, Result};
use crate::job::Job;

/// Reaper that requeues stale `processing` jobs.
pub struct Reaper<B: Backend> {
    backend: B,
    interval: Duration,
    stale_threshold: Duration,
}

impl<B: Backend> Reaper<B> {
    pub fn new(backend: B, interval: Duration, stale_threshold: Duration) -> Self {
        Self {
            backend,
            interval,
            stale_threshold,
        }
    }

    /// Sweep every `interval` until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::debug!("Reaper started");

        let mut interval = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; the pool already swept on start.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(e) = self.sweep().await {
                tracing::error!(error = %e, "Failed to recover stale jobs");
            }
        }

        tracing::debug!("Reaper stopped");
    }

    /// Requeue every stale `processing` job and return them.
    pub async fn sweep(&self) -> Result<Vec<Job>> {
        let cutoff = stale_cutoff(Utc::now(), self.stale_threshold)?;
        let recovered = self.backend.requeue_stale(cutoff).await?;

        if recovered.is_empty() {
            tracing::debug!("No stale processing jobs to recover");
            return Ok(recovered);
        }

        for job in &recovered {
            tracing::info!(
                job_id = %job.id,
                attempts = job.attempts,
                "Recovered stale processing job"
            );
        }
        tracing::info!(count = recovered.len(), "Stale job recovery complete");

        Ok(recovered)
    }
}

fn stale_cutoff(now: DateTime<Utc>, threshold: Duration) -> Result<DateTime<Utc>> {
    let threshold = chrono::Duration::from_std(threshold)
        .map_err(|e| QueueError::Config(format!("stale threshold out of range: {}", e)))?;
    Ok(now.checked_sub_signed(threshold).unwrap_or(DateTime::<Utc>::MIN_UTC))
}
