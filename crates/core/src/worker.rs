//! Individual worker: claim, execute, resolve.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, SharedBackend};
use crate::config::WorkerConfig;
use crate::error::{QueueError, Result};
use crate::executor::Executor;
use crate::job::{Job, JobId, JobState};
use crate::retry::{RetryDecision, RetryPolicy};

/// Individual worker that processes jobs.
pub(crate) struct Worker {
    id: usize,
    backend: SharedBackend,
    executor: Arc<dyn Executor>,
    policy: RetryPolicy,
    config: WorkerConfig,
    wakeup: Arc<Notify>,
    cancel: CancellationToken,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        backend: SharedBackend,
        executor: Arc<dyn Executor>,
        policy: RetryPolicy,
        config: WorkerConfig,
        wakeup: Arc<Notify>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            backend,
            executor,
            policy,
            config,
            wakeup,
            cancel,
        }
    }

    pub(crate) async fn run(self) {
        tracing::debug!(worker_id = self.id, "Worker started");

        while !self.cancel.is_cancelled() {
            match self.backend.claim_next_pending().await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => self.idle().await,
                Err(e) => {
                    tracing::error!(worker_id = self.id, error = %e, "Failed to claim job");
                    self.idle().await;
                }
            }
        }

        tracing::debug!(worker_id = self.id, "Worker stopped");
    }

    /// Wait for an enqueue notification, the poll interval or shutdown.
    async fn idle(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.wakeup.notified() => {}
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }

    async fn process(&self, job: Job) {
        tracing::info!(
            worker_id = self.id,
            job_id = %job.id,
            command = %job.command,
            attempts = job.attempts,
            "Executing job"
        );

        let outcome = self.execute_with_heartbeat(&job).await;

        let resolved = if self.cancel.is_cancelled() {
            tracing::info!(
                worker_id = self.id,
                job_id = %job.id,
                succeeded = outcome.is_ok(),
                "Interrupted by shutdown, returning job to pending"
            );
            self.set_state(&job.id, JobState::Pending).await
        } else {
            match outcome {
                Ok(()) => self.complete(&job).await,
                Err(e) => self.handle_failure(&job, e).await,
            }
        };

        if let Err(e) = resolved {
            tracing::error!(
                worker_id = self.id,
                job_id = %job.id,
                error = %e,
                "Failed to resolve job"
            );
        }
    }

    /// Run the job, refreshing it in the store so the reaper leaves it alone.
    async fn execute_with_heartbeat(&self, job: &Job) -> Result<()> {
        let execution = self.executor.execute(job);
        tokio::pin!(execution);

        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                outcome = &mut execution => return outcome,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.backend.touch(&job.id).await {
                        tracing::warn!(
                            worker_id = self.id,
                            job_id = %job.id,
                            error = %e,
                            "Failed to send heartbeat"
                        );
                    }
                }
            }
        }
    }

    async fn complete(&self, job: &Job) -> Result<()> {
        self.set_state(&job.id, JobState::Completed).await?;
        tracing::info!(worker_id = self.id, job_id = %job.id, "Job completed");
        Ok(())
    }

    async fn handle_failure(&self, job: &Job, error: QueueError) -> Result<()> {
        let job = self
            .with_store_retries("increment_attempts", &job.id, || {
                self.backend.increment_attempts(&job.id)
            })
            .await?;

        match self.policy.decide(&job) {
            RetryDecision::Retry(units) => {
                let delay = self.policy.delay(units);
                tracing::warn!(
                    worker_id = self.id,
                    job_id = %job.id,
                    attempts = job.attempts,
                    max_retries = job.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job failed, retrying after backoff"
                );

                let interrupted = tokio::select! {
                    _ = self.cancel.cancelled() => true,
                    _ = tokio::time::sleep(delay) => false,
                };

                // The attempt is already counted, so an interrupted wait
                // still hands the job back.
                self.set_state(&job.id, JobState::Pending).await?;
                if interrupted {
                    tracing::info!(
                        worker_id = self.id,
                        job_id = %job.id,
                        "Backoff interrupted by shutdown, job returned to pending"
                    );
                }
            }
            RetryDecision::Quarantine => {
                self.with_store_retries("move_to_dead_letter", &job.id, || {
                    self.backend.move_to_dead_letter(&job.id)
                })
                .await?;
                tracing::warn!(
                    worker_id = self.id,
                    job_id = %job.id,
                    attempts = job.attempts,
                    error = %error,
                    "Job exhausted retries, moved to dead letter store"
                );
            }
        }

        Ok(())
    }

    async fn set_state(&self, id: &JobId, state: JobState) -> Result<()> {
        self.with_store_retries("update_state", id, || self.backend.update_state(id, state))
            .await
    }

    /// Run a store operation, retrying transient failures a bounded number
    /// of times.
    async fn with_store_retries<T, F, Fut>(&self, op: &str, job_id: &JobId, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Err(e) if e.is_transient() && attempt < self.config.store_retry_attempts => {
                    tracing::warn!(
                        worker_id = self.id,
                        job_id = %job_id,
                        op,
                        attempt,
                        error = %e,
                        "Store operation failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.config.store_retry_delay).await;
                }
                result => return result,
            }
        }
    }
}
