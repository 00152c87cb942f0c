//! Enqueue, inspection and dead letter control.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::backend::{Backend, SharedBackend};
use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::job::{Job, JobId, JobState};

/// Job counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub dead: usize,
}

impl QueueStats {
    pub fn get(&self, state: JobState) -> usize {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Dead => self.dead,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.dead
    }
}

/// Handle used by producers and operators.
///
/// Clones share the backend and the wake-up signal, so a job enqueued
/// through any clone wakes an idle worker of a pool built from it.
#[derive(Clone)]
pub struct Queue {
    backend: SharedBackend,
    config: QueueConfig,
    wakeup: Arc<Notify>,
}

impl Queue {
    /// Create a queue over any backend.
    pub fn new(backend: impl Backend + 'static, config: QueueConfig) -> Self {
        Self::with_shared(SharedBackend::new(backend), config)
    }

    pub fn with_shared(backend: SharedBackend, config: QueueConfig) -> Self {
        Self {
            backend,
            config,
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub(crate) fn wakeup(&self) -> &Arc<Notify> {
        &self.wakeup
    }

    /// Build a pending job and insert it.
    ///
    /// `max_retries` falls back to the configured default.
    pub async fn create_and_enqueue(
        &self,
        command: impl Into<String>,
        max_retries: Option<u32>,
    ) -> Result<JobId> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(QueueError::Config("job command must not be empty".to_string()));
        }

        let job = Job::new(command, max_retries.unwrap_or(self.config.max_retries));
        self.backend.insert(&job).await?;
        self.wakeup.notify_one();

        tracing::debug!(job_id = %job.id, max_retries = job.max_retries, "Job enqueued");
        Ok(job.id)
    }

    pub async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        self.backend.list_jobs(state).await
    }

    pub async fn list_dead_letter_jobs(&self) -> Result<Vec<Job>> {
        self.backend.list_dead_letter().await
    }

    /// Move a dead job back to pending with its attempts reset.
    pub async fn resurrect(&self, id: &JobId) -> Result<Job> {
        let job = self.backend.resurrect(id).await?;
        self.wakeup.notify_one();

        tracing::info!(job_id = %job.id, "Dead job moved back to pending");
        Ok(job)
    }

    /// Count jobs in every state, dead letter included.
    pub async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats {
            dead: self.backend.list_dead_letter().await?.len(),
            ..Default::default()
        };
        for job in self.backend.list_jobs(None).await? {
            match job.state {
                JobState::Pending => stats.pending += 1,
                JobState::Processing => stats.processing += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Dead => stats.dead += 1,
            }
        }
        Ok(stats)
    }
}
