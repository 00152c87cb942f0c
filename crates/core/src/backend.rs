//! Backend abstraction for job storage.
//!
//! A backend owns two logical tables: the job store (pending, processing and
//! completed jobs) and the dead letter store. Callers never read-modify-write
//! records themselves; every operation here is a single atomic unit, and a
//! job is never visible in both tables or in neither.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::Result;
use crate::job::{Job, JobId, JobState};

/// Backend trait for job queue storage operations.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Backend: Send + Sync {
    // ========== Job Store ==========

    /// Add a new job. Fails with `DuplicateId` if the id is present in
    /// either table.
    async fn insert(&self, job: &Job) -> Result<()>;

    /// Fetch a job from the job store.
    async fn get(&self, id: &JobId) -> Result<Option<Job>>;

    /// Set the state of a stored job and refresh `updated_at`.
    ///
    /// `Dead` is refused with `InvalidTransition`; use `move_to_dead_letter`.
    async fn update_state(&self, id: &JobId, state: JobState) -> Result<()>;

    /// Add one to `attempts` and return the updated job.
    async fn increment_attempts(&self, id: &JobId) -> Result<Job>;

    /// List jobs ordered by `(created_at, id)`, optionally filtered by state.
    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>>;

    /// Claim the oldest pending job, moving it to `Processing`.
    ///
    /// Selection and transition happen as one unit: concurrent callers never
    /// receive the same job. Returns `None` when nothing is pending.
    async fn claim_next_pending(&self) -> Result<Option<Job>>;

    /// Delete a job from the job store.
    async fn remove(&self, id: &JobId) -> Result<()>;

    /// Refresh `updated_at` of a `Processing` job held by a live worker.
    /// Jobs in any other state are left alone.
    async fn touch(&self, id: &JobId) -> Result<()>;

    /// Return `Processing` jobs last touched at or before `cutoff` to
    /// `Pending`. Used to recover jobs orphaned by an unclean shutdown.
    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>>;

    // ========== Dead Letter Store ==========

    /// Move a job from the job store to the dead letter store as `Dead`.
    async fn move_to_dead_letter(&self, id: &JobId) -> Result<Job>;

    /// List dead jobs ordered by `(updated_at, id)`.
    async fn list_dead_letter(&self) -> Result<Vec<Job>>;

    /// Move a dead job back to the job store as `Pending` with zero attempts.
    async fn resurrect(&self, id: &JobId) -> Result<Job>;
}

/// A type-erased backend that can be shared across threads.
pub type DynBackend = Arc<dyn Backend>;

/// Wrapper around Arc<dyn Backend> for convenience.
#[derive(Clone)]
pub struct SharedBackend {
    inner: DynBackend,
}

impl SharedBackend {
    /// Create a new SharedBackend from any Backend implementation.
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        Self {
            inner: Arc::new(backend),
        }
    }

    /// Get a reference to the inner backend.
    pub fn inner(&self) -> &DynBackend {
        &self.inner
    }
}

impl From<DynBackend> for SharedBackend {
    fn from(inner: DynBackend) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Backend for SharedBackend {
    async fn insert(&self, job: &Job) -> Result<()> {
        self.inner.insert(job).await
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        self.inner.get(id).await
    }

    async fn update_state(&self, id: &JobId, state: JobState) -> Result<()> {
        self.inner.update_state(id, state).await
    }

    async fn increment_attempts(&self, id: &JobId) -> Result<Job> {
        self.inner.increment_attempts(id).await
    }

    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        self.inner.list_jobs(state).await
    }

    async fn claim_next_pending(&self) -> Result<Option<Job>> {
        self.inner.claim_next_pending().await
    }

    async fn remove(&self, id: &JobId) -> Result<()> {
        self.inner.remove(id).await
    }

    async fn touch(&self, id: &JobId) -> Result<()> {
        self.inner.touch(id).await
    }

    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        self.inner.requeue_stale(cutoff).await
    }

    async fn move_to_dead_letter(&self, id: &JobId) -> Result<Job> {
        self.inner.move_to_dead_letter(id).await
    }

    async fn list_dead_letter(&self) -> Result<Vec<Job>> {
        self.inner.list_dead_letter().await
    }

    async fn resurrect(&self, id: &JobId) -> Result<Job> {
        self.inner.resurrect(id).await
    }
}
