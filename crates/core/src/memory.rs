//! In-process backend.
//!
//! Both tables sit behind one mutex, so every operation (including moves
//! between the job store and the dead letter store) is a single critical
//! section. Nothing is persisted; use it for tests and embedding.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::Backend;
use crate::error::{QueueError, Result};
use crate::job::{Job, JobId, JobState};

#[derive(Default)]
struct Tables {
    jobs: BTreeMap<JobId, Job>,
    dead: BTreeMap<JobId, Job>,
}

/// Backend that keeps both tables in memory.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| QueueError::StoreUnavailable("memory store lock poisoned".to_string()))
    }
}

fn sorted_by<K: Ord>(mut jobs: Vec<Job>, key: impl Fn(&Job) -> K) -> Vec<Job> {
    jobs.sort_by_key(key);
    jobs
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn insert(&self, job: &Job) -> Result<()> {
        let mut tables = self.lock()?;
        if tables.jobs.contains_key(&job.id) || tables.dead.contains_key(&job.id) {
            return Err(QueueError::DuplicateId(job.id));
        }
        tables.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.lock()?.jobs.get(id).cloned())
    }

    async fn update_state(&self, id: &JobId, state: JobState) -> Result<()> {
        if state == JobState::Dead {
            return Err(QueueError::InvalidTransition { id: *id, state });
        }
        let mut tables = self.lock()?;
        let job = tables.jobs.get_mut(id).ok_or(QueueError::NotFound(*id))?;
        job.transition(state);
        Ok(())
    }

    async fn increment_attempts(&self, id: &JobId) -> Result<Job> {
        let mut tables = self.lock()?;
        let job = tables.jobs.get_mut(id).ok_or(QueueError::NotFound(*id))?;
        job.attempts += 1;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        let tables = self.lock()?;
        let jobs = tables
            .jobs
            .values()
            .filter(|job| state.map_or(true, |s| job.state == s))
            .cloned()
            .collect();
        Ok(sorted_by(jobs, |job| (job.created_at, job.id)))
    }

    async fn claim_next_pending(&self) -> Result<Option<Job>> {
        let mut tables = self.lock()?;
        let next = tables
            .jobs
            .values()
            .filter(|job| job.state == JobState::Pending)
            .min_by_key(|job| (job.created_at, job.id))
            .map(|job| job.id);

        Ok(next.and_then(|id| {
            tables.jobs.get_mut(&id).map(|job| {
                job.transition(JobState::Processing);
                job.clone()
            })
        }))
    }

    async fn remove(&self, id: &JobId) -> Result<()> {
        self.lock()?
            .jobs
            .remove(id)
            .map(|_| ())
            .ok_or(QueueError::NotFound(*id))
    }

    async fn touch(&self, id: &JobId) -> Result<()> {
        let mut tables = self.lock()?;
        let job = tables.jobs.get_mut(id).ok_or(QueueError::NotFound(*id))?;
        if job.state == JobState::Processing {
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut tables = self.lock()?;
        let requeued = tables
            .jobs
            .values_mut()
            .filter(|job| job.state == JobState::Processing && job.updated_at <= cutoff)
            .map(|job| {
                job.transition(JobState::Pending);
                job.clone()
            })
            .collect();
        Ok(sorted_by(requeued, |job| (job.created_at, job.id)))
    }

    async fn move_to_dead_letter(&self, id: &JobId) -> Result<Job> {
        let mut tables = self.lock()?;
        let mut job = tables.jobs.remove(id).ok_or(QueueError::NotFound(*id))?;
        job.transition(JobState::Dead);
        tables.dead.insert(job.id, job.clone());
        Ok(job)
    }

    async fn list_dead_letter(&self) -> Result<Vec<Job>> {
        let jobs = self.lock()?.dead.values().cloned().collect();
        Ok(sorted_by(jobs, |job| (job.updated_at, job.id)))
    }

    async fn resurrect(&self, id: &JobId) -> Result<Job> {
        let mut tables = self.lock()?;
        let mut job = tables.dead.remove(id).ok_or(QueueError::NotFound(*id))?;
        job.attempts = 0;
        job.transition(JobState::Pending);
        tables.jobs.insert(job.id, job.clone());
        Ok(job)
    }
}
