//! CLI command implementations.

use anyhow::{Context, Result};
use queuectl_core::{JobState, Queue, QueueConfig};
use queuectl_sqlite::SqliteBackend;
use serde::Deserialize;
use std::path::PathBuf;

pub mod config;
pub mod dlq;
pub mod worker;

/// Where the queue lives on disk.
pub struct Store {
    pub db: PathBuf,
    pub namespace: String,
    pub config: PathBuf,
}

impl Store {
    pub fn load_config(&self) -> Result<QueueConfig> {
        QueueConfig::load_or_init(&self.config)
            .with_context(|| format!("failed to load config from {}", self.config.display()))
    }

    pub async fn open(&self) -> Result<Queue> {
        let config = self.load_config()?;
        let backend = SqliteBackend::open(&self.db, &self.namespace)
            .await
            .with_context(|| format!("failed to open {}", self.db.display()))?;
        Ok(Queue::new(backend, config))
    }
}

#[derive(Deserialize)]
struct EnqueueRequest {
    command: String,
    max_retries: Option<u32>,
}

pub async fn enqueue(store: &Store, job_json: &str) -> Result<()> {
    let request: EnqueueRequest =
        serde_json::from_str(job_json).context("job must be JSON like {\"command\": \"...\"}")?;
    let queue = store.open().await?;
    let id = queue
        .create_and_enqueue(request.command, request.max_retries)
        .await?;
    println!("Job {} enqueued.", id);
    Ok(())
}

pub async fn status(store: &Store) -> Result<()> {
    let stats = store.open().await?.stats().await?;
    println!("Job States Summary:");
    for state in JobState::ALL {
        println!("{}: {}", state, stats.get(state));
    }
    Ok(())
}

pub async fn list(store: &Store, state: Option<&str>) -> Result<()> {
    let state = state.map(str::parse::<JobState>).transpose()?;
    let jobs = store.open().await?.list_jobs(state).await?;
    if jobs.is_empty() {
        println!("No jobs.");
    }
    for job in jobs {
        println!(
            "{} - {} - {} - attempts: {} (max retries: {})",
            job.id, job.command, job.state, job.attempts, job.max_retries
        );
    }
    Ok(())
}
