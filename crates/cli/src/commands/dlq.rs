//! Dead letter commands.

use anyhow::{Context, Result};
use queuectl_core::JobId;

use super::Store;

pub async fn list(store: &Store) -> Result<()> {
    let jobs = store.open().await?.list_dead_letter_jobs().await?;
    if jobs.is_empty() {
        println!("Dead letter queue is empty.");
    }
    for job in jobs {
        println!(
            "{} - {} - state: {} - attempts: {}",
            job.id, job.command, job.state, job.attempts
        );
    }
    Ok(())
}

pub async fn retry(store: &Store, job_id: &str) -> Result<()> {
    let id: JobId = job_id
        .parse()
        .with_context(|| format!("invalid job id {:?}", job_id))?;
    store.open().await?.resurrect(&id).await?;
    println!("Job {} moved back to pending.", id);
    Ok(())
}
