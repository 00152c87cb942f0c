//! Error types for the queuectl job queue.

use thiserror::Error;

use crate::job::{JobId, JobState};

/// The main error type for the job queue.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The operation referenced a job id that is not stored.
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// A job with this id already exists in the job store or the dead letter store.
    #[error("Duplicate job id: {0}")]
    DuplicateId(JobId),

    /// The requested state change is not allowed through this operation.
    #[error("Invalid transition for job {id} to state {state}")]
    InvalidTransition { id: JobId, state: JobState },

    /// The job's command returned non-success or could not be run.
    #[error("Execution failure: {0}")]
    ExecutionFailure(String),

    /// The underlying persistence layer failed.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A stored record could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Worker pool error.
    #[error("Worker pool error: {0}")]
    WorkerPool(String),
}

impl QueueError {
    /// Whether retrying the same store operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::StoreUnavailable(_))
    }
}

/// Result type alias using QueueError.
pub type Result<T> = std::result::Result<T, QueueError>;
