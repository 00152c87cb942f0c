//! Job definition and related types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a job.
///
/// Ids are UUID v7, so they sort by creation time and make a stable
/// tie-breaker when two jobs share a `created_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new JobId.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting to be claimed by a worker.
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Finished successfully. Terminal.
    Completed,
    /// Exhausted its retries and lives in the dead letter store.
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Dead => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a job state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job state: {0}")]
pub struct ParseJobStateError(pub String);

impl FromStr for JobState {
    type Err = ParseJobStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "dead" => Ok(JobState::Dead),
            other => Err(ParseJobStateError(other.to_string())),
        }
    }
}

/// A queued shell command with its retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier, immutable.
    pub id: JobId,
    /// The command to execute, immutable.
    pub command: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Number of failed executions so far.
    pub attempts: u32,
    /// Retry ceiling fixed at creation.
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(command: impl Into<String>, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            command: command.into(),
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the state and refresh `updated_at`.
    pub(crate) fn transition(&mut self, state: JobState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_creation() {
        let job = Job::new("echo hi", 3);
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.created_at, job.updated_at);
    }

    #[test]
    fn test_job_id_uniqueness() {
        let id1 = JobId::new();
        let id2 = JobId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_job_ids_sort_by_creation() {
        let ids: Vec<JobId> = (0..50).map(|_| JobId::new()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_job_id_display_roundtrip() {
        let id = JobId::new();
        let display = id.to_string();
        assert_eq!(display.len(), 36);
        assert_eq!(display.parse::<JobId>().unwrap(), id);
    }

    #[test]
    fn test_job_id_rejects_garbage() {
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn test_job_state_serialization() {
        let json = serde_json::to_string(&JobState::Processing).unwrap();
        assert_eq!(json, "\"processing\"");

        let deserialized: JobState = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, JobState::Processing);
    }

    #[test]
    fn test_job_state_parse() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert_eq!(
            "running".parse::<JobState>(),
            Err(ParseJobStateError("running".to_string()))
        );
    }

    #[test]
    fn test_transition_refreshes_updated_at() {
        let mut job = Job::new("true", 0);
        let before = job.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        job.transition(JobState::Processing);
        assert_eq!(job.state, JobState::Processing);
        assert!(job.updated_at > before);
        assert_eq!(job.created_at, before);
    }

    #[test]
    fn test_job_json_uses_plain_id() {
        let job = Job::new("sleep 1", 2);
        let json = serde_json::to_string(&job).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["id"], serde_json::Value::String(job.id.to_string()));
        assert_eq!(value["state"], "pending");
        assert_eq!(serde_json::from_str::<Job>(&json).unwrap(), job);
    }
}
