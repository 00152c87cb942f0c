//! Job command execution.
//!
//! The worker treats a command as opaque: an [`Executor`] runs it to
//! completion and reports success or an `ExecutionFailure`.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{QueueError, Result};
use crate::job::Job;

/// Runs a job's command to completion.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Returns `Ok(())` on success and `Err(QueueError::ExecutionFailure)` on
    /// a non-success result or when the command could not be started.
    async fn execute(&self, job: &Job) -> Result<()>;
}

/// Runs commands through `sh -c`.
///
/// The child is never killed by the queue; a running command always finishes.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different POSIX shell, e.g. `bash`.
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(&self, job: &Job) -> Result<()> {
        let status = Command::new(&self.shell)
            .arg("-c")
            .arg(&job.command)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| {
                QueueError::ExecutionFailure(format!("failed to spawn {}: {}", self.shell, e))
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(QueueError::ExecutionFailure(match status.code() {
                Some(code) => format!("exited with status {}", code),
                None => "terminated by signal".to_string(),
            }))
        }
    }
}
