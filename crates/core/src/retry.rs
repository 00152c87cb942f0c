//! Retry policy: exponential backoff with a per-job retry ceiling.

use std::time::Duration;

use crate::config::QueueConfig;
use crate::job::Job;

/// What to do with a job after a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this many backoff units, then put the job back to pending.
    Retry(u64),
    /// Move the job to the dead letter store.
    Quarantine,
}

/// Decide between retry and quarantine.
///
/// `attempts` is the count after the failure has been recorded. A job is
/// retried while `attempts <= max_retries`, waiting `backoff_base^attempts`
/// units; the delay saturates instead of overflowing.
pub fn decide(attempts: u32, max_retries: u32, backoff_base: u64) -> RetryDecision {
    if attempts <= max_retries {
        RetryDecision::Retry(backoff_base.saturating_pow(attempts))
    } else {
        RetryDecision::Quarantine
    }
}

/// The retry decision bound to a backoff base and a time unit.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    backoff_base: u64,
    unit: Duration,
}

impl RetryPolicy {
    pub fn new(backoff_base: u64, unit: Duration) -> Self {
        Self { backoff_base, unit }
    }

    pub fn from_config(config: &QueueConfig, unit: Duration) -> Self {
        Self::new(config.backoff_base, unit)
    }

    /// Decide for a job whose `attempts` already includes the latest failure.
    pub fn decide(&self, job: &Job) -> RetryDecision {
        decide(job.attempts, job.max_retries, self.backoff_base)
    }

    /// Wall-clock length of a delay measured in backoff units.
    pub fn delay(&self, units: u64) -> Duration {
        let units = u32::try_from(units).unwrap_or(u32::MAX);
        self.unit.saturating_mul(units)
    }
}
