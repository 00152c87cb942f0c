//! Configuration types for the job queue.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{QueueError, Result};

/// Queue-wide settings read by the retry policy and the enqueue path.
///
/// Persisted as a small JSON document so operators can change the defaults
/// between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Retry ceiling for jobs enqueued without an explicit one.
    pub max_retries: u32,
    /// Base of the exponential backoff, in backoff units.
    pub backoff_base: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2,
        }
    }
}

impl QueueConfig {
    pub const KEYS: [&'static str; 2] = ["max_retries", "backoff_base"];

    /// Load the config file, writing the defaults first if it does not exist.
    pub fn load_or_init(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            tracing::debug!(path = %path.display(), "Wrote default config");
            return Ok(config);
        }
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            QueueError::Config(format!("invalid config file {}: {}", path.display(), e))
        })
    }

    /// Write the config as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Set a key from its textual value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "max_retries" => self.max_retries = parse_value(key, value)?,
            "backoff_base" => self.backoff_base = parse_value(key, value)?,
            other => return Err(unknown_key(other)),
        }
        Ok(())
    }

    /// Read a key as an integer.
    pub fn get(&self, key: &str) -> Result<u64> {
        match key {
            "max_retries" => Ok(u64::from(self.max_retries)),
            "backoff_base" => Ok(self.backoff_base),
            other => Err(unknown_key(other)),
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        QueueError::Config(format!(
            "{} expects a non-negative integer, got {:?}",
            key, value
        ))
    })
}

fn unknown_key(key: &str) -> QueueError {
    QueueError::Config(format!(
        "unknown config key {:?} (expected one of: {})",
        key,
        QueueConfig::KEYS.join(", ")
    ))
}

/// Configuration for the WorkerPool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Upper bound on how long an idle worker sleeps before polling again.
    pub poll_interval: Duration,
    /// Length of one backoff unit; a delay of `n` units waits `n * backoff_unit`.
    pub backoff_unit: Duration,
    /// Processing jobs untouched for this long are considered orphaned and
    /// requeued.
    pub stale_threshold: Duration,
    /// How often a worker refreshes the job it is running.
    pub heartbeat_interval: Duration,
    /// How often the pool looks for orphaned processing jobs.
    pub reaper_interval: Duration,
    /// How many times a store update is tried before giving up.
    pub store_retry_attempts: u32,
    /// Pause between store update tries.
    pub store_retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            backoff_unit: Duration::from_secs(1),
            stale_threshold: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(10),
            reaper_interval: Duration::from_secs(15),
            store_retry_attempts: 3,
            store_retry_delay: Duration::from_millis(100),
        }
    }
}

/// Builder for WorkerConfig.
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the idle poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the backoff unit.
    pub fn backoff_unit(mut self, unit: Duration) -> Self {
        self.config.backoff_unit = unit;
        self
    }

    /// Set the stale threshold used by the reaper.
    pub fn stale_threshold(mut self, threshold: Duration) -> Self {
        self.config.stale_threshold = threshold;
        self
    }

    /// Set the heartbeat interval for running jobs.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set the reaper interval.
    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.config.reaper_interval = interval;
        self
    }

    /// Set the number of tries for store updates (at least one).
    pub fn store_retry_attempts(mut self, attempts: u32) -> Self {
        self.config.store_retry_attempts = attempts.max(1);
        self
    }

    /// Set the pause between store update tries.
    pub fn store_retry_delay(mut self, delay: Duration) -> Self {
        self.config.store_retry_delay = delay;
        self
    }

    /// Build the WorkerConfig.
    pub fn build(self) -> WorkerConfig {
        self.config
    }
}

impl WorkerConfig {
    /// Create a new builder.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::new()
    }
}
