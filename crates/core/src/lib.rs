//! # queuectl-core - Durable shell job queue
//!
//! This crate provides the execution engine behind `queuectl`:
//! - `Backend` trait for job and dead letter storage, with an in-memory
//!   implementation
//! - `Job`, `JobId`, `JobState` types
//! - `Queue` for enqueueing, inspecting and resurrecting jobs
//! - `RetryPolicy` for exponential backoff and quarantine decisions
//! - `WorkerPool` for running jobs on concurrent workers
//! - Error types
//!
//! ## Usage
//!
//! ```rust,no_run
//! use queuectl_core::{MemoryBackend, Queue, QueueConfig, ShellExecutor, WorkerConfig, WorkerPool};
//!
//! #[tokio::main]
//! async fn main() -> queuectl_core::Result<()> {
//!     let queue = Queue::new(MemoryBackend::new(), QueueConfig::default());
//!     queue.create_and_enqueue("echo hello", None).await?;
//!
//!     let mut pool = WorkerPool::new(queue, ShellExecutor::new(), WorkerConfig::default());
//!     pool.run_until(2, async {
//!         tokio::signal::ctrl_c().await.ok();
//!     })
//!     .await
//! }
//! ```

mod backend;
mod config;
mod error;
mod executor;
mod job;
mod memory;
mod pool;
mod queue;
mod reaper;
mod retry;
mod worker;

// Re-export main types
pub use backend::{Backend, DynBackend, SharedBackend};
pub use config::{QueueConfig, WorkerConfig, WorkerConfigBuilder};
pub use error::{QueueError, Result};
pub use executor::{Executor, ShellExecutor};
pub use job::{Job, JobId, JobState, ParseJobStateError};
pub use memory::MemoryBackend;
pub use pool::WorkerPool;
pub use queue::{Queue, QueueStats};
pub use reaper::Reaper;
pub use retry::{decide, RetryDecision, RetryPolicy};
