//! Worker pool controller.

use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{QueueError, Result};
use crate::executor::Executor;
use crate::queue::Queue;
use crate::reaper::Reaper;
use crate::retry::RetryPolicy;
use crate::worker::Worker;

/// Owns a set of workers, the reaper and their shared cancellation signal.
///
/// A pool can be started, stopped and started again; every start gets a
/// fresh cancellation token.
pub struct WorkerPool {
    queue: Queue,
    executor: Arc<dyn Executor>,
    config: WorkerConfig,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    workers: usize,
}

impl WorkerPool {
    /// Create a stopped pool.
    pub fn new(queue: Queue, executor: impl Executor + 'static, config: WorkerConfig) -> Self {
        Self {
            queue,
            executor: Arc::new(executor),
            config,
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
            workers: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Number of workers spawned by the current run.
    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Recover stale jobs, then spawn `count` workers and the reaper.
    pub async fn start(&mut self, count: usize) -> Result<()> {
        if self.is_running() {
            return Err(QueueError::WorkerPool("pool is already running".to_string()));
        }
        if count == 0 {
            return Err(QueueError::WorkerPool(
                "worker count must be at least 1".to_string(),
            ));
        }

        let reaper = Reaper::new(
            self.queue.backend().clone(),
            self.config.reaper_interval,
            self.config.stale_threshold,
        );
        if let Err(e) = reaper.sweep().await {
            tracing::warn!(error = %e, "Failed to recover stale jobs, continuing anyway");
        }

        self.cancel = CancellationToken::new();
        let policy = RetryPolicy::from_config(self.queue.config(), self.config.backoff_unit);

        for worker_id in 1..=count {
            let worker = Worker::new(
                worker_id,
                self.queue.backend().clone(),
                self.executor.clone(),
                policy,
                self.config.clone(),
                self.queue.wakeup().clone(),
                self.cancel.clone(),
            );
            self.tasks.spawn(worker.run());
        }
        self.tasks.spawn(reaper.run(self.cancel.clone()));
        self.workers = count;

        tracing::info!(
            workers = count,
            backoff_base = self.queue.config().backoff_base,
            "Worker pool started"
        );
        Ok(())
    }

    /// Signal every worker and wait until all have exited.
    ///
    /// Calling this on a stopped pool does nothing.
    pub async fn stop(&mut self) {
        if !self.is_running() {
            tracing::debug!("Worker pool already stopped");
            return;
        }

        tracing::info!(workers = self.workers, "Stopping workers...");
        self.cancel.cancel();

        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        self.workers = 0;

        tracing::info!("All workers stopped");
    }

    /// Start `count` workers, wait for `shutdown`, then stop.
    pub async fn run_until<S>(&mut self, count: usize, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        self.start(count).await?;
        shutdown.await;
        tracing::info!("Shutdown requested");
        self.stop().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::config::QueueConfig;
    use crate::executor::ShellExecutor;
    use crate::job::{Job, JobId, JobState};
    use crate::memory::MemoryBackend;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Succeeds unless told to fail; records every run.
    #[derive(Clone, Default)]
    struct ScriptedExecutor {
        fail: Arc<AtomicBool>,
        delay: Duration,
        runs: Arc<Mutex<Vec<JobId>>>,
    }

    impl ScriptedExecutor {
        fn failing() -> Self {
            let executor = Self::default();
            executor.fail.store(true, Ordering::SeqCst);
            executor
        }

        fn runs(&self) -> Vec<JobId> {
            self.runs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn execute(&self, job: &Job) -> Result<()> {
            self.runs.lock().unwrap().push(job.id);
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                Err(QueueError::ExecutionFailure("scripted failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    /// Fails the first `failures` state updates with a transient error.
    #[derive(Clone)]
    struct FlakyBackend {
        inner: MemoryBackend,
        failures: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Backend for FlakyBackend {
        async fn insert(&self, job: &Job) -> Result<()> {
            self.inner.insert(job).await
        }
        async fn get(&self, id: &JobId) -> Result<Option<Job>> {
            self.inner.get(id).await
        }
        async fn update_state(&self, id: &JobId, state: JobState) -> Result<()> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(QueueError::StoreUnavailable("database is locked".to_string()));
            }
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

    fn fast_config() -> WorkerConfig {
        WorkerConfig::builder()
            .poll_interval(Duration::from_millis(10))
            .backoff_unit(Duration::from_millis(10))
            .stale_threshold(Duration::ZERO)
            .reaper_interval(Duration::from_secs(3600))
            .store_retry_delay(Duration::from_millis(1))
            .build()
    }

    fn memory_queue() -> Queue {
        Queue::new(MemoryBackend::new(), QueueConfig::default())
    }

    async fn state_of(queue: &Queue, id: &JobId) -> Option<JobState> {
        queue.backend().get(id).await.unwrap().map(|job| job.state)
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_successful_shell_job_completes() {
        let queue = memory_queue();
        let id = queue.create_and_enqueue("exit 0", Some(3)).await.unwrap();

        let mut pool = WorkerPool::new(queue.clone(), ShellExecutor::new(), fast_config());
        pool.start(1).await.unwrap();

        wait_for(|| {
            let queue = queue.clone();
            async move { state_of(&queue, &id).await == Some(JobState::Completed) }
        })
        .await;

        pool.stop().await;
        let job = queue.backend().get(&id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failing_shell_job_is_dead_lettered_after_retries() {
        let queue = Queue::new(
            MemoryBackend::new(),
            QueueConfig {
                max_retries: 3,
                backoff_base: 2,
            },
        );
        let id = queue.create_and_enqueue("exit 1", Some(2)).await.unwrap();

        let mut pool = WorkerPool::new(queue.clone(), ShellExecutor::new(), fast_config());
        pool.start(1).await.unwrap();

        wait_for(|| {
            let queue = queue.clone();
            async move { !queue.list_dead_letter_jobs().await.unwrap().is_empty() }
        })
        .await;
        pool.stop().await;

        let dead = queue.list_dead_letter_jobs().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, id);
        assert_eq!(dead[0].state, JobState::Dead);
        assert_eq!(dead[0].attempts, 3);
        assert!(queue.backend().get(&id).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_backoff_waits_grow_exponentially() {
        let queue = Queue::new(
            MemoryBackend::new(),
            QueueConfig {
                max_retries: 3,
                backoff_base: 2,
            },
        );
        let id = queue.create_and_enqueue("exit 1", Some(2)).await.unwrap();
        let config = WorkerConfig::builder()
            .poll_interval(Duration::from_millis(10))
            .backoff_unit(Duration::from_millis(50))
            .reaper_interval(Duration::from_secs(3600))
            .build();

        let started = tokio::time::Instant::now();
        let mut pool = WorkerPool::new(queue.clone(), ScriptedExecutor::failing(), config);
        pool.start(1).await.unwrap();
        wait_for(|| {
            let queue = queue.clone();
            async move { queue.stats().await.unwrap().dead == 1 }
        })
        .await;
        let elapsed = started.elapsed();
        pool.stop().await;

        // Waits of 2 and 4 units; a third wait would add another 8.
        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(700), "{elapsed:?}");
        assert_eq!(queue.list_dead_letter_jobs().await.unwrap()[0].id, id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_job_runs_max_retries_plus_one_times() {
        let queue = memory_queue();
        let id = queue.create_and_enqueue("anything", Some(4)).await.unwrap();
        let executor = ScriptedExecutor::failing();

        let mut pool = WorkerPool::new(queue.clone(), executor.clone(), fast_config());
        pool.start(2).await.unwrap();

        wait_for(|| {
            let queue = queue.clone();
            async move { queue.stats().await.unwrap().dead == 1 }
        })
        .await;
        pool.stop().await;

        assert_eq!(executor.runs(), vec![id; 5]);
        assert_eq!(queue.list_dead_letter_jobs().await.unwrap()[0].attempts, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_three_workers_run_each_job_once() {
        let queue = memory_queue();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(queue.create_and_enqueue(format!("job {i}"), None).await.unwrap());
        }
        let executor = ScriptedExecutor {
            delay: Duration::from_millis(20),
            ..Default::default()
        };

        let mut pool = WorkerPool::new(queue.clone(), executor.clone(), fast_config());
        pool.start(3).await.unwrap();
        assert_eq!(pool.worker_count(), 3);

        wait_for(|| {
            let queue = queue.clone();
            async move { queue.stats().await.unwrap().completed == 5 }
        })
        .await;
        pool.stop().await;

        let mut counts: HashMap<JobId, usize> = HashMap::new();
        for id in executor.runs() {
            *counts.entry(id).or_default() += 1;
        }
        assert_eq!(counts.len(), 5);
        assert!(counts.values().all(|&n| n == 1));
        for id in &ids {
            assert_eq!(counts[id], 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_idle_worker_wakes_on_enqueue() {
        let queue = memory_queue();
        let config = WorkerConfig::builder()
            .poll_interval(Duration::from_secs(3600))
            .build();
        let mut pool = WorkerPool::new(queue.clone(), ScriptedExecutor::default(), config);
        pool.start(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let id = queue.create_and_enqueue("wake up", None).await.unwrap();
        wait_for(|| {
            let queue = queue.clone();
            async move { state_of(&queue, &id).await == Some(JobState::Completed) }
        })
        .await;
        pool.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_is_idempotent() {
        let mut pool = WorkerPool::new(memory_queue(), ScriptedExecutor::default(), fast_config());

        pool.stop().await;
        pool.start(2).await.unwrap();
        assert!(pool.is_running());

        pool.stop().await;
        assert!(!pool.is_running());
        assert_eq!(pool.worker_count(), 0);

        pool.stop().await;
        assert!(!pool.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_until_stops_when_shutdown_resolves() {
        let queue = memory_queue();
        let id = queue.create_and_enqueue("before shutdown", None).await.unwrap();
        let mut pool = WorkerPool::new(queue.clone(), ScriptedExecutor::default(), fast_config());

        let watched = queue.clone();
        pool.run_until(1, async move {
            wait_for(|| {
                let queue = watched.clone();
                async move { state_of(&queue, &id).await == Some(JobState::Completed) }
            })
            .await;
        })
        .await
        .unwrap();

        assert!(!pool.is_running());
        assert_eq!(pool.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_start_rejects_running_pool_and_zero_workers() {
        let mut pool = WorkerPool::new(memory_queue(), ScriptedExecutor::default(), fast_config());
        assert!(matches!(pool.start(0).await, Err(QueueError::WorkerPool(_))));

        pool.start(1).await.unwrap();
        assert!(matches!(pool.start(1).await, Err(QueueError::WorkerPool(_))));
        pool.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_can_restart_after_stop() {
        let queue = memory_queue();
        let mut pool = WorkerPool::new(queue.clone(), ScriptedExecutor::default(), fast_config());
        pool.start(1).await.unwrap();
        pool.stop().await;

        let id = queue.create_and_enqueue("second run", None).await.unwrap();
        pool.start(1).await.unwrap();
        wait_for(|| {
            let queue = queue.clone();
            async move { state_of(&queue, &id).await == Some(JobState::Completed) }
        })
        .await;
        pool.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_interrupts_backoff_and_requeues() {
        let queue = memory_queue();
        let id = queue.create_and_enqueue("flaky", Some(3)).await.unwrap();
        let config = WorkerConfig::builder()
            .poll_interval(Duration::from_millis(10))
            .backoff_unit(Duration::from_secs(3600))
            .build();

        let mut pool = WorkerPool::new(queue.clone(), ScriptedExecutor::failing(), config);
        pool.start(1).await.unwrap();
        wait_for(|| {
            let queue = queue.clone();
            async move {
                queue
                    .backend()
                    .get(&id)
                    .await
                    .unwrap()
                    .map_or(false, |job| job.attempts == 1)
            }
        })
        .await;

        tokio::time::timeout(Duration::from_secs(5), pool.stop())
            .await
            .expect("stop must not wait out the backoff");

        let job = queue.backend().get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_during_shutdown_is_not_counted() {
        let queue = memory_queue();
        let id = queue.create_and_enqueue("slow failure", Some(3)).await.unwrap();
        let executor = ScriptedExecutor {
            delay: Duration::from_millis(200),
            ..ScriptedExecutor::failing()
        };

        let mut pool = WorkerPool::new(queue.clone(), executor, fast_config());
        pool.start(1).await.unwrap();
        wait_for(|| {
            let queue = queue.clone();
            async move { state_of(&queue, &id).await == Some(JobState::Processing) }
        })
        .await;
        pool.stop().await;

        let job = queue.backend().get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_success_during_shutdown_returns_job_to_pending() {
        let queue = memory_queue();
        let id = queue.create_and_enqueue("slow success", Some(3)).await.unwrap();
        let executor = ScriptedExecutor {
            delay: Duration::from_millis(300),
            ..Default::default()
        };

        let mut pool = WorkerPool::new(queue.clone(), executor.clone(), fast_config());
        pool.start(1).await.unwrap();
        wait_for(|| {
            let queue = queue.clone();
            async move { state_of(&queue, &id).await == Some(JobState::Processing) }
        })
        .await;
        pool.stop().await;

        let job = queue.backend().get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(executor.runs(), vec![id]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_recently_orphaned_job_is_recovered_while_running() {
        let queue = memory_queue();
        let id = queue.create_and_enqueue("orphan", None).await.unwrap();
        queue.backend().claim_next_pending().await.unwrap();
        let config = WorkerConfig::builder()
            .poll_interval(Duration::from_millis(10))
            .stale_threshold(Duration::from_millis(200))
            .heartbeat_interval(Duration::from_millis(20))
            .reaper_interval(Duration::from_millis(20))
            .build();

        let executor = ScriptedExecutor::default();
        let mut pool = WorkerPool::new(queue.clone(), executor.clone(), config);
        pool.start(1).await.unwrap();
        assert_eq!(state_of(&queue, &id).await, Some(JobState::Processing));

        wait_for(|| {
            let queue = queue.clone();
            async move { state_of(&queue, &id).await == Some(JobState::Completed) }
        })
        .await;
        pool.stop().await;

        assert_eq!(executor.runs(), vec![id]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_long_running_job_is_not_reaped() {
        let queue = memory_queue();
        let id = queue.create_and_enqueue("long job", None).await.unwrap();
        let config = WorkerConfig::builder()
            .poll_interval(Duration::from_millis(10))
            .stale_threshold(Duration::from_millis(100))
            .heartbeat_interval(Duration::from_millis(20))
            .reaper_interval(Duration::from_millis(20))
            .build();
        let executor = ScriptedExecutor {
            delay: Duration::from_millis(500),
            ..Default::default()
        };

        let mut pool = WorkerPool::new(queue.clone(), executor.clone(), config);
        pool.start(2).await.unwrap();
        wait_for(|| {
            let queue = queue.clone();
            async move { state_of(&queue, &id).await == Some(JobState::Completed) }
        })
        .await;
        pool.stop().await;

        assert_eq!(executor.runs(), vec![id]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_recovers_orphaned_processing_jobs() {
        let queue = memory_queue();
        let id = queue.create_and_enqueue("orphan", None).await.unwrap();
        queue.backend().claim_next_pending().await.unwrap();
        assert_eq!(state_of(&queue, &id).await, Some(JobState::Processing));

        let mut pool = WorkerPool::new(queue.clone(), ScriptedExecutor::default(), fast_config());
        pool.start(1).await.unwrap();
        wait_for(|| {
            let queue = queue.clone();
            async move { state_of(&queue, &id).await == Some(JobState::Completed) }
        })
        .await;
        pool.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_transient_store_errors_are_retried() {
        let backend = FlakyBackend {
            inner: MemoryBackend::new(),
            failures: Arc::new(AtomicUsize::new(2)),
        };
        let queue = Queue::new(backend.clone(), QueueConfig::default());
        let id = queue.create_and_enqueue("true", None).await.unwrap();

        let mut pool = WorkerPool::new(queue.clone(), ScriptedExecutor::default(), fast_config());
        pool.start(1).await.unwrap();
        wait_for(|| {
            let queue = queue.clone();
            async move { state_of(&queue, &id).await == Some(JobState::Completed) }
        })
        .await;
        pool.stop().await;

        assert_eq!(backend.failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resurrected_job_runs_again() {
        let queue = memory_queue();
        let id = queue.create_and_enqueue("eventually fine", Some(0)).await.unwrap();
        let executor = ScriptedExecutor::failing();

        let mut pool = WorkerPool::new(queue.clone(), executor.clone(), fast_config());
        pool.start(1).await.unwrap();
        wait_for(|| {
            let queue = queue.clone();
            async move { queue.stats().await.unwrap().dead == 1 }
        })
        .await;

        executor.fail.store(false, Ordering::SeqCst);
        queue.resurrect(&id).await.unwrap();
        wait_for(|| {
            let queue = queue.clone();
            async move { state_of(&queue, &id).await == Some(JobState::Completed) }
        })
        .await;
        pool.stop().await;

        assert_eq!(executor.runs().len(), 2);
        assert!(queue.list_dead_letter_jobs().await.unwrap().is_empty());
    }
}
