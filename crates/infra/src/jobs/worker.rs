//! Worker pool: N workers leasing jobs from a [`JobQueue`] plus a lease reaper.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;

use super::handlers::{JobHandler, JobOutcome, JobReport};
use super::queue::{JobQueue, QueueError};
use super::reaper::LeaseReaper;
use super::types::LeasedJob;

/// Pause after a queue error before leasing again.
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Prefix for worker names in logs.
    pub name: String,
    /// Number of independent workers; each runs one job at a time.
    pub concurrency: usize,
    /// Upper bound on a single blocking lease call.
    pub dequeue_wait: Duration,
    pub reaper_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            concurrency: 4,
            dequeue_wait: Duration::from_secs(5),
            reaper_interval: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_dequeue_wait(mut self, wait: Duration) -> Self {
        self.dequeue_wait = wait;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }
}

impl From<&OrchestratorConfig> for WorkerPoolConfig {
    fn from(cfg: &OrchestratorConfig) -> Self {
        Self {
            name: cfg.worker_name.clone(),
            concurrency: cfg.worker_concurrency.max(1),
            dequeue_wait: cfg.dequeue_wait,
            reaper_interval: cfg.reaper_interval,
        }
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_noop: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    noop: AtomicU64,
    running: AtomicUsize,
}

impl Counters {
    fn record(&self, outcome: &JobOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let bucket = match outcome {
            JobOutcome::Succeeded(_) => &self.succeeded,
            JobOutcome::Noop(_) => &self.noop,
            JobOutcome::Failed(_) | JobOutcome::Panicked(_) => &self.failed,
        };
        bucket.fetch_add(1, Ordering::Relaxed);
    }
}

/// A configured, not yet running pool.
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    /// Start the workers and the reaper on the current tokio runtime.
    pub fn spawn(self) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());
        let mut tasks = JoinSet::new();

        for i in 0..self.config.concurrency {
            let worker = Worker {
                name: format!("{}-{i}", self.config.name),
                queue: self.queue.clone(),
                handler: self.handler.clone(),
                dequeue_wait: self.config.dequeue_wait,
                counters: counters.clone(),
            };
            tasks.spawn(worker.run(shutdown_rx.clone()));
        }

        let reaper = LeaseReaper::with_interval(self.queue.clone(), self.config.reaper_interval);
        tasks.spawn(reaper.run(shutdown_rx));

        info!(
            pool = %self.config.name,
            concurrency = self.config.concurrency,
            "worker pool started"
        );

        WorkerPoolHandle {
            name: self.config.name,
            shutdown: shutdown_tx,
            tasks,
            counters,
            started: Instant::now(),
        }
    }
}

/// Handle to a running pool.
pub struct WorkerPoolHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
    counters: Arc<Counters>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Stop leasing, let in-flight jobs finish, then return.
    pub async fn shutdown(mut self) {
        info!(pool = %self.name, "worker pool shutting down");
        let _ = self.shutdown.send(true);

        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(pool = %self.name, error = %e, "worker task ended abnormally");
            }
        }

        info!(pool = %self.name, stats = ?self.stats(), "worker pool stopped");
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            jobs_processed: self.counters.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            jobs_failed: self.counters.failed.load(Ordering::Relaxed),
            jobs_noop: self.counters.noop.load(Ordering::Relaxed),
            current_running: self.counters.running.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

struct Worker {
    name: String,
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    dequeue_wait: Duration,
    counters: Arc<Counters>,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = %self.name, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            // A lease taken by a cancelled call is not lost: it expires and
            // the job is redelivered.
            let leased = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                leased = self.queue.lease_next(self.dequeue_wait) => leased,
            };

            let job = match leased {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    error!(worker = %self.name, error = %e, "failed to lease job");
                    tokio::time::sleep(QUEUE_ERROR_BACKOFF).await;
                    continue;
                }
            };

            self.counters.running.fetch_add(1, Ordering::Relaxed);
            let report = self.execute(job.clone()).await;
            self.counters.running.fetch_sub(1, Ordering::Relaxed);
            self.counters.record(&report.outcome);

            self.ack(&job, &report).await;
        }

        debug!(worker = %self.name, "worker stopped");
    }

    /// Run the handler on its own task so a panic fails only this job.
    async fn execute(&self, job: LeasedJob) -> JobReport {
        debug!(worker = %self.name, job_id = %job.id(), kind = %job.payload().kind, attempt = job.attempt(), "job leased");

        let handler = self.handler.clone();
        let leased = job.clone();
        match tokio::spawn(async move { handler.handle(&leased).await }).await {
            Ok(report) => report,
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    "handler task cancelled".to_string()
                };
                error!(worker = %self.name, job_id = %job.id(), panic = %message, "job handler panicked");
                JobReport::new(&job, JobOutcome::Panicked(message))
            }
        }
    }

    async fn ack(&self, job: &LeasedJob, report: &JobReport) {
        let acked = match report.failure_message() {
            None => self.queue.complete(job).await,
            Some(message) => self.queue.fail(job, &message).await,
        };

        match acked {
            Ok(()) => debug!(worker = %self.name, job_id = %job.id(), success = report.is_success(), "job acked"),
            Err(QueueError::LeaseLost(id)) => {
                warn!(worker = %self.name, job_id = %id, "lease lost before ack; job will be redelivered");
            }
            Err(e) => error!(worker = %self.name, job_id = %job.id(), error = %e, "failed to ack job"),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::queue::{InMemoryJobQueue, LeasePolicy};
    use crate::jobs::types::{JobPayload, JobStatus, Lane};
    use async_trait::async_trait;
    use tenantforge_core::TenantId;
    use tokio::sync::Semaphore;

    /// Succeeds, except for tenants listed in `panic_for`.
    struct ScriptedHandler {
        panic_for: Vec<TenantId>,
        gate: Option<Arc<Semaphore>>,
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, job: &LeasedJob) -> JobReport {
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await.unwrap();
            }
            if self.panic_for.contains(&job.payload().tenant_id) {
                panic!("boom");
            }
            JobReport::new(job, JobOutcome::Succeeded("ok".into()))
        }
    }

    fn config() -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_name("test")
            .with_concurrency(2)
            .with_dequeue_wait(Duration::from_millis(50))
    }

    async fn wait_for_processed(handle: &WorkerPoolHandle, n: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.stats().jobs_processed < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("jobs should be processed");
    }

    #[tokio::test]
    async fn panicking_handler_fails_only_its_job() {
        let queue = InMemoryJobQueue::arc(LeasePolicy::default());
        let bad = TenantId::new();
        let handler = Arc::new(ScriptedHandler {
            panic_for: vec![bad],
            gate: None,
        });

        let bad_job = queue.enqueue(JobPayload::provision(bad), Lane::Default).await.unwrap();
        let good_job = queue
            .enqueue(JobPayload::provision(TenantId::new()), Lane::Default)
            .await
            .unwrap();

        let handle = WorkerPool::new(queue.clone(), handler, config()).spawn();
        wait_for_processed(&handle, 2).await;
        let stats = handle.stats();
        handle.shutdown().await;

        assert_eq!(stats.jobs_failed, 1);
        assert_eq!(stats.jobs_succeeded, 1);

        let failed = queue.get(bad_job).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.last_error.unwrap().contains("boom"));
        assert_eq!(
            queue.get(good_job).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn shutdown_finishes_the_in_flight_job() {
        let queue = InMemoryJobQueue::arc(LeasePolicy::default());
        let gate = Arc::new(Semaphore::new(0));
        let handler = Arc::new(ScriptedHandler {
            panic_for: vec![],
            gate: Some(gate.clone()),
        });

        let id = queue
            .enqueue(JobPayload::provision(TenantId::new()), Lane::Default)
            .await
            .unwrap();
        let handle = WorkerPool::new(queue.clone(), handler, config().with_concurrency(1)).spawn();

        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.stats().current_running == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let shutdown = tokio::spawn(handle.shutdown());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!shutdown.is_finished());

        gate.add_permits(1);
        tokio::time::timeout(Duration::from_secs(5), shutdown)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(queue.get(id).await.unwrap().unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn queued_jobs_survive_shutdown() {
        let queue = InMemoryJobQueue::arc(LeasePolicy::default());
        let handler = Arc::new(ScriptedHandler {
            panic_for: vec![],
            gate: None,
        });

        let handle = WorkerPool::new(queue.clone(), handler, config()).spawn();
        handle.shutdown().await;

        queue
            .enqueue(JobPayload::provision(TenantId::new()), Lane::Default)
            .await
            .unwrap();
        assert_eq!(queue.stats().await.unwrap().queued, 1);
    }

    #[test]
    fn config_from_orchestrator_settings() {
        let cfg = OrchestratorConfig::default()
            .with_worker_name("w1")
            .with_worker_concurrency(8);
        let pool = WorkerPoolConfig::from(&cfg);
        assert_eq!(pool.name, "w1");
        assert_eq!(pool.concurrency, 8);
        assert_eq!(pool.reaper_interval, cfg.reaper_interval);
    }
}
