//! Worker role end to end: claim, perform, finish or fail, drain on shutdown.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use keel_core::config::{Config, DatabaseConfig, DispatcherConfig, SchedulerConfig, WorkerConfig};
use keel_core::db::{MemoryStore, SharedStore};
use keel_core::jobs::{
    ConcurrencyLimit, Job, JobContext, JobError, JobId, JobQueue, JobRegistry, JobResult, NewJob,
    Placement,
};
use keel_core::runtime::{Launcher, RunMode, Worker};
use keel_core::telemetry::LoggingConfig;

// ============================================================================
// Test Utilities
// ============================================================================

struct CountingJob {
    performed: Arc<AtomicU64>,
}

#[async_trait]
impl Job for CountingJob {
    fn name(&self) -> &'static str {
        "CountingJob"
    }

    async fn perform(&self, _ctx: &JobContext) -> JobResult {
        self.performed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FailingJob;

#[async_trait]
impl Job for FailingJob {
    fn name(&self) -> &'static str {
        "FailingJob"
    }

    async fn perform(&self, ctx: &JobContext) -> JobResult {
        Err(JobError::fatal(format!("cannot handle {}", ctx.arguments())))
    }
}

struct PanickingJob;

#[async_trait]
impl Job for PanickingJob {
    fn name(&self) -> &'static str {
        "PanickingJob"
    }

    async fn perform(&self, _ctx: &JobContext) -> JobResult {
        panic!("corrupt payload");
    }
}

struct SlowJob;

#[async_trait]
impl Job for SlowJob {
    fn name(&self) -> &'static str {
        "SlowJob"
    }

    async fn perform(&self, _ctx: &JobContext) -> JobResult {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

fn registry(performed: &Arc<AtomicU64>) -> JobRegistry {
    JobRegistry::new()
        .with(CountingJob {
            performed: Arc::clone(performed),
        })
        .with(FailingJob)
        .with(PanickingJob)
        .with(SlowJob)
}

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        threads: 2,
        polling_interval: Duration::from_millis(10),
        shutdown_timeout: Duration::from_millis(50),
        ..Default::default()
    }
}

async fn enqueue(queue: &JobQueue, job: NewJob) -> JobId {
    queue.enqueue(job).await.unwrap().id
}

async fn wait_for(queue: &JobQueue, id: JobId, placement: Placement) {
    for _ in 0..200 {
        if queue.placement_of(id).await.unwrap() == Some(placement) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached {}", id, placement);
}

// ============================================================================
// Inline Worker
// ============================================================================

#[tokio::test]
async fn test_inline_worker_performs_everything_then_returns() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let queue = JobQueue::new(store.clone());
    let performed = Arc::new(AtomicU64::new(0));

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(enqueue(&queue, NewJob::new("CountingJob")).await);
    }

    let worker = Worker::new(store, Arc::new(registry(&performed)), worker_config());
    let runner = worker.runner(CancellationToken::new());
    let role = runner.role();
    runner.start(RunMode::Inline).await.unwrap();

    assert_eq!(performed.load(Ordering::SeqCst), 5);
    assert_eq!(role.stats().succeeded(), 5);
    assert_eq!(role.stats().claimed(), 5);
    for id in ids {
        assert_eq!(queue.placement_of(id).await.unwrap(), Some(Placement::Finished));
    }
}

#[tokio::test]
async fn test_errors_panics_and_unknown_classes_fail_the_job() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let queue = JobQueue::new(store.clone());
    let performed = Arc::new(AtomicU64::new(0));

    let failing = enqueue(&queue, NewJob::new("FailingJob")).await;
    let panicking = enqueue(&queue, NewJob::new("PanickingJob")).await;
    let unknown = enqueue(&queue, NewJob::new("NoSuchJob")).await;

    let worker = Worker::new(store, Arc::new(registry(&performed)), worker_config());
    let runner = worker.runner(CancellationToken::new());
    let role = runner.role();
    runner.start(RunMode::Inline).await.unwrap();

    assert_eq!(role.stats().failed(), 3);
    for id in [failing, panicking, unknown] {
        assert_eq!(queue.placement_of(id).await.unwrap(), Some(Placement::Failed));
    }
}

#[tokio::test]
async fn test_worker_walks_a_concurrency_key_one_job_at_a_time() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let queue = JobQueue::new(store.clone());
    let performed = Arc::new(AtomicU64::new(0));

    let limit = ConcurrencyLimit::new("account-1");
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(enqueue(&queue, NewJob::new("CountingJob").limited_by(limit.clone())).await);
    }

    let worker = Worker::new(store, Arc::new(registry(&performed)), worker_config());
    worker
        .runner(CancellationToken::new())
        .start(RunMode::Inline)
        .await
        .unwrap();

    assert_eq!(performed.load(Ordering::SeqCst), 3);
    for id in ids {
        assert_eq!(queue.placement_of(id).await.unwrap(), Some(Placement::Finished));
    }
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_returns_unfinished_jobs_to_ready() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let queue = JobQueue::new(store.clone());
    let performed = Arc::new(AtomicU64::new(0));
    let slow = enqueue(&queue, NewJob::new("SlowJob")).await;

    let worker = Worker::new(store, Arc::new(registry(&performed)), worker_config());
    let handle = worker
        .runner(CancellationToken::new())
        .start(RunMode::Async)
        .await
        .unwrap();

    wait_for(&queue, slow, Placement::Claimed).await;
    handle.stop().await.unwrap();

    assert_eq!(queue.placement_of(slow).await.unwrap(), Some(Placement::Ready));
}

#[tokio::test]
async fn test_launcher_runs_roles_until_shutdown() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let queue = JobQueue::new(store.clone());
    let performed = Arc::new(AtomicU64::new(0));

    let config = Config {
        database: DatabaseConfig {
            url: "postgres://unused".to_string(),
            max_connections: 1,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(1),
        },
        logging: LoggingConfig::default(),
        dispatchers: vec![DispatcherConfig {
            polling_interval: Duration::from_millis(10),
            initial_jitter: false,
            ..Default::default()
        }],
        workers: vec![worker_config()],
        scheduler: SchedulerConfig::default(),
    };

    let shutdown = CancellationToken::new();
    let launcher = Launcher::new(config, store).with_registry(registry(&performed));
    let running = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { launcher.run(shutdown).await })
    };

    let later = chrono::Utc::now() + chrono::TimeDelta::milliseconds(50);
    let scheduled = enqueue(&queue, NewJob::new("CountingJob").scheduled_at(later)).await;
    wait_for(&queue, scheduled, Placement::Finished).await;

    shutdown.cancel();
    running.await.unwrap().unwrap();
    assert_eq!(performed.load(Ordering::SeqCst), 1);
}
