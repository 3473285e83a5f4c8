//! The worker role: claims ready jobs and performs them concurrently.

use async_trait::async_trait;
use futures::future::{join_all, FutureExt};
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::process::ProcessIdentity;
use super::runner::{Role, Runner};
use crate::config::WorkerConfig;
use crate::db::SharedStore;
use crate::error::Result;
use crate::jobs::{
    ClaimCoordinator, ClaimedExecution, JobContext, JobError, JobQueue, JobRegistry, JobResult,
    QueueSelector,
};

/// Counters for one worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Jobs claimed
    pub claimed: Arc<AtomicU64>,
    /// Jobs that finished
    pub succeeded: Arc<AtomicU64>,
    /// Jobs that failed, panics included
    pub failed: Arc<AtomicU64>,
    /// Jobs being performed right now
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claimed(&self) -> u64 {
        self.claimed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

struct Execution {
    queue: JobQueue,
    registry: Arc<JobRegistry>,
    stats: WorkerStats,
    process_id: String,
    cancellation: CancellationToken,
}

impl Execution {
    async fn run(&self, claimed: ClaimedExecution) {
        let job = match self.queue.find(claimed.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %claimed.job_id, "Claimed job has no job row");
                return;
            }
            Err(e) => {
                e.log();
                return;
            }
        };

        self.stats.active.fetch_add(1, Ordering::Relaxed);
        let class_name = job.class_name.clone();
        let context = JobContext::new(job, self.process_id.clone(), self.cancellation.child_token());
        let result = self.perform(&class_name, &context).await;
        self.stats.active.fetch_sub(1, Ordering::Relaxed);

        let completed = match &result {
            Ok(()) => {
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                self.queue.finish(&claimed).await
            }
            Err(error) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.queue.fail(&claimed, error).await
            }
        };
        if let Err(e) = completed {
            e.log();
        }
    }

    async fn perform(&self, class_name: &str, context: &JobContext) -> JobResult {
        let Some(behaviour) = self.registry.resolve(class_name) else {
            return Err(JobError::fatal(format!("unknown job class {}", class_name))
                .with_code("UNKNOWN_JOB_CLASS"));
        };

        match AssertUnwindSafe(behaviour.perform(context)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "job panicked".to_string());
                Err(JobError::fatal(message).with_code("PANIC"))
            }
        }
    }
}

pub struct Worker {
    config: WorkerConfig,
    identity: ProcessIdentity,
    selector: QueueSelector,
    claims: ClaimCoordinator,
    execution: Arc<Execution>,
    slots: Arc<Semaphore>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
    /// Set when a claim came back empty while nothing was in flight
    drained: AtomicBool,
}

impl Worker {
    pub fn new(store: SharedStore, registry: Arc<JobRegistry>, config: WorkerConfig) -> Self {
        let identity = ProcessIdentity::new("worker");
        let threads = config.threads.max(1);
        let execution = Execution {
            queue: JobQueue::new(store.clone()),
            registry,
            stats: WorkerStats::new(),
            process_id: identity.to_string(),
            cancellation: CancellationToken::new(),
        };

        Self {
            selector: QueueSelector::parse(&config.queues),
            claims: ClaimCoordinator::new(store),
            execution: Arc::new(execution),
            slots: Arc::new(Semaphore::new(threads)),
            in_flight: Mutex::new(Vec::new()),
            drained: AtomicBool::new(false),
            identity,
            config,
        }
    }

    pub fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    pub fn process_id(&self) -> &str {
        &self.execution.process_id
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.execution.stats
    }

    /// A runner that drains in-flight jobs on shutdown.
    pub fn runner(self, token: CancellationToken) -> Runner<Self> {
        let runner = Runner::new(self, token);
        let worker = runner.role();
        runner.on_shutdown(move || {
            let worker = Arc::clone(&worker);
            async move { worker.shutdown().await }
        })
    }

    fn in_flight_count(&self) -> usize {
        let mut in_flight = self.in_flight.lock();
        in_flight.retain(|handle| !handle.is_finished());
        in_flight.len()
    }

    /// Wait up to the shutdown timeout for in-flight jobs, abort the rest and
    /// hand their claims back to ready.
    pub async fn shutdown(&self) -> Result<()> {
        let mut handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.in_flight.lock());

        if !handles.is_empty() {
            let drained = tokio::time::timeout(
                self.config.shutdown_timeout,
                join_all(handles.iter_mut()),
            )
            .await;

            if drained.is_err() {
                warn!(
                    process_id = %self.identity,
                    "In-flight jobs outlived the shutdown timeout, aborting"
                );
                self.execution.cancellation.cancel();
                for handle in &handles {
                    handle.abort();
                }
                for handle in handles {
                    let _ = handle.await;
                }
            }
        }

        let released = self.execution.queue.release_claimed(self.process_id()).await?;
        info!(
            process_id = %self.identity,
            released = released.len(),
            "Worker drained"
        );
        Ok(())
    }
}

#[async_trait]
impl Role for Worker {
    fn kind(&self) -> &'static str {
        "worker"
    }

    async fn tick(&self) -> Result<bool> {
        let idle = self.in_flight_count() == 0;
        let free = self.slots.available_permits();
        if free == 0 {
            return Ok(false);
        }

        let claimed = self
            .claims
            .claim(&self.selector, free, self.process_id())
            .await?;
        self.drained.store(idle && claimed.is_empty(), Ordering::Release);
        if claimed.is_empty() {
            return Ok(false);
        }

        self.execution
            .stats
            .claimed
            .fetch_add(claimed.len() as u64, Ordering::Relaxed);
        debug!(count = claimed.len(), process_id = %self.identity, "Performing claimed jobs");

        let mut in_flight = self.in_flight.lock();
        for execution in claimed {
            let permit = match Arc::clone(&self.slots).try_acquire_owned() {
                Ok(permit) => permit,
                // claims never exceed the free permits
                Err(_) => break,
            };
            let runner = Arc::clone(&self.execution);
            in_flight.push(tokio::spawn(async move {
                runner.run(execution).await;
                drop(permit);
            }));
        }
        Ok(true)
    }

    fn polling_interval(&self) -> Duration {
        self.config.polling_interval
    }

    async fn all_work_completed(&self) -> Result<bool> {
        Ok(self.drained.load(Ordering::Acquire) && self.in_flight_count() == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_stats() {
        let stats = WorkerStats::new();
        assert_eq!(stats.claimed(), 0);
        assert_eq!(stats.succeeded(), 0);
        assert_eq!(stats.failed(), 0);
        assert_eq!(stats.active(), 0);

        stats.claimed.fetch_add(2, Ordering::Relaxed);
        assert_eq!(stats.claimed(), 2);
    }
}
