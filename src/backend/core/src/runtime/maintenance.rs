//! Periodic concurrency maintenance.
//!
//! Deletes expired semaphores, then moves blocked jobs whose keys have free
//! slots back to ready. Errors are reported and the timer keeps running.

use metrics::counter;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{KeelError, Result};
use crate::jobs::SemaphoreManager;
use crate::telemetry::metrics::MAINTENANCE_ERRORS;

/// Receives errors raised by a maintenance run.
pub type ErrorHandler = Arc<dyn Fn(&KeelError) + Send + Sync>;

pub struct ConcurrencyMaintenance {
    semaphores: SemaphoreManager,
    interval: Duration,
    batch_size: usize,
    on_error: ErrorHandler,
    errors: Arc<AtomicU64>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ConcurrencyMaintenance {
    pub fn new(semaphores: SemaphoreManager, interval: Duration, batch_size: usize) -> Self {
        Self {
            semaphores,
            interval,
            batch_size,
            on_error: Arc::new(|e: &KeelError| e.log()),
            errors: Arc::new(AtomicU64::new(0)),
            running: Mutex::new(None),
        }
    }

    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&KeelError) + Send + Sync + 'static,
    {
        self.on_error = Arc::new(handler);
        self
    }

    /// Runs that raised an error since construction.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// One expiry pass followed by one unblock pass.
    pub async fn run_once(&self) -> Result<()> {
        run(&self.semaphores, self.batch_size).await
    }

    /// Start the timer. The first run happens immediately. Calling `start`
    /// while running does nothing.
    pub fn start(&self, parent: &CancellationToken) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let token = parent.child_token();
        let semaphores = self.semaphores.clone();
        let batch_size = self.batch_size;
        let period = self.interval;
        let on_error = Arc::clone(&self.on_error);
        let errors = Arc::clone(&self.errors);
        let stop = token.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if let Err(e) = run(&semaphores, batch_size).await {
                    errors.fetch_add(1, Ordering::Relaxed);
                    counter!(MAINTENANCE_ERRORS).increment(1);
                    on_error(&e);
                }
            }
            debug!("Concurrency maintenance stopped");
        });

        *running = Some((token, task));
    }

    /// Stop the timer and wait for a run in progress to finish.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some((token, task)) = running {
            token.cancel();
            let _ = task.await;
        }
    }
}

async fn run(semaphores: &SemaphoreManager, batch_size: usize) -> Result<()> {
    semaphores.expire_semaphores(batch_size).await?;
    semaphores.unblock(batch_size).await?;
    Ok(())
}
