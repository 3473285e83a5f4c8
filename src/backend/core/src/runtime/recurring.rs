//! The recurring-task scheduler role.
//!
//! Its polling loop does nothing. On boot it persists the static tasks and
//! arms one timer per task; each timer sleeps until the next fire time,
//! enqueues that occurrence and re-arms.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::runner::{Role, Runner};
use crate::config::SchedulerConfig;
use crate::db::SharedStore;
use crate::error::Result;
use crate::jobs::recurring::delay_until;
use crate::jobs::{EnqueueOutcome, JobRegistry, RecurringTask};

pub struct RecurringScheduler {
    store: SharedStore,
    registry: Arc<JobRegistry>,
    tasks: Vec<RecurringTask>,
    polling_interval: Duration,
    timers: Mutex<Vec<JoinHandle<()>>>,
    timer_token: Mutex<Option<CancellationToken>>,
}

impl RecurringScheduler {
    pub fn new(store: SharedStore, registry: Arc<JobRegistry>, tasks: Vec<RecurringTask>) -> Self {
        Self {
            store,
            registry,
            tasks,
            polling_interval: Duration::from_secs(1),
            timers: Mutex::new(Vec::new()),
            timer_token: Mutex::new(None),
        }
    }

    pub fn from_config(store: SharedStore, registry: Arc<JobRegistry>, config: &SchedulerConfig) -> Self {
        let tasks = config
            .recurring_tasks
            .iter()
            .map(|(key, task)| RecurringTask::from_config(key.as_str(), task))
            .collect();
        Self::new(store, registry, tasks).with_polling_interval(config.polling_interval)
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn tasks(&self) -> &[RecurringTask] {
        &self.tasks
    }

    /// A runner that loads and arms the tasks on boot and disarms them on
    /// shutdown. Invalid tasks abort the boot.
    pub fn runner(self, token: CancellationToken) -> Runner<Self> {
        let runner = Runner::new(self, token.clone());
        let on_start = runner.role();
        let on_shutdown = runner.role();

        runner
            .on_start(move || {
                let scheduler = Arc::clone(&on_start);
                let parent = token.clone();
                async move { scheduler.load_and_schedule(&parent).await }
            })
            .on_shutdown(move || {
                let scheduler = Arc::clone(&on_shutdown);
                async move {
                    scheduler.unschedule().await;
                    Ok(())
                }
            })
    }

    /// Validate and upsert the tasks, then arm their timers.
    pub async fn load_and_schedule(&self, parent: &CancellationToken) -> Result<()> {
        RecurringTask::create_or_update_all(&self.store, &self.tasks, &self.registry).await?;

        let token = parent.child_token();
        let timers: Vec<JoinHandle<()>> = self
            .tasks
            .iter()
            .map(|task| spawn_timer(self.store.clone(), task.clone(), token.clone()))
            .collect();

        info!(count = timers.len(), "Scheduled recurring tasks");
        *self.timers.lock() = timers;
        *self.timer_token.lock() = Some(token);
        Ok(())
    }

    /// Cancel every timer and wait for them to exit.
    pub async fn unschedule(&self) {
        if let Some(token) = self.timer_token.lock().take() {
            token.cancel();
        }
        let timers = std::mem::take(&mut *self.timers.lock());
        for timer in timers {
            let _ = timer.await;
        }
        debug!("Unscheduled recurring tasks");
    }
}

fn spawn_timer(store: SharedStore, task: RecurringTask, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let next = match task.next_time_after(now) {
                Ok(next) => next,
                Err(e) => {
                    e.log();
                    return;
                }
            };

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay_until(next, now)) => {}
            }

            let outcome: EnqueueOutcome = task.enqueue(&store, next).await;
            debug!(task = %task.key, skipped = outcome.skipped, "Recurring timer fired");
        }
    })
}

#[async_trait]
impl Role for RecurringScheduler {
    fn kind(&self) -> &'static str {
        "scheduler"
    }

    async fn tick(&self) -> Result<bool> {
        Ok(false)
    }

    fn polling_interval(&self) -> Duration {
        self.polling_interval
    }
}
