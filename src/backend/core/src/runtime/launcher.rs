//! Starts every configured role and stops them together.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::dispatcher::Dispatcher;
use super::recurring::RecurringScheduler;
use super::runner::{RunMode, RunnerHandle};
use super::worker::Worker;
use crate::config::Config;
use crate::db::SharedStore;
use crate::error::Result;
use crate::jobs::JobRegistry;

/// Runs the roles of one process.
///
/// Dispatchers only need the store. Workers and the recurring scheduler
/// perform or validate job classes, so they start only when a registry is
/// supplied.
pub struct Launcher {
    config: Config,
    store: SharedStore,
    registry: Option<Arc<JobRegistry>>,
}

impl Launcher {
    pub fn new(config: Config, store: SharedStore) -> Self {
        Self {
            config,
            store,
            registry: None,
        }
    }

    pub fn with_registry(mut self, registry: JobRegistry) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    /// Start every role in async mode under children of `shutdown`.
    pub async fn start(&self, shutdown: &CancellationToken) -> Result<Vec<RunnerHandle>> {
        let mut handles = Vec::new();

        for config in &self.config.dispatchers {
            let dispatcher = Dispatcher::new(self.store.clone(), config.clone());
            handles.push(
                dispatcher
                    .runner(shutdown.child_token())
                    .start(RunMode::Async)
                    .await?,
            );
        }

        if let Some(registry) = &self.registry {
            for config in &self.config.workers {
                let worker = Worker::new(self.store.clone(), Arc::clone(registry), config.clone());
                handles.push(
                    worker
                        .runner(shutdown.child_token())
                        .start(RunMode::Async)
                        .await?,
                );
            }

            if !self.config.scheduler.recurring_tasks.is_empty() {
                let scheduler = RecurringScheduler::from_config(
                    self.store.clone(),
                    Arc::clone(registry),
                    &self.config.scheduler,
                );
                handles.push(
                    scheduler
                        .runner(shutdown.child_token())
                        .start(RunMode::Async)
                        .await?,
                );
            }
        }

        info!(roles = handles.len(), "Launched roles");
        Ok(handles)
    }

    /// Start every role, wait for `shutdown`, then stop them all.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let handles = self.start(&shutdown).await?;
        shutdown.cancelled().await;
        info!("Shutdown requested, stopping roles");
        stop_all(handles).await
    }
}

/// Stop every handle, returning the first error after all have stopped.
pub async fn stop_all(handles: Vec<RunnerHandle>) -> Result<()> {
    let mut first_error = None;
    for handle in handles {
        if let Err(e) = handle.stop().await {
            e.log();
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}
