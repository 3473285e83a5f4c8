//! The dispatcher role: promotes due scheduled jobs and owns concurrency
//! maintenance.

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::maintenance::ConcurrencyMaintenance;
use super::runner::{Role, Runner};
use crate::config::DispatcherConfig;
use crate::db::SharedStore;
use crate::error::Result;
use crate::jobs::{DispatchCoordinator, SemaphoreManager};

pub struct Dispatcher {
    config: DispatcherConfig,
    coordinator: DispatchCoordinator,
    maintenance: Arc<ConcurrencyMaintenance>,
}

impl Dispatcher {
    pub fn new(store: SharedStore, config: DispatcherConfig) -> Self {
        let maintenance = ConcurrencyMaintenance::new(
            SemaphoreManager::new(store.clone()),
            config.concurrency_maintenance_interval,
            config.batch_size,
        );
        Self {
            coordinator: DispatchCoordinator::new(store),
            maintenance: Arc::new(maintenance),
            config,
        }
    }

    /// Replace the maintenance task, e.g. to install an error handler.
    pub fn with_maintenance(mut self, maintenance: ConcurrencyMaintenance) -> Self {
        self.maintenance = Arc::new(maintenance);
        self
    }

    pub fn maintenance(&self) -> Arc<ConcurrencyMaintenance> {
        Arc::clone(&self.maintenance)
    }

    /// A runner that starts maintenance on boot and stops it on shutdown.
    pub fn runner(self, token: CancellationToken) -> Runner<Self> {
        let maintenance = self.maintenance();
        let parent = token.clone();
        let on_start = Arc::clone(&maintenance);

        Runner::new(self, token)
            .on_start(move || {
                on_start.start(&parent);
                async { Ok(()) }
            })
            .on_shutdown(move || {
                let maintenance = Arc::clone(&maintenance);
                async move {
                    maintenance.stop().await;
                    Ok(())
                }
            })
    }
}

#[async_trait]
impl Role for Dispatcher {
    fn kind(&self) -> &'static str {
        "dispatcher"
    }

    async fn tick(&self) -> Result<bool> {
        let outcome = self
            .coordinator
            .dispatch_next_batch(self.config.batch_size)
            .await?;
        Ok(!outcome.is_empty())
    }

    fn polling_interval(&self) -> Duration {
        self.config.polling_interval
    }

    fn initial_jitter(&self) -> Duration {
        let millis = self.config.polling_interval.as_millis() as u64;
        if !self.config.initial_jitter || millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..millis))
    }
}
