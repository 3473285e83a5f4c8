//! Promotion of due scheduled jobs.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tracing::{debug, instrument};

use super::execution::{BlockedExecution, Placement, ReadyExecution};
use super::job::{JobId, JobRecord};
use super::semaphore;
use crate::db::{RowLock, SharedStore, Transaction};
use crate::error::Result;
use crate::telemetry::metrics::{JOBS_BLOCKED, JOBS_DISPATCHED};

/// Place a job whose run time has arrived: ready when it gets a concurrency
/// slot, blocked otherwise.
pub(crate) async fn dispatch_job(
    tx: &mut dyn Transaction,
    job: &JobRecord,
    now: DateTime<Utc>,
) -> Result<Placement> {
    if semaphore::acquire(tx, job, now).await? {
        tx.insert_ready(&[ReadyExecution::for_job(job, now)]).await?;
        return Ok(Placement::Ready);
    }

    match BlockedExecution::for_job(job, now) {
        Some(blocked) => {
            tx.insert_blocked(&blocked).await?;
            counter!(JOBS_BLOCKED).increment(1);
            Ok(Placement::Blocked)
        }
        // acquire only fails for jobs with a key
        None => Ok(Placement::Scheduled),
    }
}

/// Which scheduled jobs left the scheduled ledger, and where they went.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub ready: Vec<JobId>,
    pub blocked: Vec<JobId>,
}

impl DispatchOutcome {
    pub fn count(&self) -> usize {
        self.ready.len() + self.blocked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn dispatched(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.ready.iter().chain(&self.blocked).copied().collect();
        ids.sort();
        ids
    }
}

/// Moves due scheduled jobs into the ready or blocked ledgers.
#[derive(Clone)]
pub struct DispatchCoordinator {
    store: SharedStore,
}

impl DispatchCoordinator {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Dispatch up to `batch_size` due jobs in one transaction. Rows another
    /// dispatcher holds are skipped.
    #[instrument(skip(self))]
    pub async fn dispatch_next_batch(&self, batch_size: usize) -> Result<DispatchOutcome> {
        let mut tx = self.store.begin().await?;
        let now = Utc::now();

        let due = tx
            .select_due_scheduled(now, batch_size, RowLock::SkipLocked)
            .await?;
        if due.is_empty() {
            tx.commit().await?;
            return Ok(DispatchOutcome::default());
        }

        let jobs = tx.find_jobs(&due).await?;
        let (limited, unlimited): (Vec<&JobRecord>, Vec<&JobRecord>) =
            jobs.iter().partition(|job| job.is_concurrency_limited());

        let ready_rows: Vec<ReadyExecution> = unlimited
            .iter()
            .map(|job| ReadyExecution::for_job(job, now))
            .collect();
        tx.insert_ready(&ready_rows).await?;

        for job in limited {
            dispatch_job(tx.as_mut(), job, now).await?;
        }

        let outcome = DispatchOutcome {
            ready: tx.ready_among(&due).await?,
            blocked: tx.blocked_among(&due).await?,
        };
        tx.delete_scheduled(&outcome.dispatched()).await?;
        tx.commit().await?;

        counter!(JOBS_DISPATCHED).increment(outcome.count() as u64);
        debug!(
            ready = outcome.ready.len(),
            blocked = outcome.blocked.len(),
            "Dispatched scheduled jobs"
        );
        Ok(outcome)
    }
}
