//! Claiming ready jobs for a worker.

use chrono::Utc;
use metrics::counter;
use tracing::{debug, instrument};

use super::execution::ClaimedExecution;
use super::job::JobId;
use super::queue_selector::{QueueScope, QueueSelector};
use crate::db::{RowLock, SharedStore};
use crate::error::Result;
use crate::telemetry::metrics::JOBS_CLAIMED;

/// Hands ready jobs to exactly one worker process.
#[derive(Clone)]
pub struct ClaimCoordinator {
    store: SharedStore,
}

impl ClaimCoordinator {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Claim up to `limit` ready jobs from the queues `selector` names, for
    /// `process_id`. Rows other claimers hold are invisible, so concurrent
    /// calls never return the same job.
    #[instrument(skip(self, selector))]
    pub async fn claim(
        &self,
        selector: &QueueSelector,
        limit: usize,
        process_id: &str,
    ) -> Result<Vec<ClaimedExecution>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.store.begin().await?;
        let scope = selector.resolve(tx.as_mut()).await?;

        let ids = match scope {
            QueueScope::All { excluded } => {
                tx.select_ready(None, &excluded, limit, RowLock::SkipLocked)
                    .await?
            }
            QueueScope::Ordered(queues) => {
                let mut ids: Vec<JobId> = Vec::new();
                for queue in queues {
                    let remaining = limit - ids.len();
                    if remaining == 0 {
                        break;
                    }
                    let batch = tx
                        .select_ready(
                            Some(std::slice::from_ref(&queue)),
                            &[],
                            remaining,
                            RowLock::SkipLocked,
                        )
                        .await?;
                    ids.extend(batch);
                }
                ids
            }
        };

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let claimed: Vec<ClaimedExecution> = ids
            .iter()
            .map(|&job_id| ClaimedExecution {
                job_id,
                process_id: process_id.to_string(),
                created_at: now,
            })
            .collect();

        tx.insert_claimed(&claimed).await?;
        tx.delete_ready(&ids).await?;
        tx.commit().await?;

        counter!(JOBS_CLAIMED).increment(claimed.len() as u64);
        debug!(count = claimed.len(), process_id, "Claimed jobs");
        Ok(claimed)
    }

    /// Claim one specific ready job. `None` when it is not ready or another
    /// claimer holds it.
    pub async fn claim_one(
        &self,
        job_id: JobId,
        process_id: &str,
    ) -> Result<Option<ClaimedExecution>> {
        let mut tx = self.store.begin().await?;

        let locked = tx.lock_ready(&[job_id], RowLock::SkipLocked).await?;
        if locked.is_empty() {
            tx.commit().await?;
            return Ok(None);
        }

        let claimed = ClaimedExecution {
            job_id,
            process_id: process_id.to_string(),
            created_at: Utc::now(),
        };
        tx.insert_claimed(std::slice::from_ref(&claimed)).await?;
        tx.delete_ready(&[job_id]).await?;
        tx.commit().await?;

        counter!(JOBS_CLAIMED).increment(1);
        Ok(Some(claimed))
    }
}
