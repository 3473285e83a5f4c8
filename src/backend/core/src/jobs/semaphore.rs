//! Concurrency semaphores.
//!
//! A semaphore row per concurrency key counts the slots currently held. A job
//! with a key may become ready only after taking a slot; otherwise it waits in
//! the blocked ledger. Slots are given back when the job finishes or fails, and
//! maintenance deletes semaphores whose expiry has passed so slots held by
//! crashed workers come back.

use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::{debug, info, instrument};

use super::execution::ReadyExecution;
use super::job::{JobId, JobRecord};
use crate::db::{RowLock, SharedStore, Transaction};
use crate::error::Result;
use crate::telemetry::metrics::{JOBS_UNBLOCKED, SEMAPHORES_EXPIRED};

/// Take a slot for `job` inside `tx`. Jobs without a concurrency key always
/// succeed.
pub async fn acquire(tx: &mut dyn Transaction, job: &JobRecord, now: DateTime<Utc>) -> Result<bool> {
    let Some(key) = job.concurrency_key.as_deref() else {
        return Ok(true);
    };
    let expires_at = job.concurrency_expires_at(now);

    if tx.insert_semaphore(key, expires_at).await? {
        return Ok(true);
    }
    tx.increment_semaphore(key, job.concurrency_limit, expires_at).await
}

/// Give back the slot `job` holds. False when there was nothing to give back,
/// for instance after maintenance expired the semaphore.
pub async fn release(tx: &mut dyn Transaction, job: &JobRecord, now: DateTime<Utc>) -> Result<bool> {
    let Some(key) = job.concurrency_key.as_deref() else {
        return Ok(false);
    };

    let released = tx.decrement_semaphore(key, job.concurrency_expires_at(now)).await?;
    tx.delete_empty_semaphore(key).await?;
    Ok(released)
}

/// Runs semaphore expiry and blocked-job release against a store.
#[derive(Clone)]
pub struct SemaphoreManager {
    store: SharedStore,
}

impl SemaphoreManager {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Delete expired semaphores in batches of `batch_size`, one transaction
    /// per batch. Returns how many were deleted.
    #[instrument(skip(self))]
    pub async fn expire_semaphores(&self, batch_size: usize) -> Result<u64> {
        let batch_size = batch_size.max(1);
        let mut expired = 0;

        loop {
            let mut tx = self.store.begin().await?;
            let keys = tx
                .select_expired_semaphores(Utc::now(), batch_size, RowLock::SkipLocked)
                .await?;
            if keys.is_empty() {
                tx.commit().await?;
                break;
            }

            let deleted = tx.delete_semaphores(&keys).await?;
            tx.commit().await?;
            expired += deleted;
            debug!(count = deleted, "Expired semaphores");

            if keys.len() < batch_size {
                break;
            }
        }

        if expired > 0 {
            counter!(SEMAPHORES_EXPIRED).increment(expired);
            info!(count = expired, "Reclaimed expired semaphores");
        }
        Ok(expired)
    }

    /// Move blocked jobs to ready while their keys have free slots. Looks at up
    /// to `batch_size` keys and releases at most `batch_size` jobs.
    #[instrument(skip(self))]
    pub async fn unblock(&self, batch_size: usize) -> Result<Vec<JobId>> {
        let keys = {
            let mut tx = self.store.begin().await?;
            let keys = tx.blocked_concurrency_keys(batch_size).await?;
            tx.commit().await?;
            keys
        };

        let mut released = Vec::new();
        for key in keys {
            while released.len() < batch_size {
                match self.release_next_blocked(&key).await? {
                    Some(job_id) => released.push(job_id),
                    None => break,
                }
            }
        }

        if !released.is_empty() {
            counter!(JOBS_UNBLOCKED).increment(released.len() as u64);
            info!(count = released.len(), "Released blocked jobs");
        }
        Ok(released)
    }

    /// Release the first blocked job for `key` if a slot is free. Another
    /// transaction already moving that row is not waited for.
    pub async fn release_next_blocked(&self, key: &str) -> Result<Option<JobId>> {
        let mut tx = self.store.begin().await?;
        let released = release_next_blocked_in(tx.as_mut(), key).await;
        match released {
            Ok(Some(job_id)) => {
                tx.commit().await?;
                Ok(Some(job_id))
            }
            Ok(None) => {
                tx.rollback().await?;
                Ok(None)
            }
            Err(e) if e.is_lock_contention() => {
                debug!(concurrency_key = key, "Blocked execution is being released elsewhere");
                let _ = tx.rollback().await;
                Ok(None)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }
}

/// Blocked-to-ready move for one job of `key`, inside `tx`.
async fn release_next_blocked_in(
    tx: &mut dyn Transaction,
    key: &str,
) -> Result<Option<JobId>> {
    let ids = tx.select_blocked(key, 1, RowLock::NoWait).await?;
    let Some(job_id) = ids.first().copied() else {
        return Ok(None);
    };
    let Some(job) = tx.find_jobs(&[job_id]).await?.into_iter().next() else {
        return Ok(None);
    };

    let now = Utc::now();
    if !acquire(tx, &job, now).await? {
        return Ok(None);
    }

    tx.insert_ready(&[ReadyExecution::for_job(&job, now)]).await?;
    tx.delete_blocked(&[job_id]).await?;
    debug!(job_id = %job_id, concurrency_key = key, "Unblocked job");
    Ok(Some(job_id))
}
