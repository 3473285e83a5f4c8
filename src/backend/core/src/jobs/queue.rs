//! Job submission and terminal transitions.

use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::{debug, info, instrument, warn};

use super::dispatch::dispatch_job;
use super::execution::{ClaimedExecution, FailedExecution, Placement, ReadyExecution, ScheduledExecution};
use super::job::{JobError, JobId, JobRecord, NewJob};
use super::semaphore::{self, SemaphoreManager};
use crate::db::{SharedStore, Transaction};
use crate::error::{KeelError, Result};
use crate::telemetry::metrics::{JOBS_ENQUEUED, JOBS_FAILED, JOBS_FINISHED, JOBS_RELEASED};

/// Insert `job` and place it, inside `tx`.
pub(crate) async fn enqueue_in(
    tx: &mut dyn Transaction,
    job: &NewJob,
    now: DateTime<Utc>,
) -> Result<(JobRecord, Placement)> {
    let record = tx.insert_job(job, now).await?;

    let placement = match record.scheduled_at {
        Some(at) if at > now => {
            tx.insert_scheduled(&ScheduledExecution::for_job(&record, at, now))
                .await?;
            Placement::Scheduled
        }
        _ => dispatch_job(tx, &record, now).await?,
    };

    Ok((record, placement))
}

enum Outcome {
    Finished,
    Failed(String),
}

/// Client-facing operations on the job ledgers.
#[derive(Clone)]
pub struct JobQueue {
    store: SharedStore,
    semaphores: SemaphoreManager,
}

impl JobQueue {
    pub fn new(store: SharedStore) -> Self {
        Self {
            semaphores: SemaphoreManager::new(store.clone()),
            store,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Submission
    // ═══════════════════════════════════════════════════════════════════════════

    /// Persist a job: scheduled when its run time is in the future, otherwise
    /// ready or blocked depending on its concurrency key.
    #[instrument(skip(self, job), fields(class = %job.class_name, queue = %job.queue_name))]
    pub async fn enqueue(&self, job: NewJob) -> Result<JobRecord> {
        let mut tx = self.store.begin().await?;
        let (record, placement) = enqueue_in(tx.as_mut(), &job, Utc::now()).await?;
        tx.commit().await?;

        counter!(JOBS_ENQUEUED, "placement" => placement.to_string()).increment(1);
        debug!(job_id = %record.id, %placement, "Enqueued job");
        Ok(record)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Pauses
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn pause(&self, queue: &str) -> Result<()> {
        let mut tx = self.store.begin().await?;
        tx.insert_pause(queue, Utc::now()).await?;
        tx.commit().await?;
        info!(queue, "Paused queue");
        Ok(())
    }

    pub async fn resume(&self, queue: &str) -> Result<()> {
        let mut tx = self.store.begin().await?;
        tx.delete_pause(queue).await?;
        tx.commit().await?;
        info!(queue, "Resumed queue");
        Ok(())
    }

    pub async fn paused_queues(&self) -> Result<Vec<String>> {
        let mut tx = self.store.begin().await?;
        let paused = tx.paused_queues().await?;
        tx.commit().await?;
        Ok(paused)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Inspection
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn find(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        let mut tx = self.store.begin().await?;
        let job = tx.find_jobs(&[job_id]).await?.into_iter().next();
        tx.commit().await?;
        Ok(job)
    }

    /// Every ledger currently holding `job_id`. A healthy job has exactly one.
    pub async fn placements_of(&self, job_id: JobId) -> Result<Vec<Placement>> {
        let ids = [job_id];
        let mut tx = self.store.begin().await?;
        let mut placements = Vec::new();

        if !tx.ready_among(&ids).await?.is_empty() {
            placements.push(Placement::Ready);
        }
        if !tx.scheduled_among(&ids).await?.is_empty() {
            placements.push(Placement::Scheduled);
        }
        if !tx.claimed_among(&ids).await?.is_empty() {
            placements.push(Placement::Claimed);
        }
        if !tx.blocked_among(&ids).await?.is_empty() {
            placements.push(Placement::Blocked);
        }
        if !tx.failed_among(&ids).await?.is_empty() {
            placements.push(Placement::Failed);
        }
        if placements.is_empty() {
            let finished = tx
                .find_jobs(&ids)
                .await?
                .first()
                .map_or(false, |job| job.finished_at.is_some());
            if finished {
                placements.push(Placement::Finished);
            }
        }
        tx.commit().await?;
        Ok(placements)
    }

    pub async fn placement_of(&self, job_id: JobId) -> Result<Option<Placement>> {
        Ok(self.placements_of(job_id).await?.into_iter().next())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Terminal Transitions
    // ═══════════════════════════════════════════════════════════════════════════

    /// Complete a claimed job and hand its concurrency slot to the next
    /// blocked job for the same key.
    pub async fn finish(&self, claimed: &ClaimedExecution) -> Result<()> {
        let job = self.complete(claimed, Outcome::Finished).await?;

        counter!(JOBS_FINISHED).increment(1);
        debug!(job_id = %job.id, "Finished job");
        self.unblock_next(&job).await;
        Ok(())
    }

    /// Record a claimed job's failure. Failed jobs are not retried.
    pub async fn fail(&self, claimed: &ClaimedExecution, error: &JobError) -> Result<()> {
        let message = serde_json::to_string(error)?;
        let job = self.complete(claimed, Outcome::Failed(message)).await?;

        counter!(JOBS_FAILED).increment(1);
        warn!(job_id = %job.id, class = %job.class_name, error = %error, "Job failed");
        self.unblock_next(&job).await;
        Ok(())
    }

    /// Delete the claimed row, record the outcome and give back the slot, in
    /// one transaction.
    async fn complete(&self, claimed: &ClaimedExecution, outcome: Outcome) -> Result<JobRecord> {
        let ids = [claimed.job_id];
        let mut tx = self.store.begin().await?;

        if tx.delete_claimed(&ids).await? == 0 {
            return Err(KeelError::not_found("claimed_execution", claimed.job_id.to_string()));
        }
        let job = tx
            .find_jobs(&ids)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| KeelError::not_found("job", claimed.job_id.to_string()))?;

        let now = Utc::now();
        match outcome {
            Outcome::Finished => tx.mark_job_finished(job.id, now).await?,
            Outcome::Failed(error) => {
                tx.insert_failed(&FailedExecution {
                    job_id: job.id,
                    error,
                    created_at: now,
                })
                .await?
            }
        }
        semaphore::release(tx.as_mut(), &job, now).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn unblock_next(&self, job: &JobRecord) {
        let Some(key) = job.concurrency_key.as_deref() else {
            return;
        };
        // The slot is already back; a failed release is picked up by maintenance.
        if let Err(e) = self.semaphores.release_next_blocked(key).await {
            e.log();
        }
    }

    /// Return every job `process_id` holds to ready. Held concurrency slots
    /// stay with the jobs.
    #[instrument(skip(self))]
    pub async fn release_claimed(&self, process_id: &str) -> Result<Vec<JobId>> {
        let mut tx = self.store.begin().await?;
        let claimed = tx.claimed_by_process(process_id).await?;
        if claimed.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let ids: Vec<JobId> = claimed.iter().map(|c| c.job_id).collect();
        let now = Utc::now();
        let ready: Vec<ReadyExecution> = tx
            .find_jobs(&ids)
            .await?
            .iter()
            .map(|job| ReadyExecution::for_job(job, now))
            .collect();

        tx.insert_ready(&ready).await?;
        tx.delete_claimed(&ids).await?;
        tx.commit().await?;

        counter!(JOBS_RELEASED).increment(ids.len() as u64);
        info!(count = ids.len(), process_id, "Released claimed jobs");
        Ok(ids)
    }
}
