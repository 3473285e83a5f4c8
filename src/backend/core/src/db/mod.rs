//! Persistence seam for the job ledgers.
//!
//! The coordinators in [`crate::jobs`] speak to a [`Store`] through short
//! [`Transaction`]s. Two stores ship with the crate:
//!
//! - [`PgStore`]: PostgreSQL via sqlx, the production store
//! - [`MemoryStore`]: an in-process store with row locks and rollback, used
//!   by tests and inline runs
//!
//! Row selection that feeds a claim, dispatch or release takes a [`RowLock`]
//! so concurrent transactions never pick the same row.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::Result;
use crate::jobs::execution::{
    BlockedExecution, ClaimedExecution, FailedExecution, ReadyExecution, ScheduledExecution,
    Semaphore,
};
use crate::jobs::job::{JobId, JobRecord, NewJob};
use crate::jobs::recurring::{RecurringExecution, RecurringTask};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// How a locking select treats rows another transaction already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLock {
    /// Pass over locked rows.
    SkipLocked,
    /// Fail with a lock-contention error instead of waiting.
    NoWait,
}

impl RowLock {
    pub(crate) fn sql(&self) -> &'static str {
        match self {
            RowLock::SkipLocked => "FOR UPDATE SKIP LOCKED",
            RowLock::NoWait => "FOR UPDATE NOWAIT",
        }
    }
}

/// Shared handle to a store.
pub type SharedStore = Arc<dyn Store>;

/// Opens transactions against the ledgers.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// One unit of work. Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait Transaction: Send {
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;

    // ═══════════════════════════════════════════════════════════════════════════
    // Jobs
    // ═══════════════════════════════════════════════════════════════════════════

    async fn insert_job(&mut self, job: &NewJob, now: DateTime<Utc>) -> Result<JobRecord>;
    async fn find_jobs(&mut self, ids: &[JobId]) -> Result<Vec<JobRecord>>;
    async fn mark_job_finished(&mut self, id: JobId, at: DateTime<Utc>) -> Result<()>;

    // ═══════════════════════════════════════════════════════════════════════════
    // Pauses
    // ═══════════════════════════════════════════════════════════════════════════

    async fn paused_queues(&mut self) -> Result<Vec<String>>;
    /// Idempotent.
    async fn insert_pause(&mut self, queue: &str, now: DateTime<Utc>) -> Result<()>;
    async fn delete_pause(&mut self, queue: &str) -> Result<()>;

    // ═══════════════════════════════════════════════════════════════════════════
    // Ready
    // ═══════════════════════════════════════════════════════════════════════════

    /// Distinct queue names with ready rows.
    async fn ready_queue_names(&mut self) -> Result<Vec<String>>;
    /// Ready job ids in claim order. `queues: None` means every queue.
    async fn select_ready(
        &mut self,
        queues: Option<&[String]>,
        excluded: &[String],
        limit: usize,
        lock: RowLock,
    ) -> Result<Vec<JobId>>;
    /// Lock the given ready rows; returns the ids that exist and were locked.
    async fn lock_ready(&mut self, ids: &[JobId], lock: RowLock) -> Result<Vec<JobId>>;
    async fn insert_ready(&mut self, rows: &[ReadyExecution]) -> Result<()>;
    async fn delete_ready(&mut self, ids: &[JobId]) -> Result<u64>;
    async fn ready_among(&mut self, ids: &[JobId]) -> Result<Vec<JobId>>;

    // ═══════════════════════════════════════════════════════════════════════════
    // Scheduled
    // ═══════════════════════════════════════════════════════════════════════════

    /// Scheduled ids with `scheduled_at <= now`, in dispatch order.
    async fn select_due_scheduled(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
        lock: RowLock,
    ) -> Result<Vec<JobId>>;
    async fn insert_scheduled(&mut self, row: &ScheduledExecution) -> Result<()>;
    async fn delete_scheduled(&mut self, ids: &[JobId]) -> Result<u64>;
    async fn scheduled_among(&mut self, ids: &[JobId]) -> Result<Vec<JobId>>;

    // ═══════════════════════════════════════════════════════════════════════════
    // Claimed
    // ═══════════════════════════════════════════════════════════════════════════

    async fn insert_claimed(&mut self, rows: &[ClaimedExecution]) -> Result<()>;
    async fn claimed_among(&mut self, ids: &[JobId]) -> Result<Vec<ClaimedExecution>>;
    async fn claimed_by_process(&mut self, process_id: &str) -> Result<Vec<ClaimedExecution>>;
    async fn delete_claimed(&mut self, ids: &[JobId]) -> Result<u64>;

    // ═══════════════════════════════════════════════════════════════════════════
    // Blocked
    // ═══════════════════════════════════════════════════════════════════════════

    /// Distinct concurrency keys with blocked rows.
    async fn blocked_concurrency_keys(&mut self, limit: usize) -> Result<Vec<String>>;
    /// Blocked ids for one key in release order.
    async fn select_blocked(&mut self, key: &str, limit: usize, lock: RowLock)
        -> Result<Vec<JobId>>;
    async fn insert_blocked(&mut self, row: &BlockedExecution) -> Result<()>;
    async fn delete_blocked(&mut self, ids: &[JobId]) -> Result<u64>;
    async fn blocked_among(&mut self, ids: &[JobId]) -> Result<Vec<JobId>>;

    // ═══════════════════════════════════════════════════════════════════════════
    // Failed
    // ═══════════════════════════════════════════════════════════════════════════

    async fn insert_failed(&mut self, row: &FailedExecution) -> Result<()>;
    async fn failed_among(&mut self, ids: &[JobId]) -> Result<Vec<JobId>>;

    // ═══════════════════════════════════════════════════════════════════════════
    // Semaphores
    // ═══════════════════════════════════════════════════════════════════════════

    async fn find_semaphore(&mut self, key: &str) -> Result<Option<Semaphore>>;
    /// Create the semaphore holding one slot. False if it already exists.
    async fn insert_semaphore(&mut self, key: &str, expires_at: DateTime<Utc>) -> Result<bool>;
    /// Take one more slot if fewer than `limit` are held.
    async fn increment_semaphore(
        &mut self,
        key: &str,
        limit: i32,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;
    /// Give one slot back. False if the semaphore holds none.
    async fn decrement_semaphore(&mut self, key: &str, expires_at: DateTime<Utc>) -> Result<bool>;
    /// Drop the row once no slots are held.
    async fn delete_empty_semaphore(&mut self, key: &str) -> Result<()>;
    async fn select_expired_semaphores(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
        lock: RowLock,
    ) -> Result<Vec<String>>;
    async fn delete_semaphores(&mut self, keys: &[String]) -> Result<u64>;

    // ═══════════════════════════════════════════════════════════════════════════
    // Recurring
    // ═══════════════════════════════════════════════════════════════════════════

    /// Insert or overwrite by task key.
    async fn upsert_recurring_tasks(&mut self, tasks: &[RecurringTask]) -> Result<()>;
    async fn recurring_tasks(&mut self) -> Result<Vec<RecurringTask>>;
    /// Record a run. False if `(task_key, run_at)` was already recorded.
    async fn insert_recurring_execution(
        &mut self,
        task_key: &str,
        run_at: DateTime<Utc>,
    ) -> Result<bool>;
    async fn set_recurring_execution_job(
        &mut self,
        task_key: &str,
        run_at: DateTime<Utc>,
        job_id: JobId,
    ) -> Result<()>;
    async fn recurring_executions(&mut self, task_key: &str) -> Result<Vec<RecurringExecution>>;
}
