//! In-process store.
//!
//! Tables live behind one mutex. Locking selects and inserts take row locks
//! owned by the transaction, released on commit or rollback. Every write pushes
//! an undo step so rollback (explicit or on drop) restores the tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{RowLock, Store, Transaction};
use crate::error::{ErrorCode, KeelError, Result};
use crate::jobs::execution::{
    BlockedExecution, ClaimedExecution, FailedExecution, ReadyExecution, ScheduledExecution,
    Semaphore,
};
use crate::jobs::job::{JobId, JobRecord, NewJob};
use crate::jobs::recurring::{RecurringExecution, RecurringTask};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Job(JobId),
    Ready(JobId),
    Scheduled(JobId),
    Claimed(JobId),
    Blocked(JobId),
    Semaphore(String),
}

#[derive(Default)]
struct Tables {
    next_job_id: i64,
    jobs: BTreeMap<JobId, JobRecord>,
    pauses: BTreeMap<String, DateTime<Utc>>,
    ready: BTreeMap<JobId, ReadyExecution>,
    scheduled: BTreeMap<JobId, ScheduledExecution>,
    claimed: BTreeMap<JobId, ClaimedExecution>,
    blocked: BTreeMap<JobId, BlockedExecution>,
    failed: BTreeMap<JobId, FailedExecution>,
    semaphores: BTreeMap<String, Semaphore>,
    recurring_tasks: BTreeMap<String, RecurringTask>,
    recurring_executions: BTreeMap<(String, DateTime<Utc>), RecurringExecution>,
    locks: HashMap<RowKey, u64>,
}

impl Tables {
    /// Lock up to `limit` candidates for `tx`, honouring `lock` for rows
    /// another transaction holds.
    fn lock_rows(
        &mut self,
        tx: u64,
        candidates: Vec<RowKey>,
        limit: usize,
        lock: RowLock,
        table: &'static str,
    ) -> Result<Vec<RowKey>> {
        let mut picked = Vec::new();
        for key in candidates {
            if picked.len() >= limit {
                break;
            }
            match self.locks.get(&key) {
                Some(owner) if *owner != tx => match lock {
                    RowLock::SkipLocked => continue,
                    RowLock::NoWait => return Err(KeelError::lock_not_available(table)),
                },
                _ => picked.push(key),
            }
        }
        for key in &picked {
            self.locks.insert(key.clone(), tx);
        }
        Ok(picked)
    }

    /// Take the lock on a written row when nobody else holds it.
    fn touch(&mut self, tx: u64, key: RowKey) {
        self.locks.entry(key).or_insert(tx);
    }

    fn release_locks(&mut self, tx: u64) {
        self.locks.retain(|_, owner| *owner != tx);
    }
}

type Undo = Box<dyn FnOnce(&mut Tables) + Send>;

fn duplicate(table: &str, id: impl std::fmt::Display) -> KeelError {
    KeelError::new(ErrorCode::DuplicateRecord, "Record already exists")
        .with_context("table", table)
        .with_context("id", id.to_string())
}

/// In-memory [`Store`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    next_tx: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of row locks currently held, across all transactions.
    pub fn held_locks(&self) -> usize {
        self.tables.lock().locks.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let id = self.next_tx.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(MemoryTransaction {
            tables: Arc::clone(&self.tables),
            id,
            undo: Vec::new(),
            done: false,
        }))
    }
}

/// Transaction over a [`MemoryStore`].
pub struct MemoryTransaction {
    tables: Arc<Mutex<Tables>>,
    id: u64,
    undo: Vec<Undo>,
    done: bool,
}

impl MemoryTransaction {
    fn undo_all(&mut self) {
        let mut tables = self.tables.lock();
        while let Some(step) = self.undo.pop() {
            step(&mut tables);
        }
        tables.release_locks(self.id);
        self.done = true;
    }

    fn push(&mut self, step: impl FnOnce(&mut Tables) + Send + 'static) {
        self.undo.push(Box::new(step));
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.done {
            self.undo_all();
        }
    }
}

macro_rules! delete_rows {
    ($self:ident, $table:ident, $ids:expr) => {{
        let mut removed = Vec::new();
        {
            let mut tables = $self.tables.lock();
            for id in $ids {
                if let Some(row) = tables.$table.remove(id) {
                    removed.push(row);
                }
            }
        }
        let count = removed.len() as u64;
        $self.push(move |t| {
            for row in removed {
                t.$table.insert(row.job_id, row);
            }
        });
        Ok(count)
    }};
}

fn among<V>(table: &BTreeMap<JobId, V>, ids: &[JobId]) -> Vec<JobId> {
    let mut found: Vec<JobId> = ids.iter().copied().filter(|id| table.contains_key(id)).collect();
    found.sort();
    found.dedup();
    found
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.undo.clear();
        self.tables.lock().release_locks(self.id);
        self.done = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.undo_all();
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Jobs
    // ═══════════════════════════════════════════════════════════════════════════

    async fn insert_job(&mut self, job: &NewJob, now: DateTime<Utc>) -> Result<JobRecord> {
        let record = {
            let mut tables = self.tables.lock();
            tables.next_job_id += 1;
            let id = JobId(tables.next_job_id);
            let (key, limit, duration) = match &job.concurrency {
                Some(c) => (Some(c.key.clone()), c.limit, c.duration_secs),
                None => (None, 1, crate::jobs::job::DEFAULT_CONCURRENCY_DURATION_SECS),
            };
            let record = JobRecord {
                id,
                class_name: job.class_name.clone(),
                queue_name: job.queue_name.clone(),
                priority: job.priority,
                arguments: job.arguments.clone(),
                scheduled_at: job.scheduled_at,
                concurrency_key: key,
                concurrency_limit: limit,
                concurrency_duration_secs: duration,
                finished_at: None,
                created_at: now,
            };
            tables.jobs.insert(id, record.clone());
            tables.touch(self.id, RowKey::Job(id));
            record
        };
        let id = record.id;
        self.push(move |t| {
            t.jobs.remove(&id);
        });
        Ok(record)
    }

    async fn find_jobs(&mut self, ids: &[JobId]) -> Result<Vec<JobRecord>> {
        let tables = self.tables.lock();
        let mut jobs: Vec<JobRecord> = ids.iter().filter_map(|id| tables.jobs.get(id).cloned()).collect();
        jobs.sort_by_key(|job| job.id);
        jobs.dedup_by_key(|job| job.id);
        Ok(jobs)
    }

    async fn mark_job_finished(&mut self, id: JobId, at: DateTime<Utc>) -> Result<()> {
        let previous = {
            let mut tables = self.tables.lock();
            let job = tables
                .jobs
                .get_mut(&id)
                .ok_or_else(|| KeelError::not_found("job", id.to_string()))?;
            job.finished_at.replace(at)
        };
        self.push(move |t| {
            if let Some(job) = t.jobs.get_mut(&id) {
                job.finished_at = previous;
            }
        });
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Pauses
    // ═══════════════════════════════════════════════════════════════════════════

    async fn paused_queues(&mut self) -> Result<Vec<String>> {
        Ok(self.tables.lock().pauses.keys().cloned().collect())
    }

    async fn insert_pause(&mut self, queue: &str, now: DateTime<Utc>) -> Result<()> {
        let inserted = {
            let mut tables = self.tables.lock();
            if tables.pauses.contains_key(queue) {
                false
            } else {
                tables.pauses.insert(queue.to_string(), now);
                true
            }
        };
        if inserted {
            let queue = queue.to_string();
            self.push(move |t| {
                t.pauses.remove(&queue);
            });
        }
        Ok(())
    }

    async fn delete_pause(&mut self, queue: &str) -> Result<()> {
        let removed = self.tables.lock().pauses.remove(queue);
        if let Some(at) = removed {
            let queue = queue.to_string();
            self.push(move |t| {
                t.pauses.insert(queue, at);
            });
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Ready
    // ═══════════════════════════════════════════════════════════════════════════

    async fn ready_queue_names(&mut self) -> Result<Vec<String>> {
        let tables = self.tables.lock();
        let mut names: Vec<String> = tables.ready.values().map(|r| r.queue_name.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn select_ready(
        &mut self,
        queues: Option<&[String]>,
        excluded: &[String],
        limit: usize,
        lock: RowLock,
    ) -> Result<Vec<JobId>> {
        let mut tables = self.tables.lock();
        let mut rows: Vec<&ReadyExecution> = tables
            .ready
            .values()
            .filter(|r| queues.map_or(true, |q| q.contains(&r.queue_name)))
            .filter(|r| !excluded.contains(&r.queue_name))
            .collect();
        rows.sort_by(|a, b| a.claim_order(b));
        let candidates = rows.into_iter().map(|r| RowKey::Ready(r.job_id)).collect();
        let picked = tables.lock_rows(self.id, candidates, limit, lock, "ready_executions")?;
        Ok(picked
            .into_iter()
            .filter_map(|key| match key {
                RowKey::Ready(id) => Some(id),
                _ => None,
            })
            .collect())
    }

    async fn lock_ready(&mut self, ids: &[JobId], lock: RowLock) -> Result<Vec<JobId>> {
        let mut tables = self.tables.lock();
        let candidates: Vec<RowKey> = among(&tables.ready, ids).into_iter().map(RowKey::Ready).collect();
        let limit = candidates.len();
        let picked = tables.lock_rows(self.id, candidates, limit, lock, "ready_executions")?;
        Ok(picked
            .into_iter()
            .filter_map(|key| match key {
                RowKey::Ready(id) => Some(id),
                _ => None,
            })
            .collect())
    }

    async fn insert_ready(&mut self, rows: &[ReadyExecution]) -> Result<()> {
        {
            let mut tables = self.tables.lock();
            if let Some(row) = rows.iter().find(|r| tables.ready.contains_key(&r.job_id)) {
                return Err(duplicate("ready_executions", row.job_id));
            }
            for row in rows {
                tables.ready.insert(row.job_id, row.clone());
                tables.touch(self.id, RowKey::Ready(row.job_id));
            }
        }
        let ids: Vec<JobId> = rows.iter().map(|r| r.job_id).collect();
        self.push(move |t| {
            for id in ids {
                t.ready.remove(&id);
            }
        });
        Ok(())
    }

    async fn delete_ready(&mut self, ids: &[JobId]) -> Result<u64> {
        delete_rows!(self, ready, ids)
    }

    async fn ready_among(&mut self, ids: &[JobId]) -> Result<Vec<JobId>> {
        Ok(among(&self.tables.lock().ready, ids))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Scheduled
    // ═══════════════════════════════════════════════════════════════════════════

    async fn select_due_scheduled(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
        lock: RowLock,
    ) -> Result<Vec<JobId>> {
        let mut tables = self.tables.lock();
        let mut rows: Vec<&ScheduledExecution> =
            tables.scheduled.values().filter(|r| r.scheduled_at <= now).collect();
        rows.sort_by(|a, b| a.dispatch_order(b));
        let candidates = rows.into_iter().map(|r| RowKey::Scheduled(r.job_id)).collect();
        let picked = tables.lock_rows(self.id, candidates, limit, lock, "scheduled_executions")?;
        Ok(picked
            .into_iter()
            .filter_map(|key| match key {
                RowKey::Scheduled(id) => Some(id),
                _ => None,
            })
            .collect())
    }

    async fn insert_scheduled(&mut self, row: &ScheduledExecution) -> Result<()> {
        {
            let mut tables = self.tables.lock();
            if tables.scheduled.contains_key(&row.job_id) {
                return Err(duplicate("scheduled_executions", row.job_id));
            }
            tables.scheduled.insert(row.job_id, row.clone());
            tables.touch(self.id, RowKey::Scheduled(row.job_id));
        }
        let id = row.job_id;
        self.push(move |t| {
            t.scheduled.remove(&id);
        });
        Ok(())
    }

    async fn delete_scheduled(&mut self, ids: &[JobId]) -> Result<u64> {
        delete_rows!(self, scheduled, ids)
    }

    async fn scheduled_among(&mut self, ids: &[JobId]) -> Result<Vec<JobId>> {
        Ok(among(&self.tables.lock().scheduled, ids))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Claimed
    // ═══════════════════════════════════════════════════════════════════════════

    async fn insert_claimed(&mut self, rows: &[ClaimedExecution]) -> Result<()> {
        {
            let mut tables = self.tables.lock();
            if let Some(row) = rows.iter().find(|r| tables.claimed.contains_key(&r.job_id)) {
                return Err(duplicate("claimed_executions", row.job_id));
            }
            for row in rows {
                tables.claimed.insert(row.job_id, row.clone());
                tables.touch(self.id, RowKey::Claimed(row.job_id));
            }
        }
        let ids: Vec<JobId> = rows.iter().map(|r| r.job_id).collect();
        self.push(move |t| {
            for id in ids {
                t.claimed.remove(&id);
            }
        });
        Ok(())
    }

    async fn claimed_among(&mut self, ids: &[JobId]) -> Result<Vec<ClaimedExecution>> {
        let tables = self.tables.lock();
        Ok(among(&tables.claimed, ids)
            .into_iter()
            .filter_map(|id| tables.claimed.get(&id).cloned())
            .collect())
    }

    async fn claimed_by_process(&mut self, process_id: &str) -> Result<Vec<ClaimedExecution>> {
        let tables = self.tables.lock();
        Ok(tables
            .claimed
            .values()
            .filter(|row| row.process_id == process_id)
            .cloned()
            .collect())
    }

    async fn delete_claimed(&mut self, ids: &[JobId]) -> Result<u64> {
        delete_rows!(self, claimed, ids)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Blocked
    // ═══════════════════════════════════════════════════════════════════════════

    async fn blocked_concurrency_keys(&mut self, limit: usize) -> Result<Vec<String>> {
        let tables = self.tables.lock();
        let mut keys: Vec<String> = tables.blocked.values().map(|r| r.concurrency_key.clone()).collect();
        keys.sort();
        keys.dedup();
        keys.truncate(limit);
        Ok(keys)
    }

    async fn select_blocked(
        &mut self,
        key: &str,
        limit: usize,
        lock: RowLock,
    ) -> Result<Vec<JobId>> {
        let mut tables = self.tables.lock();
        let mut rows: Vec<&BlockedExecution> =
            tables.blocked.values().filter(|r| r.concurrency_key == key).collect();
        rows.sort_by(|a, b| a.release_order(b));
        let candidates = rows.into_iter().map(|r| RowKey::Blocked(r.job_id)).collect();
        let picked = tables.lock_rows(self.id, candidates, limit, lock, "blocked_executions")?;
        Ok(picked
            .into_iter()
            .filter_map(|key| match key {
                RowKey::Blocked(id) => Some(id),
                _ => None,
            })
            .collect())
    }

    async fn insert_blocked(&mut self, row: &BlockedExecution) -> Result<()> {
        {
            let mut tables = self.tables.lock();
            if tables.blocked.contains_key(&row.job_id) {
                return Err(duplicate("blocked_executions", row.job_id));
            }
            tables.blocked.insert(row.job_id, row.clone());
            tables.touch(self.id, RowKey::Blocked(row.job_id));
        }
        let id = row.job_id;
        self.push(move |t| {
            t.blocked.remove(&id);
        });
        Ok(())
    }

    async fn delete_blocked(&mut self, ids: &[JobId]) -> Result<u64> {
        delete_rows!(self, blocked, ids)
    }

    async fn blocked_among(&mut self, ids: &[JobId]) -> Result<Vec<JobId>> {
        Ok(among(&self.tables.lock().blocked, ids))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Failed
    // ═══════════════════════════════════════════════════════════════════════════

    async fn insert_failed(&mut self, row: &FailedExecution) -> Result<()> {
        {
            let mut tables = self.tables.lock();
            if tables.failed.contains_key(&row.job_id) {
                return Err(duplicate("failed_executions", row.job_id));
            }
            tables.failed.insert(row.job_id, row.clone());
        }
        let id = row.job_id;
        self.push(move |t| {
            t.failed.remove(&id);
        });
        Ok(())
    }

    async fn failed_among(&mut self, ids: &[JobId]) -> Result<Vec<JobId>> {
        Ok(among(&self.tables.lock().failed, ids))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Semaphores
    // ═══════════════════════════════════════════════════════════════════════════

    async fn find_semaphore(&mut self, key: &str) -> Result<Option<Semaphore>> {
        Ok(self.tables.lock().semaphores.get(key).cloned())
    }

    async fn insert_semaphore(&mut self, key: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        {
            let mut tables = self.tables.lock();
            if tables.semaphores.contains_key(key) {
                return Ok(false);
            }
            tables.semaphores.insert(
                key.to_string(),
                Semaphore {
                    key: key.to_string(),
                    value: 1,
                    expires_at,
                },
            );
            tables.touch(self.id, RowKey::Semaphore(key.to_string()));
        }
        let key = key.to_string();
        self.push(move |t| {
            t.semaphores.remove(&key);
        });
        Ok(true)
    }

    async fn increment_semaphore(
        &mut self,
        key: &str,
        limit: i32,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        {
            let mut tables = self.tables.lock();
            match tables.semaphores.get_mut(key) {
                Some(semaphore) if semaphore.value < limit => {
                    semaphore.value += 1;
                    semaphore.expires_at = expires_at;
                }
                _ => return Ok(false),
            }
            tables.touch(self.id, RowKey::Semaphore(key.to_string()));
        }
        let key = key.to_string();
        self.push(move |t| {
            if let Some(semaphore) = t.semaphores.get_mut(&key) {
                semaphore.value -= 1;
            }
        });
        Ok(true)
    }

    async fn decrement_semaphore(&mut self, key: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let previous_expiry = {
            let mut tables = self.tables.lock();
            let previous = match tables.semaphores.get_mut(key) {
                Some(semaphore) if semaphore.value > 0 => {
                    semaphore.value -= 1;
                    std::mem::replace(&mut semaphore.expires_at, expires_at)
                }
                _ => return Ok(false),
            };
            tables.touch(self.id, RowKey::Semaphore(key.to_string()));
            previous
        };
        let key = key.to_string();
        self.push(move |t| {
            let semaphore = t.semaphores.entry(key.clone()).or_insert(Semaphore {
                key,
                value: 0,
                expires_at: previous_expiry,
            });
            semaphore.value += 1;
        });
        Ok(true)
    }

    async fn delete_empty_semaphore(&mut self, key: &str) -> Result<()> {
        let removed = {
            let mut tables = self.tables.lock();
            match tables.semaphores.get(key) {
                Some(semaphore) if semaphore.value <= 0 => tables.semaphores.remove(key),
                _ => None,
            }
        };
        if let Some(semaphore) = removed {
            self.push(move |t| {
                t.semaphores.insert(semaphore.key.clone(), semaphore);
            });
        }
        Ok(())
    }

    async fn select_expired_semaphores(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
        lock: RowLock,
    ) -> Result<Vec<String>> {
        let mut tables = self.tables.lock();
        let mut rows: Vec<&Semaphore> =
            tables.semaphores.values().filter(|s| s.expires_at < now).collect();
        rows.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then_with(|| a.key.cmp(&b.key)));
        let candidates = rows.into_iter().map(|s| RowKey::Semaphore(s.key.clone())).collect();
        let picked = tables.lock_rows(self.id, candidates, limit, lock, "semaphores")?;
        Ok(picked
            .into_iter()
            .filter_map(|key| match key {
                RowKey::Semaphore(key) => Some(key),
                _ => None,
            })
            .collect())
    }

    async fn delete_semaphores(&mut self, keys: &[String]) -> Result<u64> {
        let removed: Vec<Semaphore> = {
            let mut tables = self.tables.lock();
            keys.iter().filter_map(|key| tables.semaphores.remove(key)).collect()
        };
        let count = removed.len() as u64;
        self.push(move |t| {
            for semaphore in removed {
                t.semaphores.insert(semaphore.key.clone(), semaphore);
            }
        });
        Ok(count)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Recurring
    // ═══════════════════════════════════════════════════════════════════════════

    async fn upsert_recurring_tasks(&mut self, tasks: &[RecurringTask]) -> Result<()> {
        let previous: Vec<(String, Option<RecurringTask>)> = {
            let mut tables = self.tables.lock();
            tasks
                .iter()
                .map(|task| {
                    let old = tables.recurring_tasks.insert(task.key.clone(), task.clone());
                    (task.key.clone(), old)
                })
                .collect()
        };
        self.push(move |t| {
            for (key, old) in previous.into_iter().rev() {
                match old {
                    Some(task) => t.recurring_tasks.insert(key, task),
                    None => t.recurring_tasks.remove(&key),
                };
            }
        });
        Ok(())
    }

    async fn recurring_tasks(&mut self) -> Result<Vec<RecurringTask>> {
        Ok(self.tables.lock().recurring_tasks.values().cloned().collect())
    }

    async fn insert_recurring_execution(
        &mut self,
        task_key: &str,
        run_at: DateTime<Utc>,
    ) -> Result<bool> {
        let slot = (task_key.to_string(), run_at);
        {
            let mut tables = self.tables.lock();
            if tables.recurring_executions.contains_key(&slot) {
                return Ok(false);
            }
            tables.recurring_executions.insert(
                slot.clone(),
                RecurringExecution {
                    task_key: task_key.to_string(),
                    run_at,
                    job_id: None,
                },
            );
        }
        self.push(move |t| {
            t.recurring_executions.remove(&slot);
        });
        Ok(true)
    }

    async fn set_recurring_execution_job(
        &mut self,
        task_key: &str,
        run_at: DateTime<Utc>,
        job_id: JobId,
    ) -> Result<()> {
        let slot = (task_key.to_string(), run_at);
        let previous = {
            let mut tables = self.tables.lock();
            let execution = tables
                .recurring_executions
                .get_mut(&slot)
                .ok_or_else(|| KeelError::not_found("recurring_execution", task_key))?;
            execution.job_id.replace(job_id)
        };
        self.push(move |t| {
            if let Some(execution) = t.recurring_executions.get_mut(&slot) {
                execution.job_id = previous;
            }
        });
        Ok(())
    }

    async fn recurring_executions(&mut self, task_key: &str) -> Result<Vec<RecurringExecution>> {
        let tables = self.tables.lock();
        Ok(tables
            .recurring_executions
            .values()
            .filter(|e| e.task_key == task_key)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_row(job: &JobRecord) -> ReadyExecution {
        ReadyExecution::for_job(job, Utc::now())
    }

    async fn seed_ready(store: &MemoryStore, count: usize) -> Vec<JobId> {
        let mut tx = store.begin().await.unwrap();
        let mut ids = Vec::new();
        for _ in 0..count {
            let job = tx.insert_job(&NewJob::new("EchoJob"), Utc::now()).await.unwrap();
            tx.insert_ready(&[ready_row(&job)]).await.unwrap();
            ids.push(job.id);
        }
        tx.commit().await.unwrap();
        ids
    }

    #[tokio::test]
    async fn test_skip_locked_passes_over_held_rows() {
        let store = MemoryStore::new();
        let ids = seed_ready(&store, 3).await;

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();

        let a = first.select_ready(None, &[], 2, RowLock::SkipLocked).await.unwrap();
        let b = second.select_ready(None, &[], 2, RowLock::SkipLocked).await.unwrap();

        assert_eq!(a, ids[..2].to_vec());
        assert_eq!(b, vec![ids[2]]);
    }

    #[tokio::test]
    async fn test_nowait_reports_contention() {
        let store = MemoryStore::new();
        seed_ready(&store, 1).await;

        let mut first = store.begin().await.unwrap();
        first.select_ready(None, &[], 1, RowLock::SkipLocked).await.unwrap();

        let mut second = store.begin().await.unwrap();
        let err = second.select_ready(None, &[], 1, RowLock::NoWait).await.unwrap_err();
        assert!(err.is_lock_contention());
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let store = MemoryStore::new();
        let ids = seed_ready(&store, 1).await;

        {
            let mut tx = store.begin().await.unwrap();
            assert_eq!(tx.delete_ready(&ids).await.unwrap(), 1);
        }

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.ready_among(&ids).await.unwrap(), ids);
        assert_eq!(store.held_locks(), 0);
    }

    #[tokio::test]
    async fn test_semaphore_increment_respects_limit() {
        let store = MemoryStore::new();
        let expires = Utc::now();
        let mut tx = store.begin().await.unwrap();

        assert!(tx.insert_semaphore("k", expires).await.unwrap());
        assert!(!tx.insert_semaphore("k", expires).await.unwrap());
        assert!(tx.increment_semaphore("k", 2, expires).await.unwrap());
        assert!(!tx.increment_semaphore("k", 2, expires).await.unwrap());
        assert_eq!(tx.find_semaphore("k").await.unwrap().unwrap().value, 2);
    }

    #[tokio::test]
    async fn test_recurring_execution_is_unique() {
        let store = MemoryStore::new();
        let run_at = Utc::now();
        let mut tx = store.begin().await.unwrap();

        assert!(tx.insert_recurring_execution("nightly", run_at).await.unwrap());
        assert!(!tx.insert_recurring_execution("nightly", run_at).await.unwrap());
    }
}
