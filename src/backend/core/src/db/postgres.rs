//! PostgreSQL store.
//!
//! Uses sqlx with a connection pool. Each [`PgTransaction`] wraps one sqlx
//! transaction; locking selects map [`RowLock`] onto `FOR UPDATE SKIP LOCKED`
//! and `FOR UPDATE NOWAIT`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres};
use tracing::info;

use super::{RowLock, Store, Transaction};
use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::jobs::execution::{
    BlockedExecution, ClaimedExecution, FailedExecution, ReadyExecution, ScheduledExecution,
    Semaphore,
};
use crate::jobs::job::{JobId, JobRecord, NewJob, DEFAULT_CONCURRENCY_DURATION_SECS};
use crate::jobs::recurring::{RecurringExecution, RecurringTask};

// ═══════════════════════════════════════════════════════════════════════════════
// Row Types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, FromRow)]
struct JobRow {
    id: i64,
    class_name: String,
    queue_name: String,
    priority: i32,
    arguments: serde_json::Value,
    scheduled_at: Option<DateTime<Utc>>,
    concurrency_key: Option<String>,
    concurrency_limit: i32,
    concurrency_duration_secs: i64,
    finished_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<JobRow> for JobRecord {
    fn from(row: JobRow) -> Self {
        Self {
            id: JobId(row.id),
            class_name: row.class_name,
            queue_name: row.queue_name,
            priority: row.priority,
            arguments: row.arguments,
            scheduled_at: row.scheduled_at,
            concurrency_key: row.concurrency_key,
            concurrency_limit: row.concurrency_limit,
            concurrency_duration_secs: row.concurrency_duration_secs,
            finished_at: row.finished_at,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ClaimedRow {
    job_id: i64,
    process_id: String,
    created_at: DateTime<Utc>,
}

impl From<ClaimedRow> for ClaimedExecution {
    fn from(row: ClaimedRow) -> Self {
        Self {
            job_id: JobId(row.job_id),
            process_id: row.process_id,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct SemaphoreRow {
    key: String,
    value: i32,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct RecurringTaskRow {
    key: String,
    class_name: String,
    schedule: String,
    arguments: Json<Vec<serde_json::Value>>,
    queue_name: Option<String>,
    priority: Option<i32>,
    is_static: bool,
}

impl From<RecurringTaskRow> for RecurringTask {
    fn from(row: RecurringTaskRow) -> Self {
        Self {
            key: row.key,
            class_name: row.class_name,
            schedule: row.schedule,
            arguments: row.arguments.0,
            queue_name: row.queue_name,
            priority: row.priority,
            is_static: row.is_static,
        }
    }
}

#[derive(Debug, FromRow)]
struct RecurringExecutionRow {
    task_key: String,
    run_at: DateTime<Utc>,
    job_id: Option<i64>,
}

fn raw_ids(ids: &[JobId]) -> Vec<i64> {
    ids.iter().map(|id| id.0).collect()
}

fn job_ids(rows: Vec<(i64,)>) -> Vec<JobId> {
    rows.into_iter().map(|(id,)| JobId(id)).collect()
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════════════════════════

/// PostgreSQL [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a connection pool.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

/// Transaction over a [`PgStore`].
pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Jobs
    // ═══════════════════════════════════════════════════════════════════════════

    async fn insert_job(&mut self, job: &NewJob, now: DateTime<Utc>) -> Result<JobRecord> {
        let (key, limit, duration) = match &job.concurrency {
            Some(c) => (Some(c.key.as_str()), c.limit, c.duration_secs),
            None => (None, 1, DEFAULT_CONCURRENCY_DURATION_SECS),
        };

        let row: JobRow = sqlx::query_as(
            r#"
            INSERT INTO jobs (class_name, queue_name, priority, arguments, scheduled_at,
                              concurrency_key, concurrency_limit, concurrency_duration_secs, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(&job.class_name)
        .bind(&job.queue_name)
        .bind(job.priority)
        .bind(&job.arguments)
        .bind(job.scheduled_at)
        .bind(key)
        .bind(limit)
        .bind(duration)
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(row.into())
    }

    async fn find_jobs(&mut self, ids: &[JobId]) -> Result<Vec<JobRecord>> {
        let rows: Vec<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = ANY($1) ORDER BY id")
            .bind(raw_ids(ids))
            .fetch_all(&mut *self.tx)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn mark_job_finished(&mut self, id: JobId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE jobs SET finished_at = $2 WHERE id = $1")
            .bind(id.0)
            .bind(at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Pauses
    // ═══════════════════════════════════════════════════════════════════════════

    async fn paused_queues(&mut self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT queue_name FROM pauses ORDER BY queue_name")
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn insert_pause(&mut self, queue: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO pauses (queue_name, created_at) VALUES ($1, $2) ON CONFLICT (queue_name) DO NOTHING",
        )
        .bind(queue)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_pause(&mut self, queue: &str) -> Result<()> {
        sqlx::query("DELETE FROM pauses WHERE queue_name = $1")
            .bind(queue)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Ready
    // ═══════════════════════════════════════════════════════════════════════════

    async fn ready_queue_names(&mut self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT queue_name FROM ready_executions ORDER BY queue_name")
                .fetch_all(&mut *self.tx)
                .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn select_ready(
        &mut self,
        queues: Option<&[String]>,
        excluded: &[String],
        limit: usize,
        lock: RowLock,
    ) -> Result<Vec<JobId>> {
        let sql = format!(
            r#"
            SELECT job_id FROM ready_executions
            WHERE ($1::text[] IS NULL OR queue_name = ANY($1))
              AND NOT (queue_name = ANY($2))
            ORDER BY priority ASC, job_id ASC
            LIMIT $3
            {}
            "#,
            lock.sql()
        );

        let rows: Vec<(i64,)> = sqlx::query_as(&sql)
            .bind(queues.map(|q| q.to_vec()))
            .bind(excluded.to_vec())
            .bind(sql_limit(limit))
            .fetch_all(&mut *self.tx)
            .await?;

        Ok(job_ids(rows))
    }

    async fn lock_ready(&mut self, ids: &[JobId], lock: RowLock) -> Result<Vec<JobId>> {
        let sql = format!(
            "SELECT job_id FROM ready_executions WHERE job_id = ANY($1) ORDER BY job_id {}",
            lock.sql()
        );
        let rows: Vec<(i64,)> = sqlx::query_as(&sql)
            .bind(raw_ids(ids))
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(job_ids(rows))
    }

    async fn insert_ready(&mut self, rows: &[ReadyExecution]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO ready_executions (job_id, queue_name, priority, created_at)
            SELECT * FROM UNNEST($1::bigint[], $2::text[], $3::int[], $4::timestamptz[])
            "#,
        )
        .bind(rows.iter().map(|r| r.job_id.0).collect::<Vec<_>>())
        .bind(rows.iter().map(|r| r.queue_name.clone()).collect::<Vec<_>>())
        .bind(rows.iter().map(|r| r.priority).collect::<Vec<_>>())
        .bind(rows.iter().map(|r| r.created_at).collect::<Vec<_>>())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_ready(&mut self, ids: &[JobId]) -> Result<u64> {
        let result = sqlx::query("DELETE FROM ready_executions WHERE job_id = ANY($1)")
            .bind(raw_ids(ids))
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn ready_among(&mut self, ids: &[JobId]) -> Result<Vec<JobId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT job_id FROM ready_executions WHERE job_id = ANY($1) ORDER BY job_id",
        )
        .bind(raw_ids(ids))
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(job_ids(rows))
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
        let sql = format!(
            r#"
            SELECT job_id FROM scheduled_executions
            WHERE scheduled_at <= $1
            ORDER BY scheduled_at ASC, priority ASC, job_id ASC
            LIMIT $2
            {}
            "#,
            lock.sql()
        );

        let rows: Vec<(i64,)> = sqlx::query_as(&sql)
            .bind(now)
            .bind(sql_limit(limit))
            .fetch_all(&mut *self.tx)
            .await?;

        Ok(job_ids(rows))
    }

    async fn insert_scheduled(&mut self, row: &ScheduledExecution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_executions (job_id, queue_name, priority, scheduled_at, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(row.job_id.0)
        .bind(&row.queue_name)
        .bind(row.priority)
        .bind(row.scheduled_at)
        .bind(row.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_scheduled(&mut self, ids: &[JobId]) -> Result<u64> {
        let result = sqlx::query("DELETE FROM scheduled_executions WHERE job_id = ANY($1)")
            .bind(raw_ids(ids))
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn scheduled_among(&mut self, ids: &[JobId]) -> Result<Vec<JobId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT job_id FROM scheduled_executions WHERE job_id = ANY($1) ORDER BY job_id",
        )
        .bind(raw_ids(ids))
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(job_ids(rows))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Claimed
    // ═══════════════════════════════════════════════════════════════════════════

    async fn insert_claimed(&mut self, rows: &[ClaimedExecution]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO claimed_executions (job_id, process_id, created_at)
            SELECT * FROM UNNEST($1::bigint[], $2::text[], $3::timestamptz[])
            "#,
        )
        .bind(rows.iter().map(|r| r.job_id.0).collect::<Vec<_>>())
        .bind(rows.iter().map(|r| r.process_id.clone()).collect::<Vec<_>>())
        .bind(rows.iter().map(|r| r.created_at).collect::<Vec<_>>())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn claimed_among(&mut self, ids: &[JobId]) -> Result<Vec<ClaimedExecution>> {
        let rows: Vec<ClaimedRow> = sqlx::query_as(
            "SELECT job_id, process_id, created_at FROM claimed_executions WHERE job_id = ANY($1) ORDER BY job_id",
        )
        .bind(raw_ids(ids))
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn claimed_by_process(&mut self, process_id: &str) -> Result<Vec<ClaimedExecution>> {
        let rows: Vec<ClaimedRow> = sqlx::query_as(
            "SELECT job_id, process_id, created_at FROM claimed_executions WHERE process_id = $1 ORDER BY job_id",
        )
        .bind(process_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_claimed(&mut self, ids: &[JobId]) -> Result<u64> {
        let result = sqlx::query("DELETE FROM claimed_executions WHERE job_id = ANY($1)")
            .bind(raw_ids(ids))
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Blocked
    // ═══════════════════════════════════════════════════════════════════════════

    async fn blocked_concurrency_keys(&mut self, limit: usize) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT concurrency_key FROM blocked_executions ORDER BY concurrency_key LIMIT $1",
        )
        .bind(sql_limit(limit))
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    async fn select_blocked(
        &mut self,
        key: &str,
        limit: usize,
        lock: RowLock,
    ) -> Result<Vec<JobId>> {
        let sql = format!(
            r#"
            SELECT job_id FROM blocked_executions
            WHERE concurrency_key = $1
            ORDER BY priority ASC, job_id ASC
            LIMIT $2
            {}
            "#,
            lock.sql()
        );

        let rows: Vec<(i64,)> = sqlx::query_as(&sql)
            .bind(key)
            .bind(sql_limit(limit))
            .fetch_all(&mut *self.tx)
            .await?;

        Ok(job_ids(rows))
    }

    async fn insert_blocked(&mut self, row: &BlockedExecution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO blocked_executions (job_id, queue_name, priority, concurrency_key, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(row.job_id.0)
        .bind(&row.queue_name)
        .bind(row.priority)
        .bind(&row.concurrency_key)
        .bind(row.expires_at)
        .bind(row.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_blocked(&mut self, ids: &[JobId]) -> Result<u64> {
        let result = sqlx::query("DELETE FROM blocked_executions WHERE job_id = ANY($1)")
            .bind(raw_ids(ids))
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn blocked_among(&mut self, ids: &[JobId]) -> Result<Vec<JobId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT job_id FROM blocked_executions WHERE job_id = ANY($1) ORDER BY job_id",
        )
        .bind(raw_ids(ids))
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(job_ids(rows))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Failed
    // ═══════════════════════════════════════════════════════════════════════════

    async fn insert_failed(&mut self, row: &FailedExecution) -> Result<()> {
        sqlx::query("INSERT INTO failed_executions (job_id, error, created_at) VALUES ($1, $2, $3)")
            .bind(row.job_id.0)
            .bind(&row.error)
            .bind(row.created_at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn failed_among(&mut self, ids: &[JobId]) -> Result<Vec<JobId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT job_id FROM failed_executions WHERE job_id = ANY($1) ORDER BY job_id",
        )
        .bind(raw_ids(ids))
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(job_ids(rows))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Semaphores
    // ═══════════════════════════════════════════════════════════════════════════

    async fn find_semaphore(&mut self, key: &str) -> Result<Option<Semaphore>> {
        let row: Option<SemaphoreRow> =
            sqlx::query_as("SELECT key, value, expires_at FROM semaphores WHERE key = $1")
                .bind(key)
                .fetch_optional(&mut *self.tx)
                .await?;

        Ok(row.map(|r| Semaphore {
            key: r.key,
            value: r.value,
            expires_at: r.expires_at,
        }))
    }

    async fn insert_semaphore(&mut self, key: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO semaphores (key, value, expires_at) VALUES ($1, 1, $2) ON CONFLICT (key) DO NOTHING",
        )
        .bind(key)
        .bind(expires_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn increment_semaphore(
        &mut self,
        key: &str,
        limit: i32,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE semaphores SET value = value + 1, expires_at = $3 WHERE key = $1 AND value < $2",
        )
        .bind(key)
        .bind(limit)
        .bind(expires_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn decrement_semaphore(&mut self, key: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE semaphores SET value = value - 1, expires_at = $2 WHERE key = $1 AND value > 0",
        )
        .bind(key)
        .bind(expires_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_empty_semaphore(&mut self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM semaphores WHERE key = $1 AND value <= 0")
            .bind(key)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn select_expired_semaphores(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
        lock: RowLock,
    ) -> Result<Vec<String>> {
        let sql = format!(
            r#"
            SELECT key FROM semaphores
            WHERE expires_at < $1
            ORDER BY expires_at ASC, key ASC
            LIMIT $2
            {}
            "#,
            lock.sql()
        );

        let rows: Vec<(String,)> = sqlx::query_as(&sql)
            .bind(now)
            .bind(sql_limit(limit))
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    async fn delete_semaphores(&mut self, keys: &[String]) -> Result<u64> {
        let result = sqlx::query("DELETE FROM semaphores WHERE key = ANY($1)")
            .bind(keys.to_vec())
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Recurring
    // ═══════════════════════════════════════════════════════════════════════════

    async fn upsert_recurring_tasks(&mut self, tasks: &[RecurringTask]) -> Result<()> {
        // Key order keeps concurrent upserts from deadlocking on each other.
        let mut ordered: Vec<&RecurringTask> = tasks.iter().collect();
        ordered.sort_by(|a, b| a.key.cmp(&b.key));

        for task in ordered {
            sqlx::query(
                r#"
                INSERT INTO recurring_tasks (key, class_name, schedule, arguments, queue_name, priority, is_static, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
                ON CONFLICT (key) DO UPDATE SET
                    class_name = EXCLUDED.class_name,
                    schedule = EXCLUDED.schedule,
                    arguments = EXCLUDED.arguments,
                    queue_name = EXCLUDED.queue_name,
                    priority = EXCLUDED.priority,
                    is_static = EXCLUDED.is_static,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&task.key)
            .bind(&task.class_name)
            .bind(&task.schedule)
            .bind(Json(&task.arguments))
            .bind(&task.queue_name)
            .bind(task.priority)
            .bind(task.is_static)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn recurring_tasks(&mut self) -> Result<Vec<RecurringTask>> {
        let rows: Vec<RecurringTaskRow> = sqlx::query_as(
            r#"
            SELECT key, class_name, schedule, arguments, queue_name, priority, is_static
            FROM recurring_tasks ORDER BY key
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_recurring_execution(
        &mut self,
        task_key: &str,
        run_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO recurring_executions (task_key, run_at)
            VALUES ($1, $2)
            ON CONFLICT (task_key, run_at) DO NOTHING
            "#,
        )
        .bind(task_key)
        .bind(run_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_recurring_execution_job(
        &mut self,
        task_key: &str,
        run_at: DateTime<Utc>,
        job_id: JobId,
    ) -> Result<()> {
        sqlx::query("UPDATE recurring_executions SET job_id = $3 WHERE task_key = $1 AND run_at = $2")
            .bind(task_key)
            .bind(run_at)
            .bind(job_id.0)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn recurring_executions(&mut self, task_key: &str) -> Result<Vec<RecurringExecution>> {
        let rows: Vec<RecurringExecutionRow> = sqlx::query_as(
            "SELECT task_key, run_at, job_id FROM recurring_executions WHERE task_key = $1 ORDER BY run_at",
        )
        .bind(task_key)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| RecurringExecution {
                task_key: r.task_key,
                run_at: r.run_at,
                job_id: r.job_id.map(JobId),
            })
            .collect())
    }
}
