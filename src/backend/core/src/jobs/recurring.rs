//! Cron-scheduled recurring tasks.
//!
//! A task enqueues one job per fire time. The `(task key, run_at)` pair is
//! recorded in the same transaction as the job, so schedulers racing on the
//! same occurrence produce one job between them; the losers see `skipped`.

use chrono::{DateTime, Utc};
use cron::Schedule;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::job::{JobId, NewJob, DEFAULT_PRIORITY, DEFAULT_QUEUE};
use super::queue::enqueue_in;
use super::registry::JobRegistry;
use crate::config::RecurringTaskConfig;
use crate::db::SharedStore;
use crate::error::{KeelError, Result};
use crate::telemetry::metrics::RECURRING_ENQUEUES;

// ═══════════════════════════════════════════════════════════════════════════════
// Task Definition
// ═══════════════════════════════════════════════════════════════════════════════

/// A recurring task definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringTask {
    /// Unique key
    pub key: String,
    /// Job class enqueued on each fire
    pub class_name: String,
    /// Cron expression, five or six fields
    pub schedule: String,
    /// Static arguments passed to every job
    pub arguments: Vec<serde_json::Value>,
    pub queue_name: Option<String>,
    pub priority: Option<i32>,
    /// Defined in configuration rather than added at runtime
    pub is_static: bool,
}

/// One recorded occurrence of a recurring task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringExecution {
    pub task_key: String,
    pub run_at: DateTime<Utc>,
    pub job_id: Option<JobId>,
}

/// What happened when a task tried to enqueue one occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueOutcome {
    pub task_key: String,
    pub run_at: DateTime<Utc>,
    pub job_id: Option<JobId>,
    /// The occurrence had already been enqueued elsewhere.
    pub skipped: bool,
    pub enqueue_error: Option<String>,
}

impl EnqueueOutcome {
    fn label(&self) -> &'static str {
        if self.skipped {
            "skipped"
        } else if self.enqueue_error.is_some() {
            "error"
        } else {
            "enqueued"
        }
    }
}

/// Expand a five-field expression to the six-field form with seconds.
fn normalize_schedule(schedule: &str) -> Option<String> {
    let trimmed = schedule.trim();
    if trimmed.starts_with('@') {
        return Some(trimmed.to_string());
    }
    match trimmed.split_whitespace().count() {
        5 => Some(format!("0 {}", trimmed)),
        6 | 7 => Some(trimmed.to_string()),
        _ => None,
    }
}

impl RecurringTask {
    pub fn new(
        key: impl Into<String>,
        class_name: impl Into<String>,
        schedule: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            class_name: class_name.into(),
            schedule: schedule.into(),
            arguments: Vec::new(),
            queue_name: None,
            priority: None,
            is_static: true,
        }
    }

    pub fn from_config(key: impl Into<String>, config: &RecurringTaskConfig) -> Self {
        Self {
            key: key.into(),
            class_name: config.class.clone(),
            schedule: config.schedule.clone(),
            arguments: config.args.clone(),
            queue_name: config.queue.clone(),
            priority: config.priority,
            is_static: true,
        }
    }

    pub fn with_arguments(mut self, arguments: Vec<serde_json::Value>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue_name = Some(queue.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Mark as added at runtime rather than from configuration.
    pub fn dynamic(mut self) -> Self {
        self.is_static = false;
        self
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Schedule
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn parsed_schedule(&self) -> Result<Schedule> {
        let expression = normalize_schedule(&self.schedule)
            .ok_or_else(|| KeelError::unsupported_schedule(&self.key, &self.schedule))?;
        Schedule::from_str(&expression).map_err(|e| {
            KeelError::unsupported_schedule(&self.key, &self.schedule).with_source(e)
        })
    }

    /// Reject unparsable schedules and classes `registry` cannot resolve.
    pub fn validate(&self, registry: &JobRegistry) -> Result<()> {
        self.parsed_schedule()?;
        if !registry.contains(&self.class_name) {
            return Err(KeelError::unknown_job_class(&self.class_name)
                .with_context("task_key", &self.key));
        }
        Ok(())
    }

    /// Next fire time strictly after `now`, in UTC.
    pub fn next_time_after(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.parsed_schedule()?
            .after(&now)
            .next()
            .ok_or_else(|| KeelError::unsupported_schedule(&self.key, &self.schedule))
    }

    pub fn next_time(&self) -> Result<DateTime<Utc>> {
        self.next_time_after(Utc::now())
    }

    /// Time until the next fire after `now`. Never negative.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Result<Duration> {
        let next = self.next_time_after(now)?;
        Ok(delay_until(next, now))
    }

    pub fn delay_from_now(&self) -> Result<Duration> {
        self.delay_from(Utc::now())
    }

    fn new_job(&self, at: DateTime<Utc>) -> NewJob {
        NewJob {
            class_name: self.class_name.clone(),
            queue_name: self
                .queue_name
                .clone()
                .unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            priority: self.priority.unwrap_or(DEFAULT_PRIORITY),
            arguments: serde_json::Value::Array(self.arguments.clone()),
            scheduled_at: Some(at),
            concurrency: None,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Enqueue
    // ═══════════════════════════════════════════════════════════════════════════

    /// Enqueue the occurrence at `at` unless it was already enqueued. Never
    /// fails: duplicates come back `skipped`, store errors as `enqueue_error`.
    #[instrument(skip(self, store), fields(task = %self.key))]
    pub async fn enqueue(&self, store: &SharedStore, at: DateTime<Utc>) -> EnqueueOutcome {
        let mut outcome = EnqueueOutcome {
            task_key: self.key.clone(),
            run_at: at,
            job_id: None,
            skipped: false,
            enqueue_error: None,
        };

        match self.enqueue_and_record(store, at).await {
            Ok(Some(job_id)) => outcome.job_id = Some(job_id),
            Ok(None) => outcome.skipped = true,
            Err(e) => outcome.enqueue_error = Some(e.to_string()),
        }

        counter!(RECURRING_ENQUEUES, "outcome" => outcome.label()).increment(1);
        match &outcome.enqueue_error {
            Some(error) => warn!(task = %self.key, run_at = %at, error = %error, "Recurring enqueue failed"),
            None => info!(
                task = %self.key,
                run_at = %at,
                job_id = ?outcome.job_id,
                skipped = outcome.skipped,
                "Recurring task enqueued"
            ),
        }
        outcome
    }

    async fn enqueue_and_record(&self, store: &SharedStore, at: DateTime<Utc>) -> Result<Option<JobId>> {
        let mut tx = store.begin().await?;

        if !tx.insert_recurring_execution(&self.key, at).await? {
            tx.rollback().await?;
            return Ok(None);
        }

        let (job, _) = enqueue_in(tx.as_mut(), &self.new_job(at), Utc::now()).await?;
        tx.set_recurring_execution_job(&self.key, at, job.id).await?;
        tx.commit().await?;
        Ok(Some(job.id))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Persistence
    // ═══════════════════════════════════════════════════════════════════════════

    /// Validate every task, then upsert them all by key. Nothing is written
    /// when any task is invalid.
    pub async fn create_or_update_all(
        store: &SharedStore,
        tasks: &[RecurringTask],
        registry: &JobRegistry,
    ) -> Result<()> {
        for task in tasks {
            task.validate(registry)?;
        }
        if tasks.is_empty() {
            return Ok(());
        }

        let mut tx = store.begin().await?;
        tx.upsert_recurring_tasks(tasks).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn all(store: &SharedStore) -> Result<Vec<RecurringTask>> {
        let mut tx = store.begin().await?;
        let tasks = tx.recurring_tasks().await?;
        tx.commit().await?;
        Ok(tasks)
    }
}

/// `at - now`, floored at zero.
pub fn delay_until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

impl fmt::Display for RecurringTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arguments: Vec<String> = self
            .arguments
            .iter()
            .map(|argument| argument.to_string())
            .collect();
        write!(
            f,
            "{}.perform({}) [ {} ]",
            self.class_name,
            arguments.join(", "),
            self.schedule
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_five_field_schedule_gets_seconds() {
        assert_eq!(normalize_schedule("*/5 * * * *").unwrap(), "0 */5 * * * *");
        assert_eq!(normalize_schedule("30 0 * * * *").unwrap(), "30 0 * * * *");
        assert!(normalize_schedule("* *").is_none());
    }

    #[test]
    fn test_next_time_is_strictly_after() {
        let task = RecurringTask::new("hourly", "ReportJob", "0 * * * *");
        let on_the_hour = Utc.with_ymd_and_hms(2024, 3, 10, 7, 0, 0).unwrap();

        let next = task.next_time_after(on_the_hour).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap());
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn test_delay_is_floored_at_zero() {
        let now = Utc::now();
        let past = now - chrono::Duration::seconds(30);
        assert_eq!(delay_until(past, now), Duration::ZERO);
        assert_eq!(
            delay_until(now + chrono::Duration::seconds(2), now),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_invalid_schedule_is_rejected() {
        let task = RecurringTask::new("broken", "ReportJob", "every now and then");
        let err = task.parsed_schedule().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::UnsupportedSchedule);
    }

    #[test]
    fn test_display() {
        let task = RecurringTask::new("cleanup", "CleanupJob", "0 3 * * *")
            .with_arguments(vec![serde_json::json!(42), serde_json::json!("logs")]);
        assert_eq!(task.to_string(), "CleanupJob.perform(42, \"logs\") [ 0 3 * * * ]");
    }
}
