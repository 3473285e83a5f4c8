//! Job records and job behaviours.
//!
//! - **JobRecord**: the persisted job row (identity, queue, priority, opaque
//!   arguments, optional concurrency key)
//! - **NewJob**: what a caller submits
//! - **Job trait**: the behaviour a worker runs for a class name
//! - **JobContext**: what a behaviour sees while it runs

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

use crate::error::KeelError;

/// Queue used when a job does not name one.
pub const DEFAULT_QUEUE: &str = "default";
/// Priority used when a job does not set one. Lower runs first.
pub const DEFAULT_PRIORITY: i32 = 0;
/// How long a concurrency slot is held before maintenance may reclaim it.
pub const DEFAULT_CONCURRENCY_DURATION_SECS: i64 = 180;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Identifier of a persisted job. Assigned by the store in increasing order,
/// which makes it the stable tie-break for equal priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Concurrency Limits
// ═══════════════════════════════════════════════════════════════════════════════

/// Limits how many jobs sharing `key` may be ready or running at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyLimit {
    /// Semaphore key shared by the limited jobs
    pub key: String,
    /// Maximum simultaneous holders
    pub limit: i32,
    /// How long an acquired slot stays valid without being released
    pub duration_secs: i64,
}

impl ConcurrencyLimit {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            limit: 1,
            duration_secs: DEFAULT_CONCURRENCY_DURATION_SECS,
        }
    }

    pub fn with_limit(mut self, limit: i32) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_duration_secs(mut self, secs: i64) -> Self {
        self.duration_secs = secs;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Records
// ═══════════════════════════════════════════════════════════════════════════════

/// A job as submitted, before the store assigns an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub class_name: String,
    pub queue_name: String,
    pub priority: i32,
    pub arguments: serde_json::Value,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub concurrency: Option<ConcurrencyLimit>,
}

impl NewJob {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            queue_name: DEFAULT_QUEUE.to_string(),
            priority: DEFAULT_PRIORITY,
            arguments: serde_json::Value::Array(Vec::new()),
            scheduled_at: None,
            concurrency: None,
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue_name = queue.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_arguments(mut self, arguments: serde_json::Value) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn limited_by(mut self, concurrency: ConcurrencyLimit) -> Self {
        self.concurrency = Some(concurrency);
        self
    }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub class_name: String,
    pub queue_name: String,
    pub priority: i32,
    pub arguments: serde_json::Value,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub concurrency_key: Option<String>,
    pub concurrency_limit: i32,
    pub concurrency_duration_secs: i64,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// Whether the job's run time has arrived.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.map_or(true, |at| at <= now)
    }

    pub fn is_concurrency_limited(&self) -> bool {
        self.concurrency_key.is_some()
    }

    /// When a slot acquired at `now` stops being protected.
    pub fn concurrency_expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + ChronoDuration::seconds(self.concurrency_duration_secs)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error returned by a job behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Whether the failure was transient. Recorded only; failed jobs are not retried.
    pub retryable: bool,
    /// Optional error code
    pub code: Option<String>,
    /// Additional context
    pub context: Option<serde_json::Value>,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
            context: None,
        }
    }

    /// Create a new non-retryable (fatal) error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
            context: None,
        }
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Add context.
    pub fn with_context(mut self, context: impl Serialize) -> Self {
        self.context = serde_json::to_value(context).ok();
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<KeelError> for JobError {
    fn from(error: KeelError) -> Self {
        Self {
            message: error.user_message().to_string(),
            retryable: error.is_retryable(),
            code: Some(error.code().to_string()),
            context: None,
        }
    }
}

/// Result type for job execution.
pub type JobResult = std::result::Result<(), JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to a behaviour while it performs a job.
pub struct JobContext {
    /// The job being performed
    pub job: JobRecord,
    /// Identity of the claiming process
    pub process_id: String,
    cancellation: CancellationToken,
}

impl JobContext {
    pub fn new(job: JobRecord, process_id: impl Into<String>, cancellation: CancellationToken) -> Self {
        Self {
            job,
            process_id: process_id.into(),
            cancellation,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn arguments(&self) -> &serde_json::Value {
        &self.job.arguments
    }

    /// True once the worker has been asked to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Completes when the worker has been asked to stop.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn log_info(&self, message: &str) {
        tracing::info!(
            job_id = %self.job.id,
            class = %self.job.class_name,
            queue = %self.job.queue_name,
            message
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// The behaviour a worker runs for jobs of one class.
#[async_trait]
pub trait Job: Send + Sync {
    /// Class name stored on job rows and recurring tasks.
    fn name(&self) -> &'static str;

    /// Perform one job. Arguments are opaque to the queue.
    async fn perform(&self, ctx: &JobContext) -> JobResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(scheduled_at: Option<DateTime<Utc>>) -> JobRecord {
        JobRecord {
            id: JobId(1),
            class_name: "ReportJob".to_string(),
            queue_name: DEFAULT_QUEUE.to_string(),
            priority: 0,
            arguments: serde_json::json!([]),
            scheduled_at,
            concurrency_key: None,
            concurrency_limit: 1,
            concurrency_duration_secs: 60,
            finished_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_new_job_defaults() {
        let job = NewJob::new("ReportJob");
        assert_eq!(job.queue_name, "default");
        assert_eq!(job.priority, 0);
        assert!(job.concurrency.is_none());
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        assert!(record(None).is_due(now));
        assert!(record(Some(now)).is_due(now));
        assert!(!record(Some(now + ChronoDuration::seconds(5))).is_due(now));
    }

    #[test]
    fn test_concurrency_expiry() {
        let now = Utc::now();
        let job = record(None);
        assert_eq!(job.concurrency_expires_at(now), now + ChronoDuration::seconds(60));
    }

    #[test]
    fn test_job_error_display() {
        let error = JobError::retryable("upstream timed out").with_code("TIMEOUT");
        assert_eq!(error.to_string(), "upstream timed out (code: TIMEOUT)");
    }
}
