//! Execution ledger rows.
//!
//! Every unfinished job sits in exactly one ledger: ready, scheduled, claimed,
//! blocked or failed. Moves between ledgers happen inside one store
//! transaction so the placement is never observed twice or not at all.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use super::job::{JobId, JobRecord};

/// Which ledger currently holds a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Ready,
    Scheduled,
    Claimed,
    Blocked,
    Failed,
    Finished,
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Placement::Ready => "ready",
            Placement::Scheduled => "scheduled",
            Placement::Claimed => "claimed",
            Placement::Blocked => "blocked",
            Placement::Failed => "failed",
            Placement::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// A job eligible to be claimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyExecution {
    pub job_id: JobId,
    pub queue_name: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl ReadyExecution {
    pub fn for_job(job: &JobRecord, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id,
            queue_name: job.queue_name.clone(),
            priority: job.priority,
            created_at: now,
        }
    }

    /// Claim order: lower priority value first, then lower job id.
    pub fn claim_order(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.job_id.cmp(&other.job_id))
    }
}

/// A job waiting for its run time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledExecution {
    pub job_id: JobId,
    pub queue_name: String,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledExecution {
    pub fn for_job(job: &JobRecord, scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id,
            queue_name: job.queue_name.clone(),
            priority: job.priority,
            scheduled_at,
            created_at: now,
        }
    }

    /// Dispatch order: earliest run time, then priority, then job id.
    pub fn dispatch_order(&self, other: &Self) -> Ordering {
        self.scheduled_at
            .cmp(&other.scheduled_at)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| self.job_id.cmp(&other.job_id))
    }
}

/// A job held by a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedExecution {
    pub job_id: JobId,
    pub process_id: String,
    pub created_at: DateTime<Utc>,
}

/// A job waiting for a concurrency slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedExecution {
    pub job_id: JobId,
    pub queue_name: String,
    pub priority: i32,
    pub concurrency_key: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl BlockedExecution {
    /// Returns `None` for jobs without a concurrency key.
    pub fn for_job(job: &JobRecord, now: DateTime<Utc>) -> Option<Self> {
        let key = job.concurrency_key.clone()?;
        Some(Self {
            job_id: job.id,
            queue_name: job.queue_name.clone(),
            priority: job.priority,
            concurrency_key: key,
            expires_at: job.concurrency_expires_at(now),
            created_at: now,
        })
    }

    /// Release order within one key: priority, then job id.
    pub fn release_order(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.job_id.cmp(&other.job_id))
    }
}

/// A job whose behaviour returned an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedExecution {
    pub job_id: JobId,
    pub error: String,
    pub created_at: DateTime<Utc>,
}

/// A concurrency semaphore. `value` counts held slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Semaphore {
    pub key: String,
    pub value: i32,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ready(id: i64, priority: i32) -> ReadyExecution {
        ReadyExecution {
            job_id: JobId(id),
            queue_name: "default".to_string(),
            priority,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_claim_order_prefers_priority_then_id() {
        let mut rows = vec![ready(3, 0), ready(1, 5), ready(2, 0)];
        rows.sort_by(|a, b| a.claim_order(b));
        let ids: Vec<i64> = rows.iter().map(|r| r.job_id.0).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_dispatch_order_prefers_earliest() {
        let now = Utc::now();
        let early = ScheduledExecution {
            job_id: JobId(9),
            queue_name: "default".to_string(),
            priority: 10,
            scheduled_at: now - Duration::seconds(10),
            created_at: now,
        };
        let late = ScheduledExecution {
            job_id: JobId(1),
            queue_name: "default".to_string(),
            priority: 0,
            scheduled_at: now,
            created_at: now,
        };
        assert_eq!(early.dispatch_order(&late), Ordering::Less);
    }

    #[test]
    fn test_placement_display() {
        assert_eq!(Placement::Blocked.to_string(), "blocked");
    }
}
