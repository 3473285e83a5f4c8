//! Metric names published by the execution core.
//!
//! Counters go through the `metrics` facade, so they are no-ops until the
//! embedding process installs a recorder.

use metrics::describe_counter;

pub const JOBS_ENQUEUED: &str = "keel_jobs_enqueued_total";
pub const JOBS_CLAIMED: &str = "keel_jobs_claimed_total";
pub const JOBS_DISPATCHED: &str = "keel_jobs_dispatched_total";
pub const JOBS_BLOCKED: &str = "keel_jobs_blocked_total";
pub const JOBS_UNBLOCKED: &str = "keel_jobs_unblocked_total";
pub const JOBS_FINISHED: &str = "keel_jobs_finished_total";
pub const JOBS_FAILED: &str = "keel_jobs_failed_total";
pub const JOBS_RELEASED: &str = "keel_jobs_released_total";
pub const SEMAPHORES_EXPIRED: &str = "keel_semaphores_expired_total";
pub const RECURRING_ENQUEUES: &str = "keel_recurring_enqueues_total";
pub const MAINTENANCE_ERRORS: &str = "keel_maintenance_errors_total";

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(JOBS_ENQUEUED, "Jobs submitted, labelled by initial placement");
    describe_counter!(JOBS_CLAIMED, "Ready executions moved to claimed by workers");
    describe_counter!(JOBS_DISPATCHED, "Scheduled executions that left the scheduled placement");
    describe_counter!(JOBS_BLOCKED, "Jobs denied a concurrency slot");
    describe_counter!(JOBS_UNBLOCKED, "Blocked executions released to ready");
    describe_counter!(JOBS_FINISHED, "Claimed executions that completed");
    describe_counter!(JOBS_FAILED, "Claimed executions that failed");
    describe_counter!(JOBS_RELEASED, "Claimed executions handed back to ready on shutdown");
    describe_counter!(SEMAPHORES_EXPIRED, "Expired semaphores deleted by maintenance");
    describe_counter!(RECURRING_ENQUEUES, "Recurring task occurrences, labelled by outcome");
    describe_counter!(MAINTENANCE_ERRORS, "Concurrency maintenance runs that raised an error");
}
