#![allow(clippy::result_large_err)]
//! # Keel Core
//!
//! Execution core of a database-backed job queue.
//!
//! ## Architecture
//!
//! - **Ledger**: one table per placement (ready, scheduled, claimed, blocked,
//!   failed); every move between them is a single store transaction
//! - **Claim**: skip-locked selection hands each ready job to exactly one worker
//! - **Dispatch**: due scheduled jobs become ready, or blocked when their
//!   concurrency key is saturated
//! - **Semaphores**: per-key slot counters with expiry, plus the maintenance
//!   pass that reclaims expired slots and releases blocked jobs
//! - **Recurring tasks**: cron schedules with one job per occurrence
//! - **Runtime**: a shared runner lifecycle for dispatcher, worker and
//!   scheduler roles, with signal-driven graceful shutdown
//! - **Telemetry**: structured logging and counters

pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod runtime;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, KeelError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::db::{MemoryStore, PgStore, SharedStore, Store, Transaction};
    pub use crate::error::{ErrorCode, ErrorContext, KeelError, Result};
    pub use crate::jobs::{
        ClaimCoordinator, ConcurrencyLimit, DispatchCoordinator, Job, JobContext, JobError,
        JobId, JobQueue, JobRegistry, JobResult, NewJob, Placement, QueueSelector,
        RecurringTask, SemaphoreManager,
    };
    pub use crate::runtime::{
        Dispatcher, Launcher, RecurringScheduler, Role, RunMode, Runner, RunnerState, Worker,
    };
}
