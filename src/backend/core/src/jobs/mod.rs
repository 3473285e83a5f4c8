//! Job ledgers and the coordinators that move jobs between them.
//!
//! # Architecture
//!
//! ```text
//!                 enqueue
//!                    │
//!         ┌──────────┴───────────┐
//!         ▼                      ▼
//!   ┌───────────┐  dispatch  ┌─────────┐   claim   ┌─────────┐  finish   ┌──────────┐
//!   │ Scheduled │──────────▶│  Ready  │─────────▶│ Claimed │─────────▶│ Finished │
//!   └───────────┘     │      └─────────┘           └─────────┘    │      └──────────┘
//!                     │           ▲                     │         │ fail ┌──────────┐
//!                     │   unblock │                     │         └────▶│  Failed  │
//!                     ▼           │                     │               └──────────┘
//!               ┌─────────┐       │      release slot   │
//!               │ Blocked │───────┘◀────────────────────┘
//!               └─────────┘
//! ```
//!
//! Every arrow is one store transaction.
//!
//! # Usage
//!
//! ```rust,ignore
//! use keel_core::db::MemoryStore;
//! use keel_core::jobs::{ClaimCoordinator, JobQueue, NewJob, QueueSelector};
//!
//! let store: SharedStore = Arc::new(MemoryStore::new());
//! let queue = JobQueue::new(store.clone());
//! queue.enqueue(NewJob::new("ReportJob").on_queue("reports")).await?;
//!
//! let claims = ClaimCoordinator::new(store)
//!     .claim(&QueueSelector::parse("reports*"), 10, "worker-1")
//!     .await?;
//! ```

pub mod claim;
pub mod dispatch;
pub mod execution;
pub mod job;
pub mod queue;
pub mod queue_selector;
pub mod recurring;
pub mod registry;
pub mod semaphore;

pub use claim::ClaimCoordinator;
pub use dispatch::{DispatchCoordinator, DispatchOutcome};
pub use execution::{
    BlockedExecution, ClaimedExecution, FailedExecution, Placement, ReadyExecution,
    ScheduledExecution, Semaphore,
};
pub use job::{
    ConcurrencyLimit, Job, JobContext, JobError, JobId, JobRecord, JobResult, NewJob,
    DEFAULT_PRIORITY, DEFAULT_QUEUE,
};
pub use queue::JobQueue;
pub use queue_selector::{QueueScope, QueueSelector};
pub use recurring::{EnqueueOutcome, RecurringExecution, RecurringTask};
pub use registry::JobRegistry;
pub use semaphore::SemaphoreManager;
