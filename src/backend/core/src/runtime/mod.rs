//! Background roles and the lifecycle that drives them.
//!
//! ```text
//!   signals ──cancel──▶ shutdown token
//!                            │ child tokens
//!        ┌───────────────────┼────────────────────┐
//!        ▼                   ▼                    ▼
//!   Runner<Dispatcher>   Runner<Worker>   Runner<RecurringScheduler>
//!    tick: dispatch       tick: claim        timers: enqueue
//!    + maintenance        + perform
//! ```

pub mod dispatcher;
pub mod launcher;
pub mod maintenance;
pub mod process;
pub mod recurring;
pub mod runner;
pub mod signals;
pub mod worker;

pub use dispatcher::Dispatcher;
pub use launcher::Launcher;
pub use maintenance::ConcurrencyMaintenance;
pub use process::ProcessIdentity;
pub use recurring::RecurringScheduler;
pub use runner::{Role, RunMode, Runner, RunnerHandle, RunnerState};
pub use worker::{Worker, WorkerStats};
