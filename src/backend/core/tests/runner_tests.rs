//! Runner lifecycle: modes, hooks, stop latency and maintenance resilience.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use keel_core::db::{SharedStore, Store, Transaction};
use keel_core::error::{KeelError, Result};
use keel_core::jobs::SemaphoreManager;
use keel_core::runtime::{ConcurrencyMaintenance, Role, RunMode, Runner, RunnerState};

// ============================================================================
// Test Utilities
// ============================================================================

type Journal = Arc<Mutex<Vec<&'static str>>>;

struct CountingRole {
    ticks: Arc<AtomicU64>,
    journal: Journal,
    interval: Duration,
    fail_ticks: bool,
    done_after: Option<u64>,
}

impl CountingRole {
    fn new(interval: Duration) -> Self {
        Self {
            ticks: Arc::new(AtomicU64::new(0)),
            journal: Arc::new(Mutex::new(Vec::new())),
            interval,
            fail_ticks: false,
            done_after: None,
        }
    }
}

#[async_trait]
impl Role for CountingRole {
    fn kind(&self) -> &'static str {
        "counting"
    }

    async fn tick(&self) -> Result<bool> {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        self.journal.lock().push("tick");
        if self.fail_ticks {
            return Err(KeelError::internal("tick exploded"));
        }
        Ok(false)
    }

    fn polling_interval(&self) -> Duration {
        self.interval
    }

    async fn all_work_completed(&self) -> Result<bool> {
        Ok(self
            .done_after
            .is_some_and(|n| self.ticks.load(Ordering::SeqCst) >= n))
    }
}

fn record(
    journal: &Journal,
    entry: &'static str,
) -> impl Fn() -> futures::future::Ready<Result<()>> + Send + Sync + 'static {
    let journal = Arc::clone(journal);
    move || {
        journal.lock().push(entry);
        futures::future::ready(Ok(()))
    }
}

/// A store whose transactions never open.
struct UnreachableStore;

#[async_trait]
impl Store for UnreachableStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Err(KeelError::new(
            keel_core::ErrorCode::DatabaseConnectionFailed,
            "database unreachable",
        ))
    }
}

// ============================================================================
// Modes
// ============================================================================

#[tokio::test]
async fn test_stop_interrupts_a_long_idle_sleep() {
    let role = CountingRole::new(Duration::from_secs(30));
    let ticks = Arc::clone(&role.ticks);
    let handle = Runner::new(role, CancellationToken::new())
        .start(RunMode::Async)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.state(), RunnerState::Running);
    assert_eq!(ticks.load(Ordering::SeqCst), 1);

    let started = Instant::now();
    handle.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn test_inline_mode_runs_until_work_is_completed() {
    let mut role = CountingRole::new(Duration::from_millis(5));
    role.done_after = Some(3);
    let ticks = Arc::clone(&role.ticks);

    let handle = Runner::new(role, CancellationToken::new())
        .start(RunMode::Inline)
        .await
        .unwrap();

    assert_eq!(ticks.load(Ordering::SeqCst), 3);
    assert_eq!(handle.state(), RunnerState::Stopped);
}

#[tokio::test]
async fn test_supervised_mode_stops_when_supervisor_is_gone() {
    let role = CountingRole::new(Duration::from_millis(5));
    let ticks = Arc::clone(&role.ticks);

    let handle = Runner::new(role, CancellationToken::new())
        .start(RunMode::Supervised {
            supervisor_pid: Some(u32::MAX),
        })
        .await
        .unwrap();

    assert_eq!(ticks.load(Ordering::SeqCst), 0);
    assert_eq!(handle.state(), RunnerState::Stopped);
}

#[tokio::test]
async fn test_parent_token_stops_child_runners() {
    let shutdown = CancellationToken::new();
    let first = Runner::new(CountingRole::new(Duration::from_secs(30)), shutdown.child_token())
        .start(RunMode::Async)
        .await
        .unwrap();
    let second = Runner::new(CountingRole::new(Duration::from_secs(30)), shutdown.child_token())
        .start(RunMode::Async)
        .await
        .unwrap();

    shutdown.cancel();
    first.wait().await.unwrap();
    second.wait().await.unwrap();
}

// ============================================================================
// Hooks
// ============================================================================

#[tokio::test]
async fn test_hooks_run_in_lifecycle_order() {
    let mut role = CountingRole::new(Duration::from_millis(5));
    role.done_after = Some(1);
    let journal = Arc::clone(&role.journal);

    Runner::new(role, CancellationToken::new())
        .on_start(record(&journal, "start"))
        .before_tick(record(&journal, "before"))
        .after_tick(record(&journal, "after"))
        .on_shutdown(record(&journal, "shutdown"))
        .start(RunMode::Inline)
        .await
        .unwrap();

    assert_eq!(
        *journal.lock(),
        vec!["start", "before", "tick", "after", "shutdown"]
    );
}

#[tokio::test]
async fn test_failing_start_hook_aborts_boot() {
    let role = CountingRole::new(Duration::from_millis(5));
    let ticks = Arc::clone(&role.ticks);
    let shut_down = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shut_down);

    let result = Runner::new(role, CancellationToken::new())
        .on_start(|| async { Err(KeelError::internal("no database")) })
        .on_shutdown(move || {
            flag.store(true, Ordering::SeqCst);
            async { Ok(()) }
        })
        .start(RunMode::Inline)
        .await;

    assert!(result.is_err());
    assert_eq!(ticks.load(Ordering::SeqCst), 0);
    assert!(!shut_down.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_tick_errors_do_not_stop_the_loop() {
    let mut role = CountingRole::new(Duration::from_millis(5));
    role.fail_ticks = true;
    let ticks = Arc::clone(&role.ticks);

    let handle = Runner::new(role, CancellationToken::new())
        .start(RunMode::Async)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(ticks.load(Ordering::SeqCst) >= 3);
    assert_eq!(handle.state(), RunnerState::Running);
    handle.stop().await.unwrap();
}

// ============================================================================
// Concurrency Maintenance
// ============================================================================

#[tokio::test]
async fn test_maintenance_keeps_running_after_errors() {
    let store: SharedStore = Arc::new(UnreachableStore);
    let reported = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&reported);

    let maintenance = ConcurrencyMaintenance::new(
        SemaphoreManager::new(store),
        Duration::from_millis(20),
        100,
    )
    .with_error_handler(move |e| {
        assert_eq!(e.code(), keel_core::ErrorCode::DatabaseConnectionFailed);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let token = CancellationToken::new();
    maintenance.start(&token);
    tokio::time::sleep(Duration::from_millis(110)).await;

    assert!(maintenance.is_running());
    assert!(maintenance.errors() >= 3);
    assert_eq!(maintenance.errors(), reported.load(Ordering::SeqCst));

    maintenance.stop().await;
    assert!(!maintenance.is_running());
}
