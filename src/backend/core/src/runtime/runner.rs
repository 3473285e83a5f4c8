//! The lifecycle shared by every background role.
//!
//! A [`Runner`] boots a [`Role`], drives its polling loop and shuts it down:
//!
//! ```text
//! Booting ──on_start──▶ Running ──stop / supervisor gone / work done──▶ ShuttingDown ──on_shutdown──▶ Stopped
//!                          │ ▲
//!                          ▼ │ before_tick → tick → after_tick → (idle? sleep in slices)
//! ```
//!
//! Stop requests are cooperative. A tick that is under way finishes (and its
//! transactions commit or roll back) before the loop leaves `Running`.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{KeelError, Result};

/// Length of one idle sleep slice. Bounds how long a stop request can wait.
pub const SLEEP_SLICE: Duration = Duration::from_millis(100);

// ═══════════════════════════════════════════════════════════════════════════════
// Role
// ═══════════════════════════════════════════════════════════════════════════════

/// A background role driven by a [`Runner`].
#[async_trait]
pub trait Role: Send + Sync + 'static {
    /// Short name used in logs and process identities.
    fn kind(&self) -> &'static str;

    /// One unit of polling. Returns whether any work was done; idle ticks are
    /// followed by a sleep of [`Role::polling_interval`].
    async fn tick(&self) -> Result<bool>;

    fn polling_interval(&self) -> Duration;

    /// Delay before the first tick.
    fn initial_jitter(&self) -> Duration {
        Duration::ZERO
    }

    /// Stop condition for [`RunMode::Inline`].
    async fn all_work_completed(&self) -> Result<bool> {
        Ok(false)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Modes and States
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run the loop on its own task; `start` returns at once.
    Async,
    /// Run in place and stop when the supervising process goes away. `None`
    /// takes the parent process at boot as the supervisor.
    Supervised { supervisor_pid: Option<u32> },
    /// Run in place until the role reports all work completed.
    Inline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Booting,
    Running,
    ShuttingDown,
    Stopped,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Hooks
// ═══════════════════════════════════════════════════════════════════════════════

/// A lifecycle callback.
pub type Hook = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone, Default)]
struct Hooks {
    on_start: Vec<Hook>,
    before_tick: Vec<Hook>,
    after_tick: Vec<Hook>,
    on_shutdown: Vec<Hook>,
}

fn hook<F, Fut>(f: F) -> Hook
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Run hooks in order. The first failure stops the chain and is returned.
async fn run_hooks(hooks: &[Hook]) -> Result<()> {
    for hook in hooks {
        hook().await?;
    }
    Ok(())
}

/// Run every hook, logging failures.
async fn run_hooks_logged(hooks: &[Hook], phase: &'static str, kind: &'static str) {
    for hook in hooks {
        if let Err(e) = hook().await {
            warn!(role = kind, phase, error = %e, "Lifecycle hook failed");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Runner
// ═══════════════════════════════════════════════════════════════════════════════

/// Drives one [`Role`] through its lifecycle.
pub struct Runner<R: Role> {
    role: Arc<R>,
    hooks: Hooks,
    token: CancellationToken,
    state: watch::Sender<RunnerState>,
}

impl<R: Role> Runner<R> {
    /// `token` is usually a child of the process shutdown token.
    pub fn new(role: R, token: CancellationToken) -> Self {
        let (state, _) = watch::channel(RunnerState::Booting);
        Self {
            role: Arc::new(role),
            hooks: Hooks::default(),
            token,
            state,
        }
    }

    pub fn role(&self) -> Arc<R> {
        Arc::clone(&self.role)
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunnerState> {
        self.state.subscribe()
    }

    /// Runs before the loop starts. A failing start hook aborts the boot.
    pub fn on_start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.hooks.on_start.push(hook(f));
        self
    }

    pub fn before_tick<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.hooks.before_tick.push(hook(f));
        self
    }

    pub fn after_tick<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.hooks.after_tick.push(hook(f));
        self
    }

    /// Runs after the loop exits, before the state becomes `Stopped`.
    pub fn on_shutdown<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.hooks.on_shutdown.push(hook(f));
        self
    }

    /// Start the loop. In [`RunMode::Async`] this returns as soon as the loop
    /// is spawned; the other modes return once the loop has stopped.
    pub async fn start(self, mode: RunMode) -> Result<RunnerHandle> {
        let kind = self.role.kind();
        let token = self.token.clone();
        let state = self.state.subscribe();

        match mode {
            RunMode::Async => {
                let join = tokio::spawn(self.run(LoopExit::StopOnly));
                Ok(RunnerHandle {
                    kind,
                    token,
                    state,
                    join: Some(join),
                })
            }
            RunMode::Supervised { supervisor_pid } => {
                let supervisor = supervisor_pid.or_else(current_parent_pid);
                self.run(LoopExit::SupervisorGone(supervisor)).await?;
                Ok(RunnerHandle {
                    kind,
                    token,
                    state,
                    join: None,
                })
            }
            RunMode::Inline => {
                self.run(LoopExit::WorkCompleted).await?;
                Ok(RunnerHandle {
                    kind,
                    token,
                    state,
                    join: None,
                })
            }
        }
    }

    async fn run(self, exit: LoopExit) -> Result<()> {
        let kind = self.role.kind();

        if let Err(e) = run_hooks(&self.hooks.on_start).await {
            error!(role = kind, error = %e, "Failed to boot");
            self.state.send_replace(RunnerState::Stopped);
            return Err(e);
        }

        self.state.send_replace(RunnerState::Running);
        info!(role = kind, "Started");

        interruptible_sleep(self.role.initial_jitter(), &self.token).await;

        loop {
            if self.should_stop(&exit) {
                break;
            }

            run_hooks_logged(&self.hooks.before_tick, "before_tick", kind).await;
            let worked = match self.role.tick().await {
                Ok(worked) => worked,
                Err(e) => {
                    e.log();
                    false
                }
            };
            run_hooks_logged(&self.hooks.after_tick, "after_tick", kind).await;

            if matches!(exit, LoopExit::WorkCompleted) && self.work_completed().await {
                debug!(role = kind, "All work completed");
                break;
            }

            if !worked {
                interruptible_sleep(self.role.polling_interval(), &self.token).await;
            }
        }

        self.state.send_replace(RunnerState::ShuttingDown);
        info!(role = kind, "Shutting down");
        run_hooks_logged(&self.hooks.on_shutdown, "on_shutdown", kind).await;
        self.state.send_replace(RunnerState::Stopped);
        info!(role = kind, "Stopped");
        Ok(())
    }

    fn should_stop(&self, exit: &LoopExit) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        if let LoopExit::SupervisorGone(expected) = exit {
            if supervisor_went_away(*expected, current_parent_pid()) {
                warn!(role = self.role.kind(), "Supervisor went away, stopping");
                return true;
            }
        }
        false
    }

    async fn work_completed(&self) -> bool {
        match self.role.all_work_completed().await {
            Ok(done) => done,
            Err(e) => {
                e.log();
                false
            }
        }
    }
}

enum LoopExit {
    StopOnly,
    SupervisorGone(Option<u32>),
    WorkCompleted,
}

/// Whether the process supervising this one has changed or disappeared.
pub fn supervisor_went_away(expected: Option<u32>, current: Option<u32>) -> bool {
    match (expected, current) {
        (Some(expected), Some(current)) => expected != current,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

#[cfg(unix)]
fn current_parent_pid() -> Option<u32> {
    Some(std::os::unix::process::parent_id())
}

#[cfg(not(unix))]
fn current_parent_pid() -> Option<u32> {
    None
}

/// Sleep for `duration` in [`SLEEP_SLICE`] steps, returning early once
/// `token` is cancelled.
pub async fn interruptible_sleep(duration: Duration, token: &CancellationToken) {
    let deadline = Instant::now() + duration;
    loop {
        if token.is_cancelled() {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let slice = SLEEP_SLICE.min(deadline - now);
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(slice) => {}
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handle
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle to a started runner.
pub struct RunnerHandle {
    kind: &'static str,
    token: CancellationToken,
    state: watch::Receiver<RunnerState>,
    join: Option<JoinHandle<Result<()>>>,
}

impl RunnerHandle {
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    /// Ask the loop to stop without waiting for it.
    pub fn request_stop(&self) {
        self.token.cancel();
    }

    /// Ask the loop to stop and wait until it has fully terminated.
    pub async fn stop(self) -> Result<()> {
        self.token.cancel();
        self.wait().await
    }

    /// Wait for the loop to terminate on its own.
    pub async fn wait(self) -> Result<()> {
        match self.join {
            Some(join) => join.await.map_err(|e| {
                KeelError::internal(format!("{} runner task failed: {}", self.kind, e))
            })?,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supervisor_went_away() {
        assert!(!supervisor_went_away(Some(10), Some(10)));
        assert!(supervisor_went_away(Some(10), Some(1)));
        assert!(supervisor_went_away(Some(10), None));
        assert!(!supervisor_went_away(None, Some(1)));
    }

    #[tokio::test]
    async fn test_interruptible_sleep_returns_on_cancel() {
        let token = CancellationToken::new();
        let sleeper = {
            let token = token.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                interruptible_sleep(Duration::from_secs(30), &token).await;
                started.elapsed()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        let elapsed = sleeper.await.unwrap();
        assert!(elapsed < SLEEP_SLICE * 2);
    }
}
