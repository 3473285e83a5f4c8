//! Process-wide signal handling.
//!
//! [`install`] registers the listener once per process and returns the
//! process shutdown token. Every runner's token is a child of it.
//!
//! - **SIGINT / SIGTERM**: cancel the token; loops stop after their current
//!   tick and sleeping loops wake immediately
//! - **SIGQUIT**: exit at once, skipping shutdown hooks

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{ErrorCode, KeelError, Result};

static SHUTDOWN: Mutex<Option<CancellationToken>> = parking_lot::const_mutex(None);

/// Exit status used when SIGQUIT forces the process down.
pub const QUIT_EXIT_CODE: i32 = 1;

/// Install the listener if it is not installed yet, and return the shutdown
/// token. Must be called inside a tokio runtime.
pub fn install() -> Result<CancellationToken> {
    let mut installed = SHUTDOWN.lock();
    if let Some(token) = installed.as_ref() {
        return Ok(token.clone());
    }

    let token = CancellationToken::new();
    listen(token.clone())?;
    *installed = Some(token.clone());
    Ok(token)
}

/// The shutdown token, if [`install`] has run.
pub fn shutdown_token() -> Option<CancellationToken> {
    SHUTDOWN.lock().clone()
}

fn handler_error(e: std::io::Error) -> KeelError {
    KeelError::new(ErrorCode::SignalHandlerFailed, "Failed to install signal handlers").with_source(e)
}

#[cfg(unix)]
fn listen(token: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).map_err(handler_error)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(handler_error)?;
    let mut sigquit = signal(SignalKind::quit()).map_err(handler_error)?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!(signal = "SIGINT", "Shutdown requested");
                    token.cancel();
                }
                _ = sigterm.recv() => {
                    info!(signal = "SIGTERM", "Shutdown requested");
                    token.cancel();
                }
                _ = sigquit.recv() => {
                    warn!(signal = "SIGQUIT", "Exiting immediately");
                    std::process::exit(QUIT_EXIT_CODE);
                }
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn listen(token: CancellationToken) -> Result<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                handler_error(e).log();
                return;
            }
            info!(signal = "ctrl-c", "Shutdown requested");
            token.cancel();
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let first = install().unwrap();
        let second = install().unwrap();

        let child = second.child_token();
        assert!(!child.is_cancelled());
        assert!(shutdown_token().is_some());

        // Same underlying token: cancelling one cancels the other's children.
        first.cancel();
        assert!(child.is_cancelled());
    }
}
