use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::prelude::*;
use crate::supervisor::Supervisor;

/// Process-wide "is shutting down" flag, set exactly once.
///
/// While set, backend exits are never reported as crashes.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the shutdown sequence, returning `true` only for the first caller.
    pub fn begin(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Stop the backend as part of quitting the application.
///
/// Returns `false` without doing anything when a shutdown sequence already ran, so that every
/// quit trigger can call this unconditionally.
pub async fn graceful_shutdown(supervisor: &Supervisor) -> bool {
    if !supervisor.shutdown_flag().begin() {
        debug!("Shutdown already in progress");
        return false;
    }

    info!("Shutting down, stopping the backend...");
    supervisor.kill().await;
    info!("Backend stopped");
    true
}

/// Wait for SIGINT, or SIGTERM on unix.
pub async fn wait_for_termination_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install the SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for SIGINT")?;
                Ok("SIGINT")
            }
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        Ok("Ctrl-C")
    }
}
