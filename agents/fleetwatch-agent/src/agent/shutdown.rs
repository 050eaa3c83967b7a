//! Shutdown Coordinator
//!
//! Turns SIGINT/SIGTERM into one shared [`CancellationToken`] that every wait
//! in the agent races against, and tracks the spawned tasks so shutdown can
//! wait for them to return.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::connection::client::Backend;

/// Longest wait for tracked tasks once shutdown has begun
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(15);

/// Lets a component ask for a re-exec after an orderly shutdown
#[derive(Clone)]
pub struct RestartHandle {
    requested: Arc<AtomicBool>,
    token: CancellationToken,
}

impl RestartHandle {
    pub fn request_restart(&self) {
        info!("Restart requested");
        self.requested.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

pub struct ShutdownCoordinator {
    token: CancellationToken,
    tracker: TaskTracker,
    restart: Arc<AtomicBool>,
    grace_period: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::with_grace_period(DEFAULT_GRACE_PERIOD)
    }

    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            restart: Arc::new(AtomicBool::new(false)),
            grace_period,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    /// Spawn a task that shutdown will wait for
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn restart_handle(&self) -> RestartHandle {
        RestartHandle {
            requested: self.restart.clone(),
            token: self.token.clone(),
        }
    }

    pub fn request_restart(&self) {
        self.restart_handle().request_restart();
    }

    pub fn restart_requested(&self) -> bool {
        self.restart.load(Ordering::SeqCst)
    }

    /// Resolve on SIGINT/SIGTERM, or once shutdown was triggered elsewhere
    pub async fn wait_for_signal(&self) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            signal = termination_signal() => {
                info!(signal, "Shutdown signal received");
                self.trigger();
            }
        }
    }

    /// Stop everything: no new tasks, cancel, close the transport, then wait
    /// for tracked tasks up to the grace period.
    pub async fn shutdown(&self, backend: &dyn Backend) {
        self.tracker.close();
        self.trigger();
        backend.close_websocket().await;

        match tokio::time::timeout(self.grace_period, self.tracker.wait()).await {
            Ok(()) => info!("All tasks stopped"),
            Err(_) => warn!(
                remaining = self.tracker.len(),
                grace_period = ?self.grace_period,
                "Tasks still running after grace period"
            ),
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn termination_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, listening for SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "ctrl-c"
}
