//! Structured shutdown coordination for the balancer's long-lived tasks.
//!
//! One watch channel carries the process-wide shutdown signal. It can be
//! fired from inside a managed task (the control surface's `quit`) or from
//! the process signal path, via a cloned [`ShutdownHandle`]; the accept loop
//! and every background task subscribe to the same channel. Draining waits
//! for managed tasks up to a timeout, then aborts whatever is left. Panics in
//! background tasks are surfaced as shutdown errors.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("A background task panicked during shutdown")]
    Panic(#[from] JoinError),
    #[error("Graceful shutdown timed out after {0:?}")]
    Timeout(Duration),
}

/// Fires the process-wide shutdown signal. Cheap to clone into any task that
/// may need to stop the balancer.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<()>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        // Send only fails with no receivers left, at which point everything
        // that could observe the signal is already gone.
        let _ = self.tx.send(());
    }
}

/// Owns the balancer's background tasks and the shutdown signal they watch.
pub struct ShutdownCoordinator {
    tasks: JoinSet<()>,
    shutdown_tx: watch::Sender<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(());
        Self { tasks: JoinSet::new(), shutdown_tx }
    }

    /// Spawns a task managed by the coordinator. If the coordinator is
    /// dropped, all managed tasks are immediately aborted.
    pub fn spawn_task<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Returns a new receiver for the shutdown signal. Each task should
    /// subscribe before the signal can fire.
    pub fn subscribe(&self) -> watch::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Returns a handle that fires the shutdown signal.
    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle { tx: self.shutdown_tx.clone() }
    }

    /// Immediately aborts all managed tasks without waiting for cleanup.
    pub fn abort_all(&mut self) {
        self.tasks.abort_all();
    }

    /// Fires the shutdown signal (idempotent if already fired) and waits for
    /// all managed tasks to finish, up to `timeout`. Consumes the
    /// coordinator.
    ///
    /// Returns `Ok(())` if every task finished in time; a panic or a timeout
    /// is reported as an error, and on timeout the stragglers are aborted.
    pub async fn graceful_shutdown(self, timeout: Duration) -> Result<(), ShutdownError> {
        let ShutdownCoordinator { mut tasks, shutdown_tx } = self;

        info!("Broadcasting shutdown signal to all {} background tasks...", tasks.len());
        let _ = shutdown_tx.send(());

        let join_all = async {
            while let Some(res) = tasks.join_next().await {
                res?;
            }
            Ok(())
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(Ok(())) => {
                info!("All background tasks completed gracefully.");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "A background task panicked during shutdown.");
                Err(ShutdownError::Panic(e))
            }
            Err(_) => {
                error!("Shutdown timeout of {:?} exceeded. Aborting remaining tasks.", timeout);
                tasks.abort_all();
                Err(ShutdownError::Timeout(timeout))
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
