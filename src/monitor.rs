//! Periodic activity and reconciliation sweeps
//!
//! Two jobs on one interval: tear down workspaces idle past the
//! configured timeout, and resynchronize the registry against engine-side
//! pruning and out-of-band container removal.

use crate::lifecycle::{LifecycleManager, TeardownScope};
use crate::registry::WorkspaceState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Drives the idle and reconciliation sweeps.
pub struct ActivityMonitor {
    lifecycle: Arc<LifecycleManager>,
    idle_timeout: Duration,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl ActivityMonitor {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        idle_timeout: Duration,
        interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            lifecycle,
            idle_timeout,
            interval,
            shutdown_rx,
        }
    }

    /// Run until shutdown is signalled.
    pub async fn run(mut self) {
        info!(
            interval_secs = self.interval.as_secs(),
            idle_timeout_secs = self.idle_timeout.as_secs(),
            "Activity monitor started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep().await;
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Activity monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One full pass: idle sweep, then the prune/reconciliation sweep.
    pub async fn sweep(&self) {
        self.idle_sweep().await;
        self.lifecycle.sweep_pruned().await;
    }

    /// Tear down every routable workspace whose last activity is older
    /// than the idle timeout. Teardown is time-based only; open
    /// connections keep a workspace alive solely by refreshing its
    /// activity timestamp when they close.
    async fn idle_sweep(&self) {
        let stale: Vec<(String, Duration)> = self
            .lifecycle
            .registry()
            .list_by_state(&[WorkspaceState::Ready, WorkspaceState::Idle])
            .into_iter()
            .filter_map(|workspace| {
                let idle_for = workspace.last_active.elapsed();
                (idle_for > self.idle_timeout).then_some((workspace.user, idle_for))
            })
            .collect();

        for (user, idle_for) in stale {
            info!(
                user,
                idle_secs = idle_for.as_secs(),
                "Workspace idle timeout reached"
            );
            self.lifecycle
                .registry()
                .set_state(&user, WorkspaceState::Idle);
            self.lifecycle
                .teardown(TeardownScope::Single(user))
                .await;
        }
    }
}
