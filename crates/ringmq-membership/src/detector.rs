//! Background failure detector.
//!
//! The detector ticks at the heartbeat interval and asks the
//! [`MembershipTable`] to age every node: missed heartbeats turn ACTIVE
//! nodes SUSPECT, and SUSPECT nodes that stay silent past the dead timeout
//! are declared DOWN and evicted (bumping the ring version if they were
//! servers).
//!
//! Heartbeats themselves are emitted by each node runtime; the detector only
//! consumes their absence.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::table::MembershipTable;

/// Handle to a running failure detector.
pub struct DetectorHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DetectorHandle {
    /// Ask the detector to stop after its current tick.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Abort the background task.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Check whether the background task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Start the failure detector for `table` and return a handle.
///
/// Must be called from within a tokio runtime.
pub fn start(table: Arc<MembershipTable>) -> DetectorHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(table.config().heartbeat_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("failure detector started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let evicted = table.check_timeouts(Instant::now());
                    if !evicted.is_empty() {
                        debug!(count = evicted.len(), version = %table.version(), "evicted unresponsive nodes");
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("failure detector shutting down");
                    break;
                }
            }
        }
    });

    DetectorHandle { shutdown_tx, task }
}
