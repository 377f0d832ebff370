//! Process-wide fabric context.
//!
//! A [`Fabric`] is created explicitly, handed to every
//! [`NodeRuntime`](crate::NodeRuntime) that takes part in it, and torn down
//! explicitly. Tests build several fabrics side by side, each with its own simulated
//! servers and slaves.

use std::sync::{Arc, Mutex, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

use ringmq_membership::{DetectorHandle, MembershipConfig, MembershipTable, detector};
use ringmq_net::{MemoryTransport, Transport};
use ringmq_queue::QueueRegistry;
use tracing::info;

use crate::config::NodeConfig;
use crate::error::NodeError;

/// Shared context: membership table, transport and failure detector.
pub struct Fabric {
    membership: Arc<MembershipTable>,
    transport: Arc<dyn Transport>,
    detector: Mutex<Option<DetectorHandle>>,
    registries: Mutex<Vec<Weak<QueueRegistry>>>,
    shut_down: AtomicBool,
}

impl Fabric {
    /// Create a fabric over an in-process transport and start its failure
    /// detector.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: MembershipConfig) -> Arc<Self> {
        Self::with_transport(config, Arc::new(MemoryTransport::new()))
    }

    /// Create a fabric with the membership timings of a node config file.
    pub fn from_config(config: &NodeConfig) -> Arc<Self> {
        Self::new(config.membership_config())
    }

    /// Create a fabric over a caller-supplied transport.
    pub fn with_transport(config: MembershipConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let membership = MembershipTable::new(config);
        let detector = detector::start(membership.clone());
        info!(config = ?membership.config(), "fabric started");
        Arc::new(Self {
            membership,
            transport,
            detector: Mutex::new(Some(detector)),
            registries: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// The membership table shared by every runtime.
    pub fn membership(&self) -> &Arc<MembershipTable> {
        &self.membership
    }

    /// The transport shared by every runtime.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Check that a node config agrees with the settings this fabric owns.
    ///
    /// `[membership]` timings (except `join_timeout_ms`) and
    /// `[ring] vnodes_per_node` drive the shared failure detector and ring,
    /// so every node on the fabric must use the fabric's values.
    pub fn check_config(&self, config: &NodeConfig) -> Result<(), NodeError> {
        let wanted = config.membership_config();
        let actual = self.membership.config();
        if wanted == *actual {
            return Ok(());
        }
        Err(NodeError::InitFailed(format!(
            "config for {} disagrees with the fabric: \
             heartbeat {:?} vs {:?}, suspect after {} vs {} misses, \
             dead timeout {:?} vs {:?}, vnodes {} vs {}",
            config.node.name,
            wanted.heartbeat_interval,
            actual.heartbeat_interval,
            wanted.suspect_after_misses,
            actual.suspect_after_misses,
            wanted.dead_timeout,
            actual.dead_timeout,
            wanted.vnodes_per_node,
            actual.vnodes_per_node,
        )))
    }

    /// Whether [`Fabric::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Whether the failure detector task is alive.
    pub fn detector_running(&self) -> bool {
        self.detector
            .lock()
            .expect("detector lock poisoned")
            .as_ref()
            .is_some_and(|d| d.is_running())
    }

    /// Track a runtime's registry so shutdown can wake its waiters.
    pub(crate) fn register(&self, registry: &Arc<QueueRegistry>) {
        let mut registries = self.registries.lock().expect("registry list lock poisoned");
        registries.retain(|r| r.strong_count() > 0);
        registries.push(Arc::downgrade(registry));
    }

    /// Tear the fabric down: stop the failure detector and close every
    /// registered queue, waking blocked receivers with CLOSED.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(detector) = self.detector.lock().expect("detector lock poisoned").take() {
            detector.stop();
        }
        let registries: Vec<Arc<QueueRegistry>> = self
            .registries
            .lock()
            .expect("registry list lock poisoned")
            .drain(..)
            .filter_map(|r| r.upgrade())
            .collect();
        for registry in &registries {
            registry.shutdown();
        }
        info!(runtimes = registries.len(), "fabric shut down");
    }
}

impl Drop for Fabric {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.detector.lock()
            && let Some(detector) = slot.take()
        {
            detector.abort();
        }
    }
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fabric")
            .field("membership", &self.membership)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}
