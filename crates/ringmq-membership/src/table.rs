//! Membership table: node states and the ring derived from them.
//!
//! [`MembershipTable`] serializes every mutation through one exclusive lock
//! and publishes an immutable [`Snapshot`] after each change. Readers take
//! the latest snapshot from a watch channel and never wait on heartbeat
//! processing.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ringmq_ring::{Resolution, Ring};
use ringmq_types::{ClusterEvent, Node, NodeId, NodeState, Role, RingVersion};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::MembershipError;

/// Lower bound for [`MembershipConfig::heartbeat_interval`].
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

/// Failure detector and ring parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipConfig {
    /// Expected interval between heartbeats of a live node.
    pub heartbeat_interval: Duration,
    /// Consecutive missed intervals before an ACTIVE node becomes SUSPECT.
    pub suspect_after_misses: u32,
    /// How long a node may stay SUSPECT (or JOINING without a heartbeat)
    /// before it is declared DOWN and evicted.
    pub dead_timeout: Duration,
    /// Vnodes per server on the ring.
    pub vnodes_per_node: u16,
}

impl MembershipConfig {
    /// Create a config suitable for fast test execution.
    pub fn test_config() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            suspect_after_misses: 3,
            dead_timeout: Duration::from_millis(300),
            vnodes_per_node: 64,
        }
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            suspect_after_misses: 3,
            dead_timeout: Duration::from_secs(5),
            vnodes_per_node: 64,
        }
    }
}

/// Immutable view of the membership table at one ring version.
#[derive(Debug, Clone)]
pub struct Snapshot {
    nodes: BTreeMap<NodeId, Node>,
    ring: Arc<Ring>,
}

impl Snapshot {
    /// Ring version of this view.
    pub fn version(&self) -> RingVersion {
        self.ring.version()
    }

    /// The ring built from the routable servers.
    pub fn ring(&self) -> &Arc<Ring> {
        &self.ring
    }

    /// Route a key on this view's ring.
    pub fn resolve(&self, key: &[u8], replica_count: usize) -> Resolution {
        self.ring.resolve(key, replica_count)
    }

    /// Look up one node.
    pub fn node(&self, node_id: &NodeId) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    /// State of one node, if it is a member.
    pub fn state_of(&self, node_id: &NodeId) -> Option<NodeState> {
        self.nodes.get(node_id).map(|n| n.state)
    }

    /// All members in ascending ID order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Servers that own slots on the ring, in ascending ID order.
    pub fn routable_servers(&self) -> Vec<NodeId> {
        self.ring.node_ids()
    }

    /// Slaves currently in the ACTIVE state.
    pub fn active_slaves(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.role == Role::Slave && n.state == NodeState::Active)
            .map(|n| n.node_id)
            .collect()
    }

    /// Number of members in any state.
    pub fn member_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Failure-detector bookkeeping for one node.
#[derive(Debug, Clone, Copy)]
struct Liveness {
    last_heartbeat: Instant,
    suspect_since: Option<Instant>,
}

impl Liveness {
    fn fresh(now: Instant) -> Self {
        Self {
            last_heartbeat: now,
            suspect_since: None,
        }
    }
}

/// Mutable state guarded by the table lock.
struct TableState {
    nodes: BTreeMap<NodeId, Node>,
    liveness: HashMap<NodeId, Liveness>,
    ring: Arc<Ring>,
}

/// Process-wide membership table shared by every runtime on a fabric.
///
/// Holds every known node, the ring over routable servers, a watch channel
/// carrying the latest [`Snapshot`], and a broadcast channel of
/// [`ClusterEvent`]s.
pub struct MembershipTable {
    state: Mutex<TableState>,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
    event_tx: broadcast::Sender<ClusterEvent>,
    config: MembershipConfig,
}

impl MembershipTable {
    /// Create an empty table.
    ///
    /// A zero heartbeat interval, miss count or vnode count is raised to the
    /// smallest usable value.
    pub fn new(mut config: MembershipConfig) -> Arc<Self> {
        let requested = config.clone();
        config.heartbeat_interval = config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);
        config.suspect_after_misses = config.suspect_after_misses.max(1);
        config.vnodes_per_node = config.vnodes_per_node.max(1);
        if config != requested {
            warn!(?requested, effective = ?config, "membership config clamped");
        }

        let ring = Arc::new(Ring::new(config.vnodes_per_node));
        let snapshot = Arc::new(Snapshot {
            nodes: BTreeMap::new(),
            ring: ring.clone(),
        });
        let (snapshot_tx, _) = watch::channel(snapshot);
        let (event_tx, _) = broadcast::channel(256);

        Arc::new(Self {
            state: Mutex::new(TableState {
                nodes: BTreeMap::new(),
                liveness: HashMap::new(),
                ring,
            }),
            snapshot_tx,
            event_tx,
            config,
        })
    }

    /// Return the table's configuration.
    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    /// Latest published snapshot. Never blocks on the table lock.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Current ring version.
    pub fn version(&self) -> RingVersion {
        self.snapshot_tx.borrow().version()
    }

    /// Read-only subscription to snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Subscribe to membership events.
    pub fn events(&self) -> broadcast::Receiver<ClusterEvent> {
        self.event_tx.subscribe()
    }

    /// Admit a node as JOINING.
    ///
    /// A node that is already a member is re-admitted: its generation is
    /// bumped and it leaves the ring until its next heartbeat. Returns the
    /// node as stored.
    pub fn announce(&self, mut node: Node) -> Node {
        let mut state = self.lock();
        let node_id = node.node_id;

        if let Some(previous) = state.nodes.get(&node_id) {
            node.generation = node.generation.max(previous.generation + 1);
        }
        let changed = Arc::make_mut(&mut state.ring).remove_node(&node_id);
        node.state = NodeState::Joining;
        node.ring_version = state.ring.version();

        state.nodes.insert(node_id, node.clone());
        state
            .liveness
            .insert(node_id, Liveness::fresh(Instant::now()));

        info!(%node_id, name = %node.name, role = %node.role, generation = node.generation, "node announced");
        self.publish(&state);
        self.emit(ClusterEvent::NodeJoined(node.clone()));
        if changed {
            self.emit(ClusterEvent::RingChanged(state.ring.version()));
        }
        node
    }

    /// Record a heartbeat and acknowledge it.
    ///
    /// JOINING and SUSPECT nodes become ACTIVE; a server becoming ACTIVE
    /// joins the ring. Fails with [`MembershipError::UnknownNode`] if the
    /// node was evicted, which tells it its session is gone.
    pub fn heartbeat(&self, node_id: &NodeId) -> Result<NodeState, MembershipError> {
        let mut state = self.lock();
        let now = Instant::now();

        let (role, previous) = match state.nodes.get(node_id) {
            Some(node) => (node.role, node.state),
            None => return Err(MembershipError::UnknownNode(*node_id)),
        };

        match previous {
            NodeState::Leaving => return Err(MembershipError::Leaving(*node_id)),
            NodeState::Down => return Err(MembershipError::UnknownNode(*node_id)),
            NodeState::Active => {
                state.liveness.insert(*node_id, Liveness::fresh(now));
                return Ok(NodeState::Active);
            }
            NodeState::Joining | NodeState::Suspect => {}
        }

        state.liveness.insert(*node_id, Liveness::fresh(now));
        let ring_changed = role == Role::Server && Arc::make_mut(&mut state.ring).add_node(*node_id);
        let version = state.ring.version();
        if let Some(node) = state.nodes.get_mut(node_id) {
            node.state = NodeState::Active;
            node.ring_version = version;
        }

        if previous == NodeState::Suspect {
            info!(%node_id, "node recovered from suspect to active");
        } else {
            info!(%node_id, %version, "node is now active");
        }
        self.publish(&state);
        self.emit(ClusterEvent::NodeActive(*node_id));
        if ring_changed {
            self.emit(ClusterEvent::RingChanged(version));
        }
        Ok(NodeState::Active)
    }

    /// Move an ACTIVE node to SUSPECT.
    ///
    /// Suspect servers keep their ring slots; flapping is absorbed until the
    /// dead timeout evicts them.
    pub fn mark_suspect(&self, node_id: &NodeId) -> Result<(), MembershipError> {
        let mut state = self.lock();
        let now = Instant::now();
        self.suspect_locked(&mut state, node_id, now)?;
        self.publish(&state);
        Ok(())
    }

    /// Remove a node from the table and the ring.
    ///
    /// A node that was DOWN is reported as [`ClusterEvent::NodeDown`], any
    /// other as [`ClusterEvent::NodeLeft`].
    pub fn evict(&self, node_id: &NodeId) -> Result<Node, MembershipError> {
        let mut state = self.lock();
        let node = self.evict_locked(&mut state, node_id)?;
        self.publish(&state);
        Ok(node)
    }

    /// Graceful shutdown: ACTIVE → LEAVING → evicted.
    pub fn leave(&self, node_id: &NodeId) -> Result<Node, MembershipError> {
        let mut state = self.lock();
        let version = state.ring.version();
        match state.nodes.get_mut(node_id) {
            Some(node) => {
                node.state = NodeState::Leaving;
                node.ring_version = version;
            }
            None => return Err(MembershipError::UnknownNode(*node_id)),
        }
        info!(%node_id, "node leaving");
        let node = self.evict_locked(&mut state, node_id)?;
        self.publish(&state);
        Ok(node)
    }

    /// Advance the failure detector to `now`.
    ///
    /// ACTIVE nodes that missed `suspect_after_misses` intervals become
    /// SUSPECT; SUSPECT nodes (and JOINING nodes that never heartbeated)
    /// silent for `dead_timeout` become DOWN and are evicted. Returns the
    /// evicted node IDs.
    pub fn check_timeouts(&self, now: Instant) -> Vec<NodeId> {
        let mut state = self.lock();
        let interval = self.config.heartbeat_interval;

        let mut newly_suspect = Vec::new();
        let mut newly_dead = Vec::new();

        for (node_id, node) in &state.nodes {
            let Some(live) = state.liveness.get(node_id) else {
                continue;
            };
            let silent = now.saturating_duration_since(live.last_heartbeat);
            let missed = (silent.as_nanos() / interval.as_nanos()) as u32;

            match node.state {
                NodeState::Active => {
                    if missed >= self.config.suspect_after_misses {
                        newly_suspect.push(*node_id);
                    }
                }
                NodeState::Suspect => {
                    let since = live.suspect_since.unwrap_or(live.last_heartbeat);
                    if now.saturating_duration_since(since) >= self.config.dead_timeout {
                        newly_dead.push(*node_id);
                    }
                }
                NodeState::Joining => {
                    if silent >= self.config.dead_timeout {
                        newly_dead.push(*node_id);
                    }
                }
                NodeState::Down | NodeState::Leaving => {}
            }
        }

        for node_id in &newly_suspect {
            if let Err(e) = self.suspect_locked(&mut state, node_id, now) {
                debug!(%e, "suspect transition skipped");
            }
        }

        for node_id in &newly_dead {
            let version = state.ring.version();
            if let Some(node) = state.nodes.get_mut(node_id) {
                node.state = NodeState::Down;
                node.ring_version = version;
            }
            warn!(%node_id, "node declared down");
            if let Err(e) = self.evict_locked(&mut state, node_id) {
                debug!(%e, "eviction skipped");
            }
        }

        if !newly_suspect.is_empty() || !newly_dead.is_empty() {
            self.publish(&state);
        }
        newly_dead
    }

    // ------------------------------------------------------------------
    // Internals (table lock held)
    // ------------------------------------------------------------------

    fn lock(&self) -> std::sync::MutexGuard<'_, TableState> {
        self.state.lock().expect("membership lock poisoned")
    }

    fn suspect_locked(
        &self,
        state: &mut TableState,
        node_id: &NodeId,
        now: Instant,
    ) -> Result<(), MembershipError> {
        let version = state.ring.version();
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or(MembershipError::UnknownNode(*node_id))?;
        if node.state != NodeState::Active {
            return Ok(());
        }
        node.state = NodeState::Suspect;
        node.ring_version = version;
        if let Some(live) = state.liveness.get_mut(node_id) {
            live.suspect_since = Some(now);
        }

        info!(%node_id, "node is now suspect");
        self.emit(ClusterEvent::NodeSuspect(*node_id));
        Ok(())
    }

    fn evict_locked(
        &self,
        state: &mut TableState,
        node_id: &NodeId,
    ) -> Result<Node, MembershipError> {
        let node = state
            .nodes
            .remove(node_id)
            .ok_or(MembershipError::UnknownNode(*node_id))?;
        state.liveness.remove(node_id);
        let ring_changed = Arc::make_mut(&mut state.ring).remove_node(node_id);

        info!(%node_id, state = ?node.state, "node evicted");
        if node.state == NodeState::Down {
            self.emit(ClusterEvent::NodeDown(*node_id));
        } else {
            self.emit(ClusterEvent::NodeLeft(*node_id));
        }
        if ring_changed {
            self.emit(ClusterEvent::RingChanged(state.ring.version()));
        }
        Ok(node)
    }

    fn publish(&self, state: &TableState) {
        let snapshot = Arc::new(Snapshot {
            nodes: state.nodes.clone(),
            ring: state.ring.clone(),
        });
        self.snapshot_tx.send_replace(snapshot);
    }

    fn emit(&self, event: ClusterEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl std::fmt::Debug for MembershipTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipTable")
            .field("version", &self.version())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
