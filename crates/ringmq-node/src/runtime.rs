//! Node runtime: one server or slave on a [`Fabric`].
//!
//! The runtime announces itself to the membership table, keeps a heartbeat
//! task running while it is initialized, and exposes the messaging
//! primitives. Routing decisions read the latest membership [`Snapshot`]
//! through a watch subscription and never take the table lock.
//!
//! ```text
//! UNINITIALIZED → INITIALIZING → ACTIVE ⇄ SUSPECT → EXITING → TERMINATED
//! ```
//!
//! SEND, BROADCAST and RECEIVE are accepted in ACTIVE, and in SUSPECT when
//! the runtime was initialized with auto-rejoin.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use ringmq_membership::{MembershipError, Snapshot};
use ringmq_net::{DispatchError, Dispatcher, NetError};
use ringmq_queue::{QueueRegistry, Wait, routing_key};
use ringmq_ring::Resolution;
use ringmq_types::{
    CorrelationId, MsgId, Node, NodeId, NodeState, Packet, PacketHeader, PacketKind, ReplyRef,
    RingVersion, Role,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::fabric::Fabric;

/// Re-resolutions allowed per logical send when the ring moves mid-dispatch.
const MAX_RERESOLVE: u32 = 3;

/// Upper bound on the pause between join heartbeats.
const JOIN_POLL: Duration = Duration::from_millis(50);

/// Lifecycle state of a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeState {
    Uninitialized,
    Initializing,
    Active,
    Suspect,
    Exiting,
    Terminated,
}

impl RuntimeState {
    fn is_final(&self) -> bool {
        matches!(self, RuntimeState::Exiting | RuntimeState::Terminated)
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuntimeState::Uninitialized => "UNINITIALIZED",
            RuntimeState::Initializing => "INITIALIZING",
            RuntimeState::Active => "ACTIVE",
            RuntimeState::Suspect => "SUSPECT",
            RuntimeState::Exiting => "EXITING",
            RuntimeState::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

/// Result of a successful send or broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReceipt {
    /// Correlation id the replies will carry.
    pub correlation_id: CorrelationId,
    /// Number of nodes that enqueued the request; as many replies may come
    /// back.
    pub receivers: usize,
    /// Ring version the request was routed on.
    pub ring_version: RingVersion,
}

/// A packet handed to the application by `receive`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// Reference needed to answer the packet.
    pub reply_ref: ReplyRef,
    /// Application payload.
    pub body: Bytes,
}

impl Received {
    /// Kind of the received packet.
    pub fn kind(&self) -> PacketKind {
        self.reply_ref.kind
    }

    /// Node that sent the packet.
    pub fn sender(&self) -> NodeId {
        self.reply_ref.origin
    }
}

impl From<Packet> for Received {
    fn from(packet: Packet) -> Self {
        Self {
            reply_ref: packet.reply_ref(),
            body: packet.body,
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Everything a runtime holds between initialize and shutdown.
struct Session {
    node: Node,
    generation: AtomicU64,
    replicas: usize,
    auto_rejoin: bool,
    join_timeout: Duration,
    registry: Arc<QueueRegistry>,
    dispatcher: Dispatcher,
    snapshots: watch::Receiver<Arc<Snapshot>>,
}

impl Session {
    fn node_id(&self) -> NodeId {
        self.node.node_id
    }

    fn role(&self) -> Role {
        self.node.role
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshots.borrow().clone()
    }

    /// The node record for the next (re-)announce, with a fresh generation.
    fn announcement(&self) -> Node {
        let mut node = self.node.clone();
        node.generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        node
    }

    fn require_role(&self, expected: Role) -> Result<(), NodeError> {
        if self.role() == expected {
            Ok(())
        } else {
            Err(NodeError::WrongRole {
                expected,
                actual: self.role(),
            })
        }
    }

    fn request(
        &self,
        kind: PacketKind,
        target: NodeId,
        msgid: MsgId,
        correlation: CorrelationId,
        version: RingVersion,
        body: Bytes,
    ) -> Packet {
        Packet {
            header: PacketHeader {
                sender: self.node_id(),
                target,
                msgid,
                ring_version: version,
                kind,
                correlation_id: correlation,
            },
            body,
        }
    }
}

/// Outcome of one heartbeat round trip.
enum Beat {
    Acked(NodeState),
    Unreachable(NetError),
    Rejected(MembershipError),
}

/// Send a heartbeat through the transport and, if it got out, record it.
async fn beat(fabric: &Fabric, session: &Session) -> Beat {
    let node_id = session.node_id();
    let table = fabric.membership();
    if !fabric.transport().is_reachable(&node_id).await {
        return Beat::Unreachable(NetError::Unreachable(node_id));
    }
    let packet = session.request(
        PacketKind::Admin,
        node_id,
        MsgId::INVALID,
        CorrelationId(0),
        table.version(),
        Bytes::new(),
    );
    if let Err(e) = fabric.transport().deliver(packet).await {
        return Beat::Unreachable(e);
    }
    match table.heartbeat(&node_id) {
        Ok(state) => Beat::Acked(state),
        Err(e) => Beat::Rejected(e),
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// State shared between the runtime and its heartbeat task.
struct Shared {
    fabric: Arc<Fabric>,
    state: watch::Sender<RuntimeState>,
}

impl Shared {
    fn state(&self) -> RuntimeState {
        *self.state.borrow()
    }

    /// Move to `next` unless the runtime is already winding down.
    fn transition(&self, next: RuntimeState) {
        self.state.send_if_modified(|current| {
            if *current == next || (current.is_final() && next != RuntimeState::Terminated) {
                return false;
            }
            debug!(from = %current, to = %next, "runtime state change");
            *current = next;
            true
        });
    }
}

struct HeartbeatTask {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// One server or slave taking part in a [`Fabric`].
pub struct NodeRuntime {
    shared: Arc<Shared>,
    session: RwLock<Option<Arc<Session>>>,
    heartbeat: Mutex<Option<HeartbeatTask>>,
}

impl NodeRuntime {
    /// Create an uninitialized runtime on `fabric`.
    pub fn new(fabric: Arc<Fabric>) -> Self {
        let (state, _) = watch::channel(RuntimeState::Uninitialized);
        Self {
            shared: Arc::new(Shared { fabric, state }),
            session: RwLock::new(None),
            heartbeat: Mutex::new(None),
        }
    }

    /// The fabric this runtime belongs to.
    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.shared.fabric
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RuntimeState {
        self.shared.state()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<RuntimeState> {
        self.shared.state.subscribe()
    }

    /// ID of this node, once initialized.
    pub fn node_id(&self) -> Option<NodeId> {
        self.session().map(|s| s.node_id())
    }

    /// Role of this node, once initialized.
    pub fn role(&self) -> Option<Role> {
        self.session().map(|s| s.role())
    }

    /// Latest membership snapshot of the fabric.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.shared.fabric.membership().snapshot()
    }

    /// Whether shutdown is in progress or done. Never blocks.
    pub fn is_exiting(&self) -> bool {
        self.state().is_final() || self.shared.fabric.is_shut_down()
    }

    // ------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------

    /// Read the config file at `path` and join as a server.
    pub async fn initialize_on_server(&self, path: &Path, auto_rejoin: bool) -> Result<(), NodeError> {
        let config = NodeConfig::load(path)?;
        self.initialize(config, Role::Server, auto_rejoin).await
    }

    /// Read the config file at `path` and join as a slave.
    pub async fn initialize_on_slave(&self, path: &Path, auto_rejoin: bool) -> Result<(), NodeError> {
        let config = NodeConfig::load(path)?;
        self.initialize(config, Role::Slave, auto_rejoin).await
    }

    /// Announce this node and block until it is ACTIVE or the join times
    /// out.
    ///
    /// Calling again while initialized restarts the join sequence; open
    /// handles survive when the node name and role are unchanged. A config
    /// whose failure-detector timings or vnode count differ from the
    /// fabric's fails with INIT_FAILED.
    pub async fn initialize(
        &self,
        config: NodeConfig,
        role: Role,
        auto_rejoin: bool,
    ) -> Result<(), NodeError> {
        config.validate()?;
        if let Some(declared) = config.node.role
            && declared != role
        {
            return Err(NodeError::InitFailed(format!(
                "config declares role {declared}, initialize called for {role}"
            )));
        }
        let fabric = self.shared.fabric.clone();
        if fabric.is_shut_down() {
            return Err(NodeError::InitFailed("fabric is shut down".into()));
        }
        fabric.check_config(&config)?;
        if self.state() == RuntimeState::Exiting {
            return Err(NodeError::NotReady(RuntimeState::Exiting));
        }

        self.stop_heartbeat().await;
        let session = self.new_session(&config, role, auto_rejoin).await;
        self.shared.state.send_replace(RuntimeState::Initializing);

        let node_id = session.node_id();
        fabric.transport().attach(node_id, session.registry.clone()).await;
        fabric.register(&session.registry);
        *self.session.write().expect("session lock poisoned") = Some(session.clone());

        match self.join(&session).await {
            Ok(()) => {
                self.shared.transition(RuntimeState::Active);
                self.spawn_heartbeat(session.clone());
                info!(%node_id, name = %session.node.name, %role, auto_rejoin, version = %fabric.membership().version(), "node initialized");
                Ok(())
            }
            Err(e) => {
                warn!(%node_id, error = %e, "join failed");
                let _ = fabric.membership().evict(&node_id);
                fabric.transport().detach(&node_id).await;
                self.shared.state.send_replace(RuntimeState::Uninitialized);
                Err(e)
            }
        }
    }

    /// Build the session for an initialize call, keeping the previous
    /// registry (and its handles) when the identity is unchanged.
    async fn new_session(&self, config: &NodeConfig, role: Role, auto_rejoin: bool) -> Arc<Session> {
        let fabric = &self.shared.fabric;
        let node = Node::new(config.node.name.clone(), config.node.address.clone(), role);
        let previous = self.session();

        let (registry, generation) = match previous {
            Some(prev)
                if prev.node.node_id == node.node_id
                    && prev.role() == role
                    && !prev.registry.is_shut_down() =>
            {
                debug!(node_id = %node.node_id, "restarting join, keeping handles");
                (prev.registry.clone(), prev.generation.load(Ordering::SeqCst))
            }
            other => {
                if let Some(prev) = other {
                    self.retire(&prev).await;
                }
                let registry = Arc::new(QueueRegistry::new(node.node_id, role, config.queue_config()));
                (registry, 0)
            }
        };

        Arc::new(Session {
            node,
            generation: AtomicU64::new(generation),
            replicas: config.ring.replicas,
            auto_rejoin,
            join_timeout: config.join_timeout(),
            registry,
            dispatcher: Dispatcher::new(
                fabric.transport().clone(),
                fabric.membership().clone(),
                config.retry_policy(),
            ),
            snapshots: fabric.membership().subscribe(),
        })
    }

    async fn join(&self, session: &Session) -> Result<(), NodeError> {
        let fabric = &self.shared.fabric;
        let table = fabric.membership();
        table.announce(session.announcement());

        let deadline = Instant::now() + session.join_timeout;
        let pause = table.config().heartbeat_interval.min(JOIN_POLL);
        loop {
            match beat(fabric, session).await {
                Beat::Acked(NodeState::Active) => return Ok(()),
                Beat::Acked(state) => debug!(?state, "join heartbeat acknowledged"),
                Beat::Unreachable(e) => debug!(error = %e, "join heartbeat not delivered"),
                Beat::Rejected(MembershipError::UnknownNode(_)) => {
                    table.announce(session.announcement());
                }
                Beat::Rejected(e) => return Err(NodeError::InitFailed(e.to_string())),
            }
            if Instant::now() >= deadline {
                return Err(NodeError::InitFailed(format!(
                    "no heartbeat acknowledged within {:?}",
                    session.join_timeout
                )));
            }
            tokio::time::sleep(pause).await;
        }
    }

    fn spawn_heartbeat(&self, session: Arc<Session>) {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(heartbeat_loop(self.shared.clone(), session, stop_rx));
        *self.heartbeat.lock().expect("heartbeat lock poisoned") = Some(HeartbeatTask { stop, task });
    }

    async fn stop_heartbeat(&self) {
        let task = self.heartbeat.lock().expect("heartbeat lock poisoned").take();
        if let Some(HeartbeatTask { stop, task }) = task {
            let _ = stop.send(true);
            let _ = task.await;
        }
    }

    /// Leave the fabric and release a session's resources.
    async fn retire(&self, session: &Session) {
        let fabric = &self.shared.fabric;
        let node_id = session.node_id();
        if let Err(e) = fabric.membership().leave(&node_id) {
            debug!(%node_id, error = %e, "leave skipped");
        }
        fabric.transport().detach(&node_id).await;
        session.registry.shutdown();
    }

    // ------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------

    /// Open a new queue handle (slaves only).
    pub fn open(&self) -> Result<MsgId, NodeError> {
        let session = self.ready()?;
        session.require_role(Role::Slave)?;
        let msgid = session.registry.open()?;
        Ok(msgid)
    }

    /// Close a handle, discarding its buffered packets and waking its
    /// waiters. Fails on an unknown or already closed handle.
    pub fn close(&self, msgid: MsgId) -> Result<(), NodeError> {
        let session = self.session().ok_or(NodeError::NotReady(self.state()))?;
        session.require_role(Role::Slave)?;
        session.registry.close(msgid)?;
        Ok(())
    }

    /// Where traffic of `msgid` is routed right now.
    pub fn route(&self, msgid: MsgId) -> Result<Resolution, NodeError> {
        let session = self.session().ok_or(NodeError::NotReady(self.state()))?;
        let key = routing_key(&session.node_id(), msgid);
        Ok(session.snapshot().resolve(&key, session.replicas))
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Send `body` on `msgid` to exactly one server.
    ///
    /// With `routing` the candidates (primary, then replicas) are tried in
    /// order until one enqueues the packet; without it only the primary is
    /// tried. The receipt always reports one receiver.
    pub async fn send(
        &self,
        msgid: MsgId,
        body: impl Into<Bytes>,
        routing: bool,
    ) -> Result<SendReceipt, NodeError> {
        let session = self.ready()?;
        session.require_role(Role::Slave)?;
        let body = body.into();
        let correlation = session.registry.begin_request(msgid)?;

        match route_send(&session, msgid, correlation, body, routing).await {
            Ok(receipt) => {
                session.registry.settle_request(msgid, correlation, receipt.receivers);
                Ok(receipt)
            }
            Err(e) => {
                session.registry.cancel_request(msgid, correlation);
                Err(e)
            }
        }
    }

    /// Send `body` on `msgid` to every server on the ring.
    ///
    /// Partial delivery is success: the receipt counts the servers that
    /// enqueued the packet. Fails only if none did.
    pub async fn broadcast(&self, msgid: MsgId, body: impl Into<Bytes>) -> Result<SendReceipt, NodeError> {
        let session = self.ready()?;
        session.require_role(Role::Slave)?;
        let body = body.into();
        let correlation = session.registry.begin_request(msgid)?;

        let mut enqueued: HashSet<NodeId> = HashSet::new();
        let mut last_error = None;
        let mut version = session.snapshot().version();
        let mut reresolved = 0;

        loop {
            let snapshot = session.snapshot();
            version = version.max(snapshot.version());
            let targets: Vec<NodeId> = snapshot
                .routable_servers()
                .into_iter()
                .filter(|t| !enqueued.contains(t))
                .collect();
            let Some(&first) = targets.first() else {
                break;
            };

            let packet = session.request(
                PacketKind::Broadcast,
                first,
                msgid,
                correlation,
                snapshot.version(),
                body.clone(),
            );
            let report = session.dispatcher.broadcast(packet, &targets).await;
            enqueued.extend(report.enqueued);

            let ring_moved = report
                .failed
                .iter()
                .any(|(_, e)| matches!(e, DispatchError::RingChanged { .. }));
            for (target, e) in report.failed {
                debug!(%target, error = %e, "broadcast target failed");
                last_error = Some(e);
            }
            if !ring_moved || reresolved >= MAX_RERESOLVE {
                break;
            }
            reresolved += 1;
        }

        if enqueued.is_empty() {
            session.registry.cancel_request(msgid, correlation);
            return Err(match last_error {
                Some(e) => NodeError::DispatchFailed(e),
                None => NodeError::NoRoute,
            });
        }

        session.registry.settle_request(msgid, correlation, enqueued.len());
        debug!(%msgid, %correlation, receivers = enqueued.len(), "broadcast delivered");
        Ok(SendReceipt {
            correlation_id: correlation,
            receivers: enqueued.len(),
            ring_version: version,
        })
    }

    /// Answer a received SEND or BROADCAST.
    ///
    /// The reply goes straight back to the originating handle without ring
    /// resolution.
    pub async fn reply(&self, reference: &ReplyRef, body: impl Into<Bytes>) -> Result<(), NodeError> {
        let session = self.ready()?;
        if !matches!(reference.kind, PacketKind::Send | PacketKind::Broadcast) {
            return Err(NodeError::InvalidRef(format!(
                "cannot reply to a {:?} packet",
                reference.kind
            )));
        }
        let packet = session.request(
            PacketKind::Reply,
            reference.origin,
            reference.msgid,
            reference.correlation_id,
            session.snapshot().version(),
            body.into(),
        );
        session.dispatcher.send(packet).await?;
        Ok(())
    }

    /// [`NodeRuntime::reply`] with a reference in its opaque byte form.
    pub async fn reply_bytes(&self, reference: &[u8], body: impl Into<Bytes>) -> Result<(), NodeError> {
        let reference =
            ReplyRef::from_bytes(reference).map_err(|e| NodeError::InvalidRef(e.to_string()))?;
        self.reply(&reference, body).await
    }

    /// Take the next packet.
    ///
    /// Servers pass `None` to read their shared inbox; slaves pass the
    /// handle to read. Returns [`NodeError::Timeout`] when nothing arrived
    /// in time and [`NodeError::Closed`] when the handle or the runtime
    /// closed while waiting.
    pub async fn receive(&self, msgid: Option<MsgId>, wait: Wait) -> Result<Received, NodeError> {
        let session = self.ready()?;
        let packet = session.registry.dequeue(msgid, wait).await?;
        Ok(packet.into())
    }

    /// Wait for the reply to one specific request, leaving other buffered
    /// packets in place.
    pub async fn receive_reply(
        &self,
        msgid: MsgId,
        correlation: CorrelationId,
        wait: Wait,
    ) -> Result<Received, NodeError> {
        let session = self.ready()?;
        session.require_role(Role::Slave)?;
        let packet = session.registry.dequeue_reply(msgid, correlation, wait).await?;
        Ok(packet.into())
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Leave the fabric gracefully: EXITING, stop heartbeats, announce the
    /// leave, wake all receivers with CLOSED, then TERMINATED.
    pub async fn shutdown(&self) {
        if self.state() == RuntimeState::Terminated && self.session().is_none() {
            return;
        }
        self.shared.transition(RuntimeState::Exiting);
        self.stop_heartbeat().await;

        let session = self.session.write().expect("session lock poisoned").take();
        if let Some(session) = session {
            self.retire(&session).await;
            info!(node_id = %session.node_id(), "node terminated");
        }
        self.shared.transition(RuntimeState::Terminated);
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn session(&self) -> Option<Arc<Session>> {
        self.session.read().expect("session lock poisoned").clone()
    }

    /// The session, if the runtime accepts messaging operations.
    fn ready(&self) -> Result<Arc<Session>, NodeError> {
        let state = self.state();
        let session = self.session().ok_or(NodeError::NotReady(state))?;
        if self.shared.fabric.is_shut_down() {
            return Err(NodeError::NotReady(RuntimeState::Terminated));
        }
        match state {
            RuntimeState::Active => Ok(session),
            RuntimeState::Suspect if session.auto_rejoin => Ok(session),
            other => Err(NodeError::NotReady(other)),
        }
    }
}

impl Drop for NodeRuntime {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.heartbeat.lock()
            && let Some(heartbeat) = slot.take()
        {
            heartbeat.task.abort();
        }
    }
}

impl fmt::Debug for NodeRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRuntime")
            .field("node_id", &self.node_id())
            .field("role", &self.role())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Resolve and dispatch one SEND, re-resolving when the ring moves.
async fn route_send(
    session: &Session,
    msgid: MsgId,
    correlation: CorrelationId,
    body: Bytes,
    routing: bool,
) -> Result<SendReceipt, NodeError> {
    let key = routing_key(&session.node_id(), msgid);
    let mut reresolved = 0;

    loop {
        let resolution = session.snapshot().resolve(&key, session.replicas);
        let Some(primary) = resolution.primary() else {
            return Err(NodeError::NoRoute);
        };
        if resolution.degraded {
            debug!(%msgid, wanted = session.replicas, got = resolution.targets.len(), "routing with reduced redundancy");
        }

        let candidates = if routing {
            &resolution.targets[..]
        } else {
            &resolution.targets[..1]
        };
        let packet = session.request(
            PacketKind::Send,
            primary,
            msgid,
            correlation,
            resolution.version,
            body.clone(),
        );

        match session.dispatcher.send_first(packet, candidates).await {
            Ok(target) => {
                debug!(%msgid, %correlation, %target, version = %resolution.version, "send delivered");
                return Ok(SendReceipt {
                    correlation_id: correlation,
                    receivers: 1,
                    ring_version: resolution.version,
                });
            }
            Err(DispatchError::RingChanged { used, current }) if reresolved < MAX_RERESOLVE => {
                debug!(%msgid, %used, %current, "ring moved, re-resolving");
                reresolved += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Emit heartbeats until stopped, tracking ACTIVE/SUSPECT and rejoining
/// after eviction when allowed.
async fn heartbeat_loop(shared: Arc<Shared>, session: Arc<Session>, mut stop: watch::Receiver<bool>) {
    let fabric = shared.fabric.clone();
    let node_id = session.node_id();
    let mut interval = tokio::time::interval(fabric.membership().config().heartbeat_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop.changed() => break,
        }

        if fabric.is_shut_down() {
            shared.transition(RuntimeState::Terminated);
            break;
        }
        session.registry.expire_pending(Instant::now());

        match beat(&fabric, &session).await {
            Beat::Acked(_) => {
                if shared.state() == RuntimeState::Suspect {
                    info!(%node_id, "node back to active");
                    shared.transition(RuntimeState::Active);
                }
            }
            Beat::Unreachable(e) => {
                if shared.state() == RuntimeState::Active {
                    warn!(%node_id, error = %e, "heartbeat not delivered, node suspect");
                    shared.transition(RuntimeState::Suspect);
                }
            }
            Beat::Rejected(MembershipError::UnknownNode(_)) if session.auto_rejoin => {
                shared.transition(RuntimeState::Suspect);
                let node = session.announcement();
                info!(%node_id, generation = node.generation, "session lost, rejoining");
                fabric.membership().announce(node);
            }
            Beat::Rejected(e) => {
                warn!(%node_id, error = %e, "session lost, terminating");
                session.registry.shutdown();
                fabric.transport().detach(&node_id).await;
                shared.transition(RuntimeState::Terminated);
                break;
            }
        }
    }
    debug!(%node_id, "heartbeat task stopped");
}
