//! Shared types and identifiers for ringmq.
//!
//! This crate defines the core types used across the ringmq workspace:
//! identifiers ([`NodeId`], [`MsgId`], [`CorrelationId`], [`RingVersion`]),
//! cluster types ([`Node`], [`Role`], [`NodeState`], [`ClusterEvent`]),
//! and the transported unit ([`Packet`], [`PacketHeader`], [`PacketKind`],
//! [`ReplyRef`]).

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

/// Identifier for a fabric node: `blake3(logical name)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// The greatest possible node ID.
    pub const MAX: NodeId = NodeId([0xff; 32]);

    /// Derive a node ID from the node's logical name.
    pub fn from_name(name: &str) -> Self {
        Self::from_data(name.as_bytes())
    }

    /// Create an ID by hashing arbitrary data with BLAKE3.
    pub fn from_data(data: &[u8]) -> Self {
        Self(blake3::hash(data).into())
    }

    /// Return the raw 32-byte representation.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for NodeId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell nodes apart in logs.
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

/// Opaque handle naming one message queue opened by a slave.
///
/// Handles are allocated from a per-process counter and never reused, so a
/// stale sender can never reach a newer queue through an old handle. The
/// value `0` is never allocated and acts as the invalid handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct MsgId(u64);

impl MsgId {
    /// The handle value that is never allocated.
    pub const INVALID: MsgId = MsgId(0);

    /// Width of the external byte representation.
    pub const WIDTH: usize = 8;

    /// Wrap a raw handle value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Return the raw handle value.
    pub fn get(&self) -> u64 {
        self.0
    }

    /// Whether this is the never-allocated handle.
    pub fn is_invalid(&self) -> bool {
        self.0 == 0
    }

    /// Fixed-width little-endian encoding handed out to bindings.
    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    /// Decode a handle from a binding-supplied buffer.
    ///
    /// At most [`MsgId::WIDTH`] bytes are read; shorter buffers are
    /// zero-extended, so an empty buffer decodes to [`MsgId::INVALID`].
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        let len = bytes.len().min(Self::WIDTH);
        raw[..len].copy_from_slice(&bytes[..len]);
        Self(u64::from_le_bytes(raw))
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MsgId({self})")
    }
}

/// Identifier linking a SEND/BROADCAST packet to its replies.
///
/// Unique per handle: allocated under the handle's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing version of the active server set.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
pub struct RingVersion(pub u64);

impl RingVersion {
    /// The version that follows this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for RingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Cluster types
// ---------------------------------------------------------------------------

/// Role a node plays in the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Hosts the shared inbound queue that slaves route into.
    Server,
    /// Opens its own queues and talks through servers.
    Slave,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => f.write_str("server"),
            Role::Slave => f.write_str("slave"),
        }
    }
}

/// Membership state of a node as seen by the failure detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Announced, waiting for the first acknowledged heartbeat.
    Joining,
    /// Heartbeating normally.
    Active,
    /// Missed too many heartbeats; still routable.
    Suspect,
    /// Suspect timeout elapsed without recovery; about to be evicted.
    Down,
    /// Announced a graceful shutdown.
    Leaving,
}

impl NodeState {
    /// Whether a server in this state owns slots on the ring.
    pub fn is_routable(&self) -> bool {
        matches!(self, NodeState::Active | NodeState::Suspect)
    }
}

/// A member of the fabric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier, derived from `name`.
    pub node_id: NodeId,
    /// Logical name from the node's configuration.
    pub name: String,
    /// Advertised network address.
    pub address: String,
    /// Server or slave.
    pub role: Role,
    /// Current membership state.
    pub state: NodeState,
    /// Session counter, bumped on every (re-)announce.
    pub generation: u64,
    /// Ring version current when the node last changed state.
    pub ring_version: RingVersion,
}

impl Node {
    /// Create a freshly announced node.
    pub fn new(name: impl Into<String>, address: impl Into<String>, role: Role) -> Self {
        let name = name.into();
        Self {
            node_id: NodeId::from_name(&name),
            name,
            address: address.into(),
            role,
            state: NodeState::Joining,
            generation: 1,
            ring_version: RingVersion::default(),
        }
    }
}

/// Membership changes published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEvent {
    /// A node announced itself (first time or re-announce).
    NodeJoined(Node),
    /// A node's heartbeat was acknowledged; it is now ACTIVE.
    NodeActive(NodeId),
    /// A node missed too many heartbeats.
    NodeSuspect(NodeId),
    /// A suspect node timed out and was evicted.
    NodeDown(NodeId),
    /// A node left gracefully and was evicted.
    NodeLeft(NodeId),
    /// The active server set changed.
    RingChanged(RingVersion),
}

// ---------------------------------------------------------------------------
// Packets
// ---------------------------------------------------------------------------

/// What a packet is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketKind {
    /// One-to-one request routed by hash.
    Send,
    /// One-to-many request to every server on the ring.
    Broadcast,
    /// Answer to a SEND or BROADCAST, routed back to the originator.
    Reply,
    /// Control traffic (heartbeats); never queued for the application.
    Admin,
}

/// Routing metadata carried with every packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    /// Node that emitted the packet.
    pub sender: NodeId,
    /// Node the packet is addressed to.
    pub target: NodeId,
    /// Originating handle for SEND/BROADCAST; destination handle for REPLY.
    pub msgid: MsgId,
    /// Ring version used to pick `target`.
    pub ring_version: RingVersion,
    /// Packet kind.
    pub kind: PacketKind,
    /// Correlation between a request and its replies.
    pub correlation_id: CorrelationId,
}

/// The unit moved between nodes: a header plus opaque body bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Routing metadata.
    pub header: PacketHeader,
    /// Application payload, never interpreted by the fabric.
    pub body: Bytes,
}

impl Packet {
    /// Build the reference a receiver needs to answer this packet.
    pub fn reply_ref(&self) -> ReplyRef {
        ReplyRef {
            origin: self.header.sender,
            msgid: self.header.msgid,
            correlation_id: self.header.correlation_id,
            kind: self.header.kind,
        }
    }
}

/// Opaque reference returned by `receive`, passed back to `reply`.
///
/// Carries the sender identity and correlation needed to route a reply
/// straight back to the originating handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRef {
    /// Node that sent the original request.
    pub origin: NodeId,
    /// Handle on `origin` the reply must land in.
    pub msgid: MsgId,
    /// Correlation of the original request.
    pub correlation_id: CorrelationId,
    /// Kind of the packet this reference was taken from.
    pub kind: PacketKind,
}

impl ReplyRef {
    /// Serialize to the opaque byte string handed to bindings.
    pub fn to_bytes(&self) -> Vec<u8> {
        // A fixed-shape struct of plain values cannot fail to encode.
        postcard::to_allocvec(self).unwrap_or_default()
    }

    /// Parse a reference previously produced by [`ReplyRef::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
