//! Error types for transport and dispatch.

use ringmq_types::{NodeId, RingVersion};

/// Errors raised by a [`Transport`](crate::Transport).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    /// The target (or the sender) is cut off from the fabric.
    #[error("node unreachable: {0}")]
    Unreachable(NodeId),

    /// A one-off delivery failure; the next attempt may succeed.
    #[error("transient delivery failure to {0}")]
    Transient(NodeId),

    /// No node with this ID is attached to the transport.
    #[error("node not attached: {0}")]
    NotAttached(NodeId),

    /// A frame was oversized or malformed.
    #[error("frame error: {0}")]
    Frame(String),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O failure on a framed stream.
    #[error("io error: {0}")]
    Io(String),
}

impl NetError {
    /// Whether retrying the same delivery may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, NetError::Unreachable(_) | NetError::Transient(_))
    }
}

impl From<std::io::Error> for NetError {
    fn from(e: std::io::Error) -> Self {
        NetError::Io(e.to_string())
    }
}

/// Errors reported by the [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The ring moved since the packet was routed; re-resolve and try again.
    #[error("ring changed from {used} to {current}")]
    RingChanged {
        /// Version the packet was routed with.
        used: RingVersion,
        /// Version current when the change was noticed.
        current: RingVersion,
    },

    /// The target discarded the packet.
    #[error("packet dropped by {0}")]
    Dropped(NodeId),

    /// Delivery to the target failed after the retry budget.
    #[error("delivery to {target} failed after {attempts} attempt(s): {source}")]
    Failed {
        target: NodeId,
        attempts: u32,
        source: NetError,
    },

    /// There was nothing to deliver to.
    #[error("no targets")]
    NoTargets,
}
