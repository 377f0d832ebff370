//! Error types for the membership crate.

use ringmq_types::NodeId;

/// Errors produced by the membership table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MembershipError {
    /// The node is not (or no longer) a member: never announced, or evicted.
    ///
    /// A node receiving this on heartbeat has lost its session and must
    /// re-announce.
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    /// The node announced a graceful shutdown and no longer accepts
    /// heartbeats.
    #[error("node is leaving: {0}")]
    Leaving(NodeId),
}
