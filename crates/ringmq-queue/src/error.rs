//! Error types for the queue crate.

use ringmq_types::{CorrelationId, MsgId};

/// Errors produced by the queue registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The handle was never opened or has been closed.
    #[error("invalid handle: {0}")]
    InvalidHandle(MsgId),

    /// The handle table is full.
    #[error("handle table full ({max} handles open)")]
    ResourceExhausted { max: usize },

    /// The addressed queue does not exist on this node; the packet is dropped.
    #[error("no queue for {0}")]
    NotFound(MsgId),

    /// The queue was closed while the caller was waiting on it.
    #[error("queue closed")]
    Closed,

    /// The wait deadline elapsed with nothing to deliver.
    #[error("timed out")]
    Timeout,

    /// A reply arrived for a request that is not (or no longer) pending.
    #[error("no pending request for correlation {0}")]
    UnknownCorrelation(CorrelationId),
}
