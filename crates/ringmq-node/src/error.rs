//! Error types for the node runtime.

use ringmq_net::DispatchError;
use ringmq_queue::QueueError;
use ringmq_types::{CorrelationId, MsgId, Role};

use crate::runtime::RuntimeState;

/// Errors surfaced to callers of the node runtime.
///
/// [`NodeError::code`] maps every variant onto the fixed error taxonomy
/// exposed to bindings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    /// Configuration invalid or the join was not acknowledged in time.
    #[error("initialization failed: {0}")]
    InitFailed(String),

    /// The runtime is not in a state that accepts the operation.
    #[error("runtime not ready (state {0})")]
    NotReady(RuntimeState),

    /// Unknown or closed handle.
    #[error("invalid handle: {0}")]
    InvalidHandle(MsgId),

    /// The handle table is full.
    #[error("handle table full ({max} handles open)")]
    ResourceExhausted { max: usize },

    /// The ring has no eligible targets.
    #[error("no route: no servers on the ring")]
    NoRoute,

    /// Delivery failed after retries.
    #[error("dispatch failed: {0}")]
    DispatchFailed(#[from] DispatchError),

    /// Receive deadline elapsed.
    #[error("timed out")]
    Timeout,

    /// The handle or the runtime closed while waiting.
    #[error("closed")]
    Closed,

    /// The operation is not available for this node's role.
    #[error("operation requires a {expected} node, this node is a {actual}")]
    WrongRole { expected: Role, actual: Role },

    /// The reply reference is malformed or does not name a request.
    #[error("invalid reply reference: {0}")]
    InvalidRef(String),

    /// The request is neither pending nor has a buffered reply.
    #[error("no pending request for correlation {0}")]
    UnknownRequest(CorrelationId),

    /// The configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),
}

impl NodeError {
    /// Taxonomy name of this error.
    pub fn code(&self) -> &'static str {
        match self {
            NodeError::InitFailed(_) | NodeError::Config(_) => "INIT_FAILED",
            NodeError::NotReady(_) | NodeError::WrongRole { .. } => "NOT_READY",
            NodeError::InvalidHandle(_) | NodeError::InvalidRef(_) | NodeError::UnknownRequest(_) => {
                "INVALID_HANDLE"
            }
            NodeError::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            NodeError::NoRoute => "NO_ROUTE",
            NodeError::DispatchFailed(_) => "DISPATCH_FAILED",
            NodeError::Timeout => "TIMEOUT",
            NodeError::Closed => "CLOSED",
        }
    }

    /// Whether this is a normal "nothing arrived" outcome rather than a
    /// failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, NodeError::Timeout)
    }
}

impl From<QueueError> for NodeError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::InvalidHandle(msgid) | QueueError::NotFound(msgid) => {
                NodeError::InvalidHandle(msgid)
            }
            QueueError::ResourceExhausted { max } => NodeError::ResourceExhausted { max },
            QueueError::Closed => NodeError::Closed,
            QueueError::Timeout => NodeError::Timeout,
            QueueError::UnknownCorrelation(c) => NodeError::UnknownRequest(c),
        }
    }
}
