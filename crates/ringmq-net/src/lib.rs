//! Transport Dispatcher and packet transport.
//!
//! This crate moves [`Packet`]s between node runtimes without looking at
//! their payload:
//!
//! - [`Transport`]: the seam between the dispatcher and whatever carries
//!   bytes. [`MemoryTransport`] is the same-process fast path that delivers
//!   straight into the target's [`QueueRegistry`], with fault injection for
//!   tests.
//! - [`codec`]: length-prefixed postcard framing for packets.
//! - [`Dispatcher`]: bounded retries with exponential backoff, ring-version
//!   checks between attempts, failover across candidates and broadcast
//!   fan-out.

pub mod codec;
mod dispatcher;
mod error;
mod memory;

use std::sync::Arc;

use ringmq_queue::QueueRegistry;
use ringmq_types::{NodeId, Packet};

pub use dispatcher::{BroadcastReport, Dispatcher, RetryPolicy};
pub use error::{DispatchError, NetError};
pub use memory::MemoryTransport;

/// Outcome of handing one packet to a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The packet is in the target's queue.
    Enqueued,
    /// The target is reachable but had no queue for the packet; it was
    /// discarded and must not be retried.
    Dropped,
    /// Control traffic acknowledged by the target without queueing.
    Accepted,
}

/// Trait abstracting the transport used by the dispatcher.
///
/// This allows substituting fault-injecting or wire-level transports in
/// tests without touching the dispatcher or the runtimes.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Make `node_id` reachable, delivering into `registry`.
    async fn attach(&self, node_id: NodeId, registry: Arc<QueueRegistry>);

    /// Remove `node_id`; later deliveries to it fail.
    async fn detach(&self, node_id: &NodeId);

    /// Deliver a packet to `packet.header.target`.
    ///
    /// Errors for which [`NetError::is_transient`] holds may succeed on a
    /// later attempt.
    async fn deliver(&self, packet: Packet) -> Result<Delivery, NetError>;

    /// Whether packets from `node_id` can currently leave the node.
    async fn is_reachable(&self, node_id: &NodeId) -> bool;
}
