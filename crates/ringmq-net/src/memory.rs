//! In-process transport.
//!
//! [`MemoryTransport`] delivers packets directly into the target runtime's
//! [`QueueRegistry`]. It is the same-process fast path used when every
//! runtime of a fabric lives in one process, and the fault-injection point
//! for tests: whole nodes can be partitioned away, and individual deliveries
//! can be made to fail transiently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use ringmq_queue::QueueRegistry;
use ringmq_types::{NodeId, Packet, PacketKind};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::codec;
use crate::error::NetError;
use crate::{Delivery, Transport};

/// Same-process transport with fault injection.
#[derive(Default)]
pub struct MemoryTransport {
    nodes: RwLock<HashMap<NodeId, Arc<QueueRegistry>>>,
    partitioned: RwLock<HashSet<NodeId>>,
    transient: Mutex<HashMap<NodeId, u32>>,
    /// Round-trip every packet through the frame codec.
    wire: bool,
    delivered: AtomicU64,
}

impl MemoryTransport {
    /// Create a transport that hands packets over without copying.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport that encodes and decodes every packet, exercising
    /// the wire format end to end.
    pub fn with_wire_codec() -> Self {
        Self {
            wire: true,
            ..Self::default()
        }
    }

    /// Cut `node_id` off: deliveries to or from it fail until [`heal`](Self::heal).
    pub async fn partition(&self, node_id: NodeId) {
        info!(%node_id, "partitioning node");
        self.partitioned.write().await.insert(node_id);
    }

    /// Reconnect a partitioned node.
    pub async fn heal(&self, node_id: &NodeId) {
        info!(%node_id, "healing node");
        self.partitioned.write().await.remove(node_id);
    }

    /// Make the next `count` deliveries to `node_id` fail transiently.
    pub async fn inject_transient(&self, node_id: NodeId, count: u32) {
        *self.transient.lock().await.entry(node_id).or_default() += count;
    }

    /// Number of packets enqueued or accepted so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Number of attached nodes.
    pub async fn attached(&self) -> usize {
        self.nodes.read().await.len()
    }

    async fn take_transient(&self, node_id: &NodeId) -> bool {
        let mut transient = self.transient.lock().await;
        match transient.get_mut(node_id) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn attach(&self, node_id: NodeId, registry: Arc<QueueRegistry>) {
        debug!(%node_id, "node attached");
        self.nodes.write().await.insert(node_id, registry);
    }

    async fn detach(&self, node_id: &NodeId) {
        debug!(%node_id, "node detached");
        self.nodes.write().await.remove(node_id);
    }

    async fn deliver(&self, packet: Packet) -> Result<Delivery, NetError> {
        let target = packet.header.target;
        let sender = packet.header.sender;

        {
            let partitioned = self.partitioned.read().await;
            if partitioned.contains(&target) || partitioned.contains(&sender) {
                return Err(NetError::Unreachable(target));
            }
        }
        if self.take_transient(&target).await {
            trace!(%target, "injected transient failure");
            return Err(NetError::Transient(target));
        }

        let registry = self
            .nodes
            .read()
            .await
            .get(&target)
            .cloned()
            .ok_or(NetError::NotAttached(target))?;

        let packet = if self.wire {
            let mut wire = Vec::new();
            codec::write_frame(&mut wire, &packet).await?;
            codec::read_frame(&mut wire.as_slice()).await?
        } else {
            packet
        };

        if packet.header.kind == PacketKind::Admin {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            return Ok(Delivery::Accepted);
        }

        match registry.enqueue(packet) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(Delivery::Enqueued)
            }
            Err(e) => {
                debug!(%target, error = %e, "packet dropped at target");
                Ok(Delivery::Dropped)
            }
        }
    }

    async fn is_reachable(&self, node_id: &NodeId) -> bool {
        !self.partitioned.read().await.contains(node_id)
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("wire", &self.wire)
            .field("delivered", &self.delivered())
            .finish_non_exhaustive()
    }
}
