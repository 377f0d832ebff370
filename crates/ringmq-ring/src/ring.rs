//! Consistent hashing ring implementation.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use ringmq_types::{NodeId, RingVersion};
use tracing::debug;

/// Position of a vnode: ring point first, then the owning node in
/// descending order so that equal points resolve to the higher node ID on
/// every process.
type SlotKey = (u64, Reverse<NodeId>);

/// Outcome of routing a key on a specific ring version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Candidate servers: primary first, then distinct replicas clockwise.
    pub targets: Vec<NodeId>,
    /// The ring version these targets were computed against.
    pub version: RingVersion,
    /// Fewer servers were available than requested.
    ///
    /// Not an error: callers proceed with reduced redundancy.
    pub degraded: bool,
}

impl Resolution {
    /// The primary target, if any server is on the ring.
    pub fn primary(&self) -> Option<NodeId> {
        self.targets.first().copied()
    }

    /// Whether no server is available at all.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Versioned consistent hashing ring over the active server set.
///
/// Each server is mapped to `weight` virtual nodes on a u64 ring. Routing
/// hashes the key onto the ring and walks clockwise collecting distinct
/// servers. Every change of the server set bumps the version.
#[derive(Debug, Clone)]
pub struct Ring {
    /// Virtual node positions -> physical server.
    slots: BTreeMap<SlotKey, NodeId>,
    /// Servers on the ring and their vnode counts.
    nodes: BTreeMap<NodeId, u16>,
    /// Default vnode count per server.
    vnodes_per_node: u16,
    /// Version of this server set.
    version: RingVersion,
}

impl Ring {
    /// Create a new empty ring at version 0.
    pub fn new(vnodes_per_node: u16) -> Self {
        Self {
            slots: BTreeMap::new(),
            nodes: BTreeMap::new(),
            vnodes_per_node: vnodes_per_node.max(1),
            version: RingVersion::default(),
        }
    }

    /// Build a ring holding exactly `servers`, tagged with `version`.
    ///
    /// Runs in O(servers * vnodes_per_node).
    pub fn from_servers(
        servers: impl IntoIterator<Item = NodeId>,
        vnodes_per_node: u16,
        version: RingVersion,
    ) -> Self {
        let mut ring = Self::new(vnodes_per_node);
        for node_id in servers {
            ring.insert_slots(node_id, ring.vnodes_per_node);
        }
        ring.version = version;
        ring
    }

    /// Add a server with the default vnode count.
    ///
    /// Returns `true` (and bumps the version) if the server was not on the
    /// ring yet.
    pub fn add_node(&mut self, node_id: NodeId) -> bool {
        self.add_node_with_weight(node_id, self.vnodes_per_node)
    }

    /// Add a server with an explicit vnode count.
    ///
    /// Re-adding a server with a different weight replaces its vnodes and
    /// counts as a change.
    pub fn add_node_with_weight(&mut self, node_id: NodeId, weight: u16) -> bool {
        let weight = weight.max(1);
        if self.nodes.get(&node_id) == Some(&weight) {
            return false;
        }

        self.slots.retain(|_, owner| *owner != node_id);
        self.insert_slots(node_id, weight);
        self.version = self.version.next();

        debug!(%node_id, weight, version = %self.version, "added server to ring");
        true
    }

    /// Remove a server from the ring.
    ///
    /// Returns `true` (and bumps the version) if the server was present.
    pub fn remove_node(&mut self, node_id: &NodeId) -> bool {
        if self.nodes.remove(node_id).is_none() {
            return false;
        }

        self.slots.retain(|_, owner| owner != node_id);
        self.version = self.version.next();

        debug!(%node_id, version = %self.version, "removed server from ring");
        true
    }

    /// Route a key to `replica_count` distinct servers.
    ///
    /// The first target is the owner of the nearest slot clockwise from the
    /// key's position; the rest are the next distinct owners. If fewer
    /// servers exist, all of them are returned and the resolution is marked
    /// degraded.
    pub fn resolve(&self, key: &[u8], replica_count: usize) -> Resolution {
        let wanted = replica_count.max(1);
        let targets = self.owners(key_position(key), wanted);
        let degraded = targets.len() < wanted;

        if degraded {
            debug!(
                wanted,
                available = targets.len(),
                version = %self.version,
                "degraded route: not enough servers for requested replicas"
            );
        }

        Resolution {
            targets,
            version: self.version,
            degraded,
        }
    }

    /// Walk clockwise from `position`, collecting up to `count` distinct
    /// servers.
    pub fn owners(&self, position: u64, count: usize) -> Vec<NodeId> {
        if self.slots.is_empty() || count == 0 {
            return Vec::new();
        }

        let max_distinct = count.min(self.nodes.len());
        let mut owners = Vec::with_capacity(max_distinct);

        // Everything at or after the position, then wrap around.
        let start: SlotKey = (position, Reverse(NodeId::MAX));
        let after = self.slots.range(start..);
        let before = self.slots.range(..start);

        for (_, node_id) in after.chain(before) {
            if !owners.contains(node_id) {
                owners.push(*node_id);
                if owners.len() == max_distinct {
                    break;
                }
            }
        }

        owners
    }

    /// Return the version of this server set.
    pub fn version(&self) -> RingVersion {
        self.version
    }

    /// Return the number of servers on the ring.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Return the total number of vnodes on the ring.
    pub fn vnode_count(&self) -> usize {
        self.slots.len()
    }

    /// Whether a server owns slots on this ring.
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// All servers on the ring in ascending ID order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// Return the default vnode count.
    pub fn vnodes_per_node(&self) -> u16 {
        self.vnodes_per_node
    }

    fn insert_slots(&mut self, node_id: NodeId, weight: u16) {
        for i in 0..weight {
            self.slots
                .insert((vnode_position(&node_id, i), Reverse(node_id)), node_id);
        }
        self.nodes.insert(node_id, weight);
    }
}

/// Compute a vnode's position: blake3(node_id ++ vnode_index) truncated to u64.
fn vnode_position(node_id: &NodeId, vnode_index: u16) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(node_id.as_ref());
    hasher.update(&vnode_index.to_le_bytes());
    truncate(hasher.finalize())
}

/// Compute a key's position on the ring: blake3(key) truncated to u64.
pub fn key_position(key: &[u8]) -> u64 {
    truncate(blake3::hash(key))
}

fn truncate(hash: blake3::Hash) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}
