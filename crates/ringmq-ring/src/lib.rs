//! Consistent hashing ring for deterministic message routing.
//!
//! This crate maps a message key to an ordered list of candidate servers
//! (primary first, then replicas). Every ring carries a [`RingVersion`];
//! a route is always reported together with the version it was computed
//! against so dispatchers can detect that the server set moved under them.
//!
//! The ring uses virtual nodes (vnodes): each server gets multiple
//! positions on the ring, determined by `blake3(node_id ++ vnode_index)`.
//!
//! [`RingVersion`]: ringmq_types::RingVersion

mod ring;

pub use ring::{Resolution, Ring, key_position};
