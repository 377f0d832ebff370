//! Integration test: routing across ring changes.
//!
//! Route determinism across fabrics, handle pinning, and how traffic moves
//! when servers join or leave.

use std::collections::HashMap;

use ringmq_integration_tests::{SETTLE, TestCluster, eventually};
use ringmq_queue::{Wait, routing_key};
use ringmq_ring::Ring;
use ringmq_types::{MsgId, NodeId, RingVersion};

/// Two independent fabrics with the same membership route every key the
/// same way.
#[tokio::test]
async fn test_routes_agree_across_fabrics() {
    let a = TestCluster::new(5, 0).await;
    let b = TestCluster::new(5, 0).await;

    let snap_a = a.fabric().membership().snapshot();
    let snap_b = b.fabric().membership().snapshot();
    assert_eq!(snap_a.version(), snap_b.version());

    let origin = NodeId::from_name("slave-0");
    for raw in 1..200 {
        let key = routing_key(&origin, MsgId::new(raw));
        assert_eq!(
            snap_a.resolve(&key, 3).targets,
            snap_b.resolve(&key, 3).targets
        );
    }

    a.shutdown().await;
    b.shutdown().await;
}

/// The fabric's ring matches a ring built offline from the same servers.
#[tokio::test]
async fn test_fabric_ring_matches_offline_ring() {
    let c = TestCluster::new(3, 0).await;
    let snapshot = c.fabric().membership().snapshot();
    let offline = Ring::from_servers(
        (0..3).map(|i| c.server_id(i)),
        snapshot.ring().vnodes_per_node(),
        RingVersion(0),
    );

    for i in 0..100u32 {
        let key = format!("key-{i}");
        assert_eq!(
            snapshot.resolve(key.as_bytes(), 2).targets,
            offline.resolve(key.as_bytes(), 2).targets
        );
    }

    c.shutdown().await;
}

/// Without failover, one handle's traffic lands on one server.
#[tokio::test]
async fn test_handle_pinned_to_one_server() {
    let c = TestCluster::new(4, 1).await;
    let slave = c.slave(0);
    let handle = slave.open().unwrap();
    let primary = slave.route(handle).unwrap().primary().unwrap();

    for i in 0..10 {
        slave.send(handle, format!("m{i}"), false).await.unwrap();
    }

    for i in 0..4 {
        let got = c.drain(i).await.len();
        let expected = if c.server_id(i) == primary { 10 } else { 0 };
        assert_eq!(got, expected, "server {i}");
    }

    c.shutdown().await;
}

/// Handles spread across servers.
#[tokio::test]
async fn test_handles_spread_over_servers() {
    let c = TestCluster::new(4, 1).await;
    let slave = c.slave(0);

    let mut per_server: HashMap<NodeId, usize> = HashMap::new();
    for _ in 0..64 {
        let handle = slave.open().unwrap();
        let primary = slave.route(handle).unwrap().primary().unwrap();
        *per_server.entry(primary).or_default() += 1;
    }
    assert!(per_server.len() >= 3, "poor spread: {per_server:?}");

    c.shutdown().await;
}

/// A joining server takes over only part of the key space.
#[tokio::test]
async fn test_join_moves_only_some_routes() {
    let mut c = TestCluster::new(3, 1).await;
    let slave = c.slave(0).clone();
    let handles: Vec<MsgId> = (0..100).map(|_| slave.open().unwrap()).collect();

    let before: Vec<NodeId> = handles
        .iter()
        .map(|h| slave.route(*h).unwrap().primary().unwrap())
        .collect();
    let version = c.fabric().membership().version();

    let new = c.add_server().await;
    let new_id = c.server_id(new);
    assert!(c.fabric().membership().version() > version);

    let mut moved = 0;
    for (h, old) in handles.iter().zip(&before) {
        let now = slave.route(*h).unwrap().primary().unwrap();
        if now != *old {
            assert_eq!(now, new_id, "a key moved between two old servers");
            moved += 1;
        }
    }
    assert!(moved > 0 && moved < 100, "moved {moved} of 100");

    c.shutdown().await;
}

/// After a server leaves gracefully, its handles route elsewhere and sends
/// keep working.
#[tokio::test]
async fn test_graceful_leave_reroutes() {
    let mut c = TestCluster::new(3, 1).await;
    c.echo_all();
    let slave = c.slave(0).clone();
    let handle = slave.open().unwrap();
    let primary = slave.route(handle).unwrap().primary().unwrap();

    c.server_by_id(primary).unwrap().shutdown().await;
    assert!(eventually(SETTLE, || !c.is_member(primary)).await);

    let route = slave.route(handle).unwrap();
    assert!(!route.targets.contains(&primary));

    slave.send(handle, "after leave", false).await.unwrap();
    let reply = slave.receive(Some(handle), Wait::For(SETTLE)).await.unwrap();
    assert_eq!(&reply.body[..], b"Reply(after leave)");

    c.shutdown().await;
}
