//! Chaos test: network partitions.
//!
//! Servers and slaves are cut off the transport while traffic flows. Sends
//! fail over to replicas, evicted servers leave the ring, and slaves that
//! opted into auto-rejoin come back with their handles intact.

use ringmq_integration_tests::{SETTLE, TestCluster, wait_for_state};
use ringmq_node::RuntimeState;
use ringmq_queue::Wait;
use ringmq_types::NodeState;

const WAIT: Wait = Wait::For(SETTLE);

/// Partition the primary of a handle: failover sends succeed at once,
/// and after eviction plain sends follow the new ring.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_primary_partition_fails_over() {
    let mut c = TestCluster::new(3, 1).await;
    c.echo_all();
    let slave = c.slave(0).clone();
    let handle = slave.open().unwrap();
    let primary = slave.route(handle).unwrap().primary().unwrap();
    let version = c.fabric().membership().version();

    c.partition(primary).await;

    // --- Phase 1: the primary is still on the ring, failover covers it ---
    for i in 0..5 {
        let receipt = slave.send(handle, format!("failover-{i}"), true).await.unwrap();
        assert_eq!(receipt.receivers, 1);
        let reply = slave
            .receive_reply(handle, receipt.correlation_id, WAIT)
            .await
            .unwrap();
        assert_eq!(reply.body, format!("Reply(failover-{i})").into_bytes());
    }

    // Failed attempts count as failure evidence.
    let state = c.fabric().membership().snapshot().state_of(&primary);
    assert!(matches!(state, Some(NodeState::Suspect) | None), "{state:?}");

    // --- Phase 2: eviction moves the route ---
    assert!(c.wait_evicted(primary).await);
    assert!(c.fabric().membership().version() > version);
    let route = slave.route(handle).unwrap();
    assert!(!route.targets.contains(&primary));

    let receipt = slave.send(handle, "after eviction", false).await.unwrap();
    assert!(receipt.ring_version > version);
    let reply = slave
        .receive_reply(handle, receipt.correlation_id, WAIT)
        .await
        .unwrap();
    assert_eq!(&reply.body[..], b"Reply(after eviction)");

    // --- Phase 3: the evicted server learns it was dropped ---
    c.heal(primary).await;
    let evicted = c.server_by_id(primary).unwrap();
    assert!(wait_for_state(evicted, RuntimeState::Terminated).await);
    assert!(evicted.is_exiting());

    c.shutdown().await;
}

/// Broadcast during a partition reports the partial count; the missing
/// server's reply never arrives and the others do.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_broadcast_during_partition() {
    let mut c = TestCluster::new(4, 1).await;
    c.echo_all();
    let slave = c.slave(0).clone();
    let handle = slave.open().unwrap();

    c.partition(c.server_id(2)).await;
    let receipt = slave.broadcast(handle, "partial").await.unwrap();
    assert_eq!(receipt.receivers, 3);

    for _ in 0..3 {
        let reply = slave
            .receive_reply(handle, receipt.correlation_id, WAIT)
            .await
            .unwrap();
        assert_eq!(&reply.body[..], b"Reply(partial)");
    }

    c.shutdown().await;
}

/// A slave with auto-rejoin survives eviction: it rejoins under a new
/// generation and keeps using the handles it opened before.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_slave_rejoins_with_handles() {
    let mut c = TestCluster::new(2, 1).await;
    c.echo_all();
    let slave = c.slave(0).clone();
    let slave_id = c.slave_id(0);
    let handles: Vec<_> = (0..3).map(|_| slave.open().unwrap()).collect();
    let generation = slave.snapshot().node(&slave_id).unwrap().generation;

    c.partition(slave_id).await;
    assert!(wait_for_state(&slave, RuntimeState::Suspect).await);
    assert!(c.wait_evicted(slave_id).await);
    assert!(!slave.is_exiting());

    c.heal(slave_id).await;
    assert!(wait_for_state(&slave, RuntimeState::Active).await);
    let node = slave.snapshot().node(&slave_id).cloned().unwrap();
    assert!(node.generation > generation);

    for (i, handle) in handles.iter().enumerate() {
        let body = format!("rejoined-{i}");
        slave.send(*handle, body.clone(), true).await.unwrap();
        let reply = slave.receive(Some(*handle), WAIT).await.unwrap();
        assert_eq!(reply.body, format!("Reply({body})").into_bytes());
    }

    c.shutdown().await;
}

/// Without auto-rejoin, eviction is final: the runtime terminates and every
/// operation fails.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_slave_without_rejoin_gives_up() {
    let c = TestCluster::without_rejoin(1, 1).await;
    let slave = c.slave(0).clone();
    let slave_id = c.slave_id(0);
    let handle = slave.open().unwrap();

    c.partition(slave_id).await;
    assert!(c.wait_evicted(slave_id).await);
    c.heal(slave_id).await;

    assert!(wait_for_state(&slave, RuntimeState::Terminated).await);
    assert!(slave.is_exiting());
    assert_eq!(
        slave.send(handle, "x", true).await.unwrap_err().code(),
        "NOT_READY"
    );
    assert_eq!(slave.open().unwrap_err().code(), "NOT_READY");

    c.shutdown().await;
}

/// Losing every server leaves nothing to route to.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_all_servers_gone_no_route() {
    let c = TestCluster::new(2, 1).await;
    let slave = c.slave(0).clone();
    let handle = slave.open().unwrap();

    for i in 0..2 {
        c.partition(c.server_id(i)).await;
    }
    for i in 0..2 {
        assert!(c.wait_evicted(c.server_id(i)).await);
    }

    let err = slave.send(handle, "anyone?", true).await.unwrap_err();
    assert_eq!(err.code(), "NO_ROUTE");
    let err = slave.broadcast(handle, "anyone?").await.unwrap_err();
    assert_eq!(err.code(), "NO_ROUTE");

    c.shutdown().await;
}
