//! Chaos test: flapping links.
//!
//! Transient delivery failures and partitions shorter than the failure
//! detector's threshold must be absorbed: no eviction, no lost or
//! duplicated packets.

use std::collections::HashSet;
use std::time::Duration;

use ringmq_integration_tests::{SETTLE, TestCluster, wait_for_state};
use ringmq_node::RuntimeState;
use ringmq_queue::Wait;

/// Every server fails its next two deliveries; the retry budget covers it.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_transient_failures_absorbed() {
    let mut c = TestCluster::new(3, 1).await;
    c.echo_all();
    let slave = c.slave(0).clone();
    let handle = slave.open().unwrap();
    let version = c.fabric().membership().version();

    for round in 0..10 {
        for i in 0..3 {
            c.transport().inject_transient(c.server_id(i), 2).await;
        }
        let body = format!("round-{round}");
        let receipt = slave.send(handle, body.clone(), false).await.unwrap();
        let reply = slave
            .receive_reply(handle, receipt.correlation_id, Wait::For(SETTLE))
            .await
            .unwrap();
        assert_eq!(reply.body, format!("Reply({body})").into_bytes());
    }

    assert_eq!(c.fabric().membership().version(), version);
    for i in 0..3 {
        assert!(c.is_member(c.server_id(i)));
    }

    c.shutdown().await;
}

/// A slave whose link drops for less than the suspect threshold flips to
/// SUSPECT and back without being evicted or changing generation.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_short_outages_do_not_evict() {
    let mut c = TestCluster::new(1, 1).await;
    c.echo_all();
    let slave = c.slave(0).clone();
    let slave_id = c.slave_id(0);
    let generation = slave.snapshot().node(&slave_id).unwrap().generation;

    for _ in 0..3 {
        c.partition(slave_id).await;
        assert!(wait_for_state(&slave, RuntimeState::Suspect).await);
        c.heal(slave_id).await;
        assert!(wait_for_state(&slave, RuntimeState::Active).await);
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    let node = slave.snapshot().node(&slave_id).cloned().unwrap();
    assert_eq!(node.generation, generation);

    c.shutdown().await;
}

/// Traffic sent while a server flaps reaches it exactly once per
/// successful send.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ntest::timeout(30000)]
async fn test_flapping_server_no_duplicates() {
    let c = TestCluster::new(1, 1).await;
    let slave = c.slave(0).clone();
    let server_id = c.server_id(0);
    let handle = slave.open().unwrap();

    let flapper = {
        let transport = c.transport().clone();
        tokio::spawn(async move {
            for _ in 0..5 {
                transport.inject_transient(server_id, 1).await;
                tokio::time::sleep(Duration::from_millis(15)).await;
            }
        })
    };

    let mut sent = HashSet::new();
    for i in 0..30 {
        let body = format!("flap-{i}");
        if slave.send(handle, body.clone(), false).await.is_ok() {
            sent.insert(body);
        }
    }
    flapper.await.unwrap();
    assert_eq!(sent.len(), 30);

    // The server may be briefly SUSPECT if a heartbeat drew a failure.
    assert!(wait_for_state(c.server(0), RuntimeState::Active).await);
    let mut received = HashSet::new();
    for packet in c.drain(0).await {
        let body = String::from_utf8(packet.body.to_vec()).unwrap();
        assert!(received.insert(body), "duplicate delivery");
    }
    assert_eq!(received, sent);

    c.shutdown().await;
}
