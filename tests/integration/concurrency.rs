//! Integration test: concurrent traffic.
//!
//! Many tasks sending on shared and separate handles; every request gets
//! exactly its own reply and nothing is lost or duplicated.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use ringmq_integration_tests::{SETTLE, TestCluster};
use ringmq_queue::Wait;

/// 4 slaves × 4 handles × 8 requests, all in flight together.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_senders_no_loss_no_duplication() {
    let mut c = TestCluster::new(3, 4).await;
    c.echo_all();

    let mut tasks = Vec::new();
    for s in 0..4 {
        for h in 0..4 {
            let slave = c.slave(s).clone();
            tasks.push(tokio::spawn(async move {
                let handle = slave.open().unwrap();
                let mut bodies = Vec::new();
                for m in 0..8 {
                    let body = format!("s{s}-h{h}-m{m}");
                    let receipt = slave.send(handle, body.clone(), true).await.unwrap();
                    let reply = slave
                        .receive_reply(handle, receipt.correlation_id, Wait::For(SETTLE))
                        .await
                        .unwrap();
                    assert_eq!(reply.body, format!("Reply({body})").into_bytes());
                    bodies.push(body);
                }
                slave.close(handle).unwrap();
                bodies
            }));
        }
    }

    let mut seen = HashSet::new();
    for bodies in join_all(tasks).await {
        for body in bodies.unwrap() {
            assert!(seen.insert(body), "duplicate body");
        }
    }
    assert_eq!(seen.len(), 4 * 4 * 8);
    assert_eq!(c.shutdown().await, 4 * 4 * 8);
}

/// Requests pipelined on one handle are answered by correlation, in any
/// order the caller asks for them.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pipelined_requests_on_one_handle() {
    let mut c = TestCluster::new(2, 1).await;
    c.echo_all();
    let slave = c.slave(0).clone();
    let handle = slave.open().unwrap();

    let mut receipts = Vec::new();
    for i in 0..20 {
        let receipt = slave.send(handle, format!("p{i}"), true).await.unwrap();
        receipts.push((i, receipt));
    }

    for (i, receipt) in receipts.into_iter().rev() {
        let reply = slave
            .receive_reply(handle, receipt.correlation_id, Wait::For(SETTLE))
            .await
            .unwrap();
        assert_eq!(reply.body, format!("Reply(p{i})").into_bytes());
    }

    c.shutdown().await;
}

/// Concurrent broadcasts each collect one reply per server.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_broadcasts() {
    let mut c = TestCluster::new(3, 2).await;
    c.echo_all();

    let runs = (0..2).flat_map(|s| (0..3).map(move |b| (s, b)));
    let tasks = runs.map(|(s, b)| {
        let slave = Arc::clone(c.slave(s));
        tokio::spawn(async move {
            let handle = slave.open().unwrap();
            let body = format!("bcast-{s}-{b}");
            let receipt = slave.broadcast(handle, body.clone()).await.unwrap();
            assert_eq!(receipt.receivers, 3);
            for _ in 0..receipt.receivers {
                let reply = slave
                    .receive_reply(handle, receipt.correlation_id, Wait::For(SETTLE))
                    .await
                    .unwrap();
                assert_eq!(reply.body, format!("Reply({body})").into_bytes());
            }
        })
    });

    for result in join_all(tasks).await {
        result.unwrap();
    }
    assert_eq!(c.shutdown().await, 2 * 3 * 3);
}

/// Closing a handle while another task waits on it releases the waiter
/// and leaves the other handles untouched.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_races_with_receive() {
    let mut c = TestCluster::new(1, 1).await;
    c.echo_all();
    let slave = c.slave(0).clone();
    let doomed = slave.open().unwrap();
    let survivor = slave.open().unwrap();

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let slave = slave.clone();
            tokio::spawn(async move { slave.receive(Some(doomed), Wait::Forever).await })
        })
        .collect();
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    slave.close(doomed).unwrap();

    for waiter in join_all(waiters).await {
        // A waiter scheduled after the close finds the handle already gone.
        let code = waiter.unwrap().unwrap_err().code();
        assert!(code == "CLOSED" || code == "INVALID_HANDLE", "{code}");
    }

    slave.send(survivor, "still here", true).await.unwrap();
    let reply = slave.receive(Some(survivor), Wait::For(SETTLE)).await.unwrap();
    assert_eq!(&reply.body[..], b"Reply(still here)");

    c.shutdown().await;
}
