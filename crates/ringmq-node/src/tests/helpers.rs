//! Shared test utilities for ringmq-node tests.

use std::sync::Arc;
use std::time::Duration;

use ringmq_net::MemoryTransport;
use ringmq_queue::Wait;
use ringmq_types::Role;
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::fabric::Fabric;
use crate::runtime::{NodeRuntime, RuntimeState};

/// Node config with fast timings.
pub fn test_config(name: &str, role: Role) -> NodeConfig {
    NodeConfig::new(name, role).with_test_timings()
}

/// A fabric with fast timings over a plain in-process transport.
pub fn test_fabric() -> Arc<Fabric> {
    Fabric::new(test_config("fabric", Role::Server).membership_config())
}

/// A fabric whose transport the test keeps for fault injection.
pub fn faulty_fabric() -> (Arc<Fabric>, Arc<MemoryTransport>) {
    let transport = Arc::new(MemoryTransport::new());
    let fabric = Fabric::with_transport(
        test_config("fabric", Role::Server).membership_config(),
        transport.clone(),
    );
    (fabric, transport)
}

/// Initialize a server named `name` on `fabric`.
pub async fn server(fabric: &Arc<Fabric>, name: &str) -> Arc<NodeRuntime> {
    let runtime = NodeRuntime::new(fabric.clone());
    runtime
        .initialize(test_config(name, Role::Server), Role::Server, false)
        .await
        .unwrap();
    Arc::new(runtime)
}

/// Initialize a slave named `name` on `fabric`.
pub async fn slave(fabric: &Arc<Fabric>, name: &str, auto_rejoin: bool) -> Arc<NodeRuntime> {
    let runtime = NodeRuntime::new(fabric.clone());
    runtime
        .initialize(test_config(name, Role::Slave), Role::Slave, auto_rejoin)
        .await
        .unwrap();
    Arc::new(runtime)
}

/// Serve `runtime`'s inbox, answering every request with `Reply(<body>)`.
///
/// The task ends when the inbox closes.
pub fn spawn_echo(runtime: Arc<NodeRuntime>) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut served = 0;
        loop {
            match runtime
                .receive(None, Wait::For(Duration::from_millis(50)))
                .await
            {
                Ok(received) => {
                    let body = format!("Reply({})", String::from_utf8_lossy(&received.body));
                    if runtime.reply(&received.reply_ref, body).await.is_ok() {
                        served += 1;
                    }
                }
                Err(NodeError::Timeout) => continue,
                Err(_) => break,
            }
        }
        served
    })
}

/// Poll until `runtime` reaches `state` or `timeout` elapses.
pub async fn wait_for_state(runtime: &NodeRuntime, state: RuntimeState, timeout: Duration) -> bool {
    let mut states = runtime.subscribe_state();
    tokio::time::timeout(timeout, states.wait_for(|s| *s == state))
        .await
        .is_ok_and(|r| r.is_ok())
}

/// Poll `check` every 10ms until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
