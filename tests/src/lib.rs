//! Shared test harness for ringmq integration tests.
//!
//! Provides [`TestCluster`]: N servers and M slaves sharing one [`Fabric`]
//! with fast test timings. The in-process transport is kept so tests can
//! partition nodes away and inject transient delivery failures.

use std::sync::Arc;
use std::time::Duration;

use ringmq_net::MemoryTransport;
use ringmq_node::{Fabric, NodeConfig, NodeError, NodeRuntime, Received, RuntimeState};
use ringmq_queue::Wait;
use ringmq_types::{NodeId, Role};
use tokio::task::JoinHandle;
use tracing::debug;

/// Default time tests wait for a packet or a state change.
pub const SETTLE: Duration = Duration::from_secs(3);

/// Node config with fast timings.
pub fn test_config(name: &str, role: Role) -> NodeConfig {
    NodeConfig::new(name, role).with_test_timings()
}

/// N servers and M slaves on one in-process fabric.
pub struct TestCluster {
    fabric: Arc<Fabric>,
    transport: Arc<MemoryTransport>,
    servers: Vec<Arc<NodeRuntime>>,
    slaves: Vec<Arc<NodeRuntime>>,
    echoes: Vec<JoinHandle<usize>>,
    auto_rejoin: bool,
}

impl TestCluster {
    /// Start `servers` servers and `slaves` slaves. Slaves rejoin
    /// automatically; servers do not.
    pub async fn new(servers: usize, slaves: usize) -> Self {
        Self::build(servers, slaves, true, |_| {}).await
    }

    /// Start a cluster whose slaves give up on eviction.
    pub async fn without_rejoin(servers: usize, slaves: usize) -> Self {
        Self::build(servers, slaves, false, |_| {}).await
    }

    /// Start a cluster, letting `tweak` adjust every node's config.
    pub async fn build(
        servers: usize,
        slaves: usize,
        auto_rejoin: bool,
        tweak: impl Fn(&mut NodeConfig),
    ) -> Self {
        let transport = Arc::new(MemoryTransport::new());
        let mut base = test_config("cluster", Role::Server);
        tweak(&mut base);
        let fabric = Fabric::with_transport(base.membership_config(), transport.clone());

        let mut cluster = Self {
            fabric,
            transport,
            servers: Vec::new(),
            slaves: Vec::new(),
            echoes: Vec::new(),
            auto_rejoin,
        };
        for i in 0..servers {
            let mut config = test_config(&format!("server-{i}"), Role::Server);
            tweak(&mut config);
            cluster.servers.push(cluster.start(config, Role::Server, false).await);
        }
        for i in 0..slaves {
            let mut config = test_config(&format!("slave-{i}"), Role::Slave);
            tweak(&mut config);
            cluster.slaves.push(cluster.start(config, Role::Slave, auto_rejoin).await);
        }
        cluster
    }

    async fn start(&self, config: NodeConfig, role: Role, auto_rejoin: bool) -> Arc<NodeRuntime> {
        let runtime = NodeRuntime::new(self.fabric.clone());
        runtime
            .initialize(config, role, auto_rejoin)
            .await
            .unwrap_or_else(|e| panic!("failed to start {role}: {e}"));
        Arc::new(runtime)
    }

    /// Add one more server and return its index.
    pub async fn add_server(&mut self) -> usize {
        let i = self.servers.len();
        let config = test_config(&format!("server-{i}"), Role::Server);
        let server = self.start(config, Role::Server, false).await;
        self.servers.push(server);
        i
    }

    /// Add one more slave and return its index.
    pub async fn add_slave(&mut self) -> usize {
        let i = self.slaves.len();
        let config = test_config(&format!("slave-{i}"), Role::Slave);
        let slave = self.start(config, Role::Slave, self.auto_rejoin).await;
        self.slaves.push(slave);
        i
    }

    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    pub fn transport(&self) -> &Arc<MemoryTransport> {
        &self.transport
    }

    pub fn server(&self, i: usize) -> &Arc<NodeRuntime> {
        &self.servers[i]
    }

    pub fn slave(&self, i: usize) -> &Arc<NodeRuntime> {
        &self.slaves[i]
    }

    pub fn servers(&self) -> &[Arc<NodeRuntime>] {
        &self.servers
    }

    pub fn server_id(&self, i: usize) -> NodeId {
        self.servers[i].node_id().expect("server initialized")
    }

    pub fn slave_id(&self, i: usize) -> NodeId {
        self.slaves[i].node_id().expect("slave initialized")
    }

    /// The server runtime with the given ID.
    pub fn server_by_id(&self, node_id: NodeId) -> Option<&Arc<NodeRuntime>> {
        self.servers.iter().find(|s| s.node_id() == Some(node_id))
    }

    /// Answer every request on every server with `Reply(<body>)`.
    pub fn echo_all(&mut self) {
        for server in &self.servers {
            self.echoes.push(spawn_echo(server.clone()));
        }
    }

    /// Cut a node off the transport.
    pub async fn partition(&self, node_id: NodeId) {
        self.transport.partition(node_id).await;
    }

    /// Reconnect a partitioned node.
    pub async fn heal(&self, node_id: NodeId) {
        self.transport.heal(&node_id).await;
    }

    /// Whether the membership table still lists `node_id`.
    pub fn is_member(&self, node_id: NodeId) -> bool {
        self.fabric.membership().snapshot().node(&node_id).is_some()
    }

    /// Wait until the membership table no longer lists `node_id`.
    pub async fn wait_evicted(&self, node_id: NodeId) -> bool {
        eventually(SETTLE, || !self.is_member(node_id)).await
    }

    /// Take everything currently buffered in server `i`'s inbox.
    pub async fn drain(&self, i: usize) -> Vec<Received> {
        let mut drained = Vec::new();
        while let Ok(received) = self.servers[i].receive(None, Wait::Poll).await {
            drained.push(received);
        }
        drained
    }

    /// Shut every runtime down, then the fabric. Returns the number of
    /// requests the echo servers answered.
    pub async fn shutdown(self) -> usize {
        for slave in &self.slaves {
            slave.shutdown().await;
        }
        for server in &self.servers {
            server.shutdown().await;
        }
        let mut served = 0;
        for echo in self.echoes {
            served += echo.await.unwrap_or(0);
        }
        self.fabric.shutdown();
        served
    }
}

/// Serve a server's inbox, answering every request with `Reply(<body>)`.
///
/// The task ends when the server stops accepting receives.
pub fn spawn_echo(runtime: Arc<NodeRuntime>) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut served = 0;
        loop {
            match runtime
                .receive(None, Wait::For(Duration::from_millis(50)))
                .await
            {
                Ok(request) => {
                    let body = format!("Reply({})", String::from_utf8_lossy(&request.body));
                    match runtime.reply(&request.reply_ref, body).await {
                        Ok(()) => served += 1,
                        Err(e) => debug!(error = %e, "echo reply failed"),
                    }
                }
                Err(NodeError::Timeout) => continue,
                Err(NodeError::NotReady(RuntimeState::Suspect)) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(_) => break,
            }
        }
        served
    })
}

/// Wait until `runtime` reaches `state`.
pub async fn wait_for_state(runtime: &NodeRuntime, state: RuntimeState) -> bool {
    let mut states = runtime.subscribe_state();
    tokio::time::timeout(SETTLE, states.wait_for(|s| *s == state))
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

/// Receive on server `runtime` until a body equal to `expected` arrives,
/// skipping anything else.
pub async fn receive_until(runtime: &NodeRuntime, expected: &[u8]) -> Option<Received> {
    let deadline = tokio::time::Instant::now() + SETTLE;
    while tokio::time::Instant::now() < deadline {
        match runtime
            .receive(None, Wait::For(Duration::from_millis(100)))
            .await
        {
            Ok(received) if received.body == expected => return Some(received),
            Ok(_) | Err(NodeError::Timeout) => continue,
            Err(_) => return None,
        }
    }
    None
}
