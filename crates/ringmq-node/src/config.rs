//! TOML topology file read at initialize.
//!
//! Every section and key is optional; missing values take the defaults
//! below. The file is read once per `initialize` call.
//!
//! `[membership]` timings other than `join_timeout_ms`, and
//! `[ring] vnodes_per_node`, belong to the [`Fabric`](crate::Fabric): a
//! node whose file disagrees with the fabric it joins is refused. The
//! remaining keys are per node.
//!
//! ```toml
//! [node]
//! name = "server-1"
//! role = "server"
//! address = "127.0.0.1:8020"
//!
//! [ring]
//! replicas = 2
//! vnodes_per_node = 64
//!
//! [membership]
//! heartbeat_interval_ms = 1000
//! suspect_after_misses = 3
//! dead_timeout_ms = 5000
//! join_timeout_ms = 3000
//!
//! [transport]
//! max_retries = 3
//! retry_backoff_ms = 20
//! max_backoff_ms = 500
//!
//! [queue]
//! max_handles = 4096
//! reply_timeout_ms = 30000
//!
//! [log]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use ringmq_membership::MembershipConfig;
use ringmq_net::RetryPolicy;
use ringmq_queue::QueueConfig;
use ringmq_types::Role;
use serde::Deserialize;

use crate::error::NodeError;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identity.
    pub node: NodeSection,
    /// Routing parameters.
    pub ring: RingSection,
    /// Heartbeat and failure detection timings.
    pub membership: MembershipSection,
    /// Dispatcher retry budget.
    pub transport: TransportSection,
    /// Queue limits.
    pub queue: QueueSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Logical name; the node ID is derived from it.
    pub name: String,
    /// Expected role. When set it must match the initialize call.
    pub role: Option<Role>,
    /// Advertised address.
    pub address: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: "ringmq-node".to_string(),
            role: None,
            address: "127.0.0.1:8020".to_string(),
        }
    }
}

/// `[ring]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RingSection {
    /// Candidates resolved per key (primary + replicas).
    pub replicas: usize,
    /// Vnodes per server.
    pub vnodes_per_node: u16,
}

impl Default for RingSection {
    fn default() -> Self {
        Self {
            replicas: 2,
            vnodes_per_node: 64,
        }
    }
}

/// `[membership]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MembershipSection {
    pub heartbeat_interval_ms: u64,
    pub suspect_after_misses: u32,
    pub dead_timeout_ms: u64,
    /// How long initialize waits for the first acknowledged heartbeat.
    pub join_timeout_ms: u64,
}

impl Default for MembershipSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            suspect_after_misses: 3,
            dead_timeout_ms: 5000,
            join_timeout_ms: 3000,
        }
    }
}

/// `[transport]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 20,
            max_backoff_ms: 500,
        }
    }
}

/// `[queue]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub max_handles: usize,
    pub reply_timeout_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_handles: 4096,
            reply_timeout_ms: 30_000,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Default configuration for a named node.
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        let mut config = Self::default();
        config.node.name = name.into();
        config.node.role = Some(role);
        config
    }

    /// Switch to timings suitable for fast test execution.
    pub fn with_test_timings(mut self) -> Self {
        self.membership = MembershipSection {
            heartbeat_interval_ms: 50,
            suspect_after_misses: 3,
            dead_timeout_ms: 300,
            join_timeout_ms: 2000,
        };
        self.transport = TransportSection {
            max_retries: 3,
            retry_backoff_ms: 5,
            max_backoff_ms: 40,
        };
        self.queue.reply_timeout_ms = 2000;
        self
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse and validate config from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, NodeError> {
        let config: NodeConfig = toml::from_str(s).map_err(|e| NodeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.node.name.is_empty() {
            return Err(NodeError::Config("node.name must not be empty".into()));
        }
        if self.ring.replicas == 0 {
            return Err(NodeError::Config("ring.replicas must be at least 1".into()));
        }
        if self.ring.vnodes_per_node == 0 {
            return Err(NodeError::Config("ring.vnodes_per_node must be at least 1".into()));
        }
        if self.membership.heartbeat_interval_ms == 0 {
            return Err(NodeError::Config(
                "membership.heartbeat_interval_ms must be positive".into(),
            ));
        }
        if self.membership.suspect_after_misses == 0 {
            return Err(NodeError::Config(
                "membership.suspect_after_misses must be at least 1".into(),
            ));
        }
        if self.queue.max_handles == 0 {
            return Err(NodeError::Config("queue.max_handles must be at least 1".into()));
        }
        Ok(())
    }

    /// Failure detector and ring parameters for a fabric built from this
    /// file.
    pub fn membership_config(&self) -> MembershipConfig {
        MembershipConfig {
            heartbeat_interval: Duration::from_millis(self.membership.heartbeat_interval_ms),
            suspect_after_misses: self.membership.suspect_after_misses,
            dead_timeout: Duration::from_millis(self.membership.dead_timeout_ms),
            vnodes_per_node: self.ring.vnodes_per_node,
        }
    }

    /// Dispatcher retry budget.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.transport.max_retries,
            initial_backoff: Duration::from_millis(self.transport.retry_backoff_ms),
            max_backoff: Duration::from_millis(self.transport.max_backoff_ms),
        }
    }

    /// Queue registry limits.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_handles: self.queue.max_handles,
            reply_timeout: Duration::from_millis(self.queue.reply_timeout_ms),
        }
    }

    /// How long initialize waits to reach ACTIVE.
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.membership.join_timeout_ms)
    }
}
