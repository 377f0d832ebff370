//! `ringmqd`: command-line tool for ringmq.
//!
//! # Usage
//!
//! ```text
//! ringmqd check -c node.toml                  # validate a node config
//! ringmqd route --servers 5 --replicas 2 key  # where would `key` go
//! ringmqd demo --servers 3                    # run the scenarios in-process
//! ```

mod telemetry;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use ringmq_node::{Fabric, NodeConfig, NodeError, NodeRuntime};
use ringmq_queue::Wait;
use ringmq_ring::Ring;
use ringmq_types::{NodeId, RingVersion, Role};
use tokio::task::JoinHandle;
use tracing::{debug, info};

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "ringmqd", version, about = "ringmq consistent-hashing message fabric")]
struct Cli {
    /// Path to a TOML node config file.
    #[arg(short, long, global = true, env = "RINGMQ_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a node config and print the effective values.
    Check,

    /// Build a ring of N servers and show how a key resolves.
    Route {
        /// Number of servers on the ring.
        #[arg(short, long, default_value = "3")]
        servers: usize,

        /// Candidates to resolve (primary + replicas). Defaults to the
        /// config's `ring.replicas`.
        #[arg(short, long)]
        replicas: Option<usize>,

        /// Routing key.
        key: String,
    },

    /// Run the send/reply, broadcast and close scenarios on an in-process
    /// fabric.
    Demo {
        /// Number of servers to start.
        #[arg(short, long, default_value = "3")]
        servers: usize,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    telemetry::init(&config.log.level);

    match cli.command {
        Commands::Check => cmd_check(cli.config.as_deref(), &config),
        Commands::Route {
            servers,
            replicas,
            key,
        } => cmd_route(&config, servers, replicas, &key),
        Commands::Demo { servers } => cmd_demo(&config, servers).await,
    }
}

/// Load the config file if one was given, defaults otherwise.
fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    match path {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(NodeConfig::default()),
    }
}

// -----------------------------------------------------------------------
// ringmqd check
// -----------------------------------------------------------------------

fn cmd_check(path: Option<&Path>, config: &NodeConfig) -> Result<()> {
    match path {
        Some(path) => println!("{}: ok", path.display()),
        None => println!("no config file given, showing defaults"),
    }
    let role = config
        .node
        .role
        .map_or_else(|| "(any)".to_string(), |r| r.to_string());

    println!("[node]");
    println!("  name:     {}", config.node.name);
    println!("  node id:  {}", NodeId::from_name(&config.node.name));
    println!("  role:     {role}");
    println!("  address:  {}", config.node.address);
    println!("[ring]");
    println!("  replicas: {}", config.ring.replicas);
    println!("  vnodes:   {}", config.ring.vnodes_per_node);
    println!("[membership]");
    println!("  heartbeat:      {} ms", config.membership.heartbeat_interval_ms);
    println!("  suspect after:  {} misses", config.membership.suspect_after_misses);
    println!("  dead timeout:   {} ms", config.membership.dead_timeout_ms);
    println!("  join timeout:   {} ms", config.membership.join_timeout_ms);
    println!("[transport]");
    println!("  max retries:    {}", config.transport.max_retries);
    println!(
        "  backoff:        {}..{} ms",
        config.transport.retry_backoff_ms, config.transport.max_backoff_ms
    );
    println!("[queue]");
    println!("  max handles:    {}", config.queue.max_handles);
    println!("  reply timeout:  {} ms", config.queue.reply_timeout_ms);
    println!("[log]");
    println!("  level:          {}", config.log.level);
    Ok(())
}

// -----------------------------------------------------------------------
// ringmqd route
// -----------------------------------------------------------------------

fn cmd_route(config: &NodeConfig, servers: usize, replicas: Option<usize>, key: &str) -> Result<()> {
    let replicas = replicas.unwrap_or(config.ring.replicas);
    if replicas == 0 {
        bail!("--replicas must be at least 1");
    }

    let names: HashMap<NodeId, String> = (1..=servers)
        .map(|i| {
            let name = format!("server-{i}");
            (NodeId::from_name(&name), name)
        })
        .collect();
    let ring = Ring::from_servers(
        names.keys().copied(),
        config.ring.vnodes_per_node,
        RingVersion(1),
    );
    let resolution = ring.resolve(key.as_bytes(), replicas);

    println!(
        "ring {} with {} servers, {} vnodes",
        resolution.version,
        ring.node_count(),
        ring.vnode_count()
    );
    if resolution.is_empty() {
        println!("no route: the ring is empty");
        return Ok(());
    }
    for (i, target) in resolution.targets.iter().enumerate() {
        let label = if i == 0 { "primary" } else { "replica" };
        let name = names.get(target).map_or("?", String::as_str);
        println!("  {label:<8} {name:<12} {target}");
    }
    if resolution.degraded {
        println!(
            "degraded: wanted {replicas} targets, {} available",
            resolution.targets.len()
        );
    }
    Ok(())
}

// -----------------------------------------------------------------------
// ringmqd demo
// -----------------------------------------------------------------------

/// What the demo observed.
#[derive(Debug, Default)]
struct DemoReport {
    reply: String,
    broadcast_receivers: usize,
    utf8_replies: Vec<String>,
    send_after_close_failed: bool,
}

async fn cmd_demo(config: &NodeConfig, servers: usize) -> Result<()> {
    if servers == 0 {
        bail!("--servers must be at least 1");
    }
    println!("ringmq demo: {servers} servers, 1 slave");

    let start = Instant::now();
    let report = run_demo(config, servers).await?;

    println!("  send/reply:        {:?}", report.reply);
    println!("  broadcast:         {} receivers", report.broadcast_receivers);
    for reply in &report.utf8_replies {
        println!("  utf-8:             {reply:?}");
    }
    println!(
        "  send after close:  {}",
        if report.send_after_close_failed { "rejected" } else { "ACCEPTED" }
    );
    println!("done in {:.2}s", start.elapsed().as_secs_f64());

    if !report.send_after_close_failed {
        bail!("send on a closed handle was accepted");
    }
    Ok(())
}

/// Start `servers` echo servers and one slave on a fresh fabric and walk
/// through the scenarios.
async fn run_demo(config: &NodeConfig, servers: usize) -> Result<DemoReport> {
    let fabric = Fabric::from_config(config);
    let wait = Wait::For(Duration::from_secs(5));

    let mut runtimes = Vec::with_capacity(servers);
    let mut echoes = Vec::with_capacity(servers);
    for i in 1..=servers {
        let runtime = Arc::new(NodeRuntime::new(fabric.clone()));
        runtime
            .initialize(node_config(config, &format!("server-{i}"), Role::Server), Role::Server, false)
            .await?;
        echoes.push(spawn_echo(runtime.clone()));
        runtimes.push(runtime);
    }

    let slave = NodeRuntime::new(fabric.clone());
    slave
        .initialize(node_config(config, "slave-1", Role::Slave), Role::Slave, true)
        .await?;
    info!(version = %fabric.membership().version(), servers, "demo fabric ready");

    let mut report = DemoReport::default();
    let h1 = slave.open()?;
    let h2 = slave.open()?;

    let receipt = slave.send(h1, "send receive.", true).await?;
    let reply = slave
        .receive_reply(h1, receipt.correlation_id, wait)
        .await?;
    report.reply = String::from_utf8_lossy(&reply.body).into_owned();

    let receipt = slave.broadcast(h2, "Broadcast message.").await?;
    report.broadcast_receivers = receipt.receivers;
    for _ in 0..receipt.receivers {
        slave
            .receive_reply(h2, receipt.correlation_id, wait)
            .await?;
    }

    for body in ["UTF-8 message.", "日本語のメッセージ。"] {
        let receipt = slave.send(h2, body, true).await?;
        let reply = slave
            .receive_reply(h2, receipt.correlation_id, wait)
            .await?;
        report
            .utf8_replies
            .push(String::from_utf8_lossy(&reply.body).into_owned());
    }

    slave.close(h1)?;
    report.send_after_close_failed = slave.send(h1, "after close", true).await.is_err();

    slave.shutdown().await;
    for runtime in &runtimes {
        runtime.shutdown().await;
    }
    for echo in echoes {
        let served = echo.await.context("echo task panicked")?;
        debug!(served, "echo server finished");
    }
    fabric.shutdown();
    Ok(report)
}

fn node_config(base: &NodeConfig, name: &str, role: Role) -> NodeConfig {
    let mut config = base.clone();
    config.node.name = name.to_string();
    config.node.role = Some(role);
    config
}

/// Answer every request on the server inbox with `Reply(<body>)` until the
/// runtime stops.
fn spawn_echo(runtime: Arc<NodeRuntime>) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut served = 0;
        loop {
            match runtime.receive(None, Wait::For(Duration::from_millis(100))).await {
                Ok(request) => {
                    let body = format!("Reply({})", String::from_utf8_lossy(&request.body));
                    if runtime.reply(&request.reply_ref, body).await.is_ok() {
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

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
