//! Node command implementation
//!
//! This module implements the `acablock node` command: it starts a node,
//! joins the network through an optional seed host and hands the terminal
//! over to the records menu until the operator quits or sends Ctrl+C.

use anyhow::{Context, Result};
use clap::Args;
use std::net::SocketAddr;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use acablock_federation::{LedgerNode, NodeConfig, TransportConfig};

use super::menu;

const DEFAULT_LOG_FILTER: &str = "acablock=info";

/// Arguments for the node command
#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Local address to listen on [IP:PORT]
    #[arg(short, long, default_value = "127.0.0.1:9000")]
    pub listen: String,
    /// Existing host to join through [HOST:PORT] (omit to be the first host)
    #[arg(short, long)]
    pub seed: Option<String>,
    /// Address announced to peers (defaults to the listen address)
    #[arg(long)]
    pub advertise: Option<String>,
    /// How long to wait for the seed's chain
    #[arg(long, default_value_t = 10000)]
    pub join_timeout_ms: u64,
    /// Per-operation network timeout
    #[arg(long, default_value_t = 5000)]
    pub io_timeout_ms: u64,
    /// Maximum number of connections handled at once
    #[arg(long, default_value_t = 64)]
    pub max_handlers: usize,
}

impl NodeArgs {
    /// Validate the addresses and build the node configuration
    pub fn to_config(&self) -> Result<NodeConfig> {
        parse_peer_address(&self.listen)?;
        if let Some(seed) = &self.seed {
            validate_host_port(seed)?;
        }
        if let Some(advertise) = &self.advertise {
            validate_host_port(advertise)?;
        }
        anyhow::ensure!(self.max_handlers > 0, "--max-handlers must be at least 1");

        let defaults = NodeConfig::default();
        Ok(NodeConfig {
            listen_addr: self.listen.trim().to_string(),
            advertise_addr: self.advertise.as_deref().map(|a| a.trim().to_string()),
            transport: TransportConfig {
                io_timeout_ms: self.io_timeout_ms,
                max_concurrent_handlers: self.max_handlers,
                ..TransportConfig::default()
            },
            join_timeout_ms: self.join_timeout_ms,
            ..defaults
        })
    }
}

/// Execute the node command
pub async fn execute_node_command(args: NodeArgs) -> Result<()> {
    let config = args.to_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    println!("==== Academic Block APP ====");
    println!("🌐 Starting Acablock node...");
    println!("🔌 Listen: {}", config.listen_addr);
    match &args.seed {
        Some(seed) => println!("🤝 Seed host: {}", seed),
        None => println!("🌱 No seed host, starting as the first host"),
    }
    println!();

    let node = LedgerNode::start_listening(config)
        .await
        .context("Failed to start Acablock node")?;
    println!("📡 Node listening on: {}", node.local_addr());

    node.join_network(args.seed.as_deref())
        .await
        .context("Failed to join the network")?;
    println!("✅ Joined the network");
    println!();

    print_node_status(&node).await;

    println!("🔄 Node running... choose q or press Ctrl+C to shutdown");
    let mut input = menu::spawn_stdin_reader();
    let outcome = tokio::select! {
        result = menu::run(&node, &mut input) => result,
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    println!("\n🛑 Shutting down node...");
    node.shutdown();
    println!("✅ Node shutdown complete");
    outcome
}

/// Print current node status
pub async fn print_node_status(node: &LedgerNode) {
    let chain = node.chain_stats().await;
    let gossip = node.gossip_stats();

    println!("📈 Node Status:");
    println!("   Local host: {}", node.local_addr());
    println!("   Join state: {:?}", node.join_state());
    println!("   Known peers: {}", node.list_peers().await.len());
    println!("   Blocks: {}", chain.total_blocks);
    println!("   Records: {}", chain.record_count);
    println!("   Latest hash: {}", chain.latest_hash);
    if let Some(latest) = &chain.latest_timestamp {
        println!("   Latest block at: {}", latest);
    }
    println!("   Messages handled: {}", gossip.messages_handled);
    println!("   Malformed messages: {}", gossip.malformed_messages);
    println!(
        "   Rejected chains/blocks: {}/{}",
        gossip.chains_rejected, gossip.blocks_rejected
    );
    println!("   Failed sends: {}", gossip.sends_failed);
    println!();
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Parse a host address with helpful error messages
pub fn parse_peer_address(peer_str: &str) -> Result<SocketAddr> {
    peer_str.trim().parse().with_context(|| {
        format!(
            "Invalid host address '{}'. Expected format: IP:PORT (e.g., 127.0.0.1:9001)",
            peer_str
        )
    })
}

/// Check a `host:port` peer address; the host may be a name or an IP
pub fn validate_host_port(addr: &str) -> Result<()> {
    let addr = addr.trim();
    let (host, port) = addr.rsplit_once(':').with_context(|| {
        format!(
            "Invalid host address '{}'. Expected format: HOST:PORT (e.g., node-a.local:9001)",
            addr
        )
    })?;
    anyhow::ensure!(
        !host.is_empty() && !host.contains(',') && !host.contains(char::is_whitespace),
        "Invalid host in address '{}'",
        addr
    );
    port.parse::<u16>()
        .with_context(|| format!("Invalid port in address '{}'", addr))?;
    Ok(())
}
