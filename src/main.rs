use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use overlay_dht::{Node, NodeConfig, NodeId, PeerIdentity, SimulatorNetwork};

/// Runs an in-memory overlay of simulated nodes and reports on it.
#[derive(Parser, Debug)]
#[command(name = "overlay-dht")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of simulated nodes.
    #[arg(short, long, default_value = "16")]
    nodes: usize,

    /// Copies kept of every stored record.
    #[arg(short, long, default_value = "5")]
    redundancy: usize,

    /// Seconds between record-store refreshes.
    #[arg(long, default_value = "30")]
    refresh_interval: u64,

    /// Seconds between status reports.
    #[arg(short, long, default_value = "10")]
    telemetry_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    if args.nodes == 0 {
        anyhow::bail!("at least one node is required");
    }

    let mut config = NodeConfig::default();
    config.dht.redundancy_factor = args.redundancy;
    config.record_store.refresh_interval = Duration::from_secs(args.refresh_interval);

    let network = SimulatorNetwork::new();
    let mut nodes = Vec::with_capacity(args.nodes);
    for _ in 0..args.nodes {
        let identity = PeerIdentity::bare(NodeId::random());
        nodes.push(Node::spawn_simulated(&network, identity, config.clone()).await);
    }

    let first = nodes.first().context("no nodes spawned")?;
    first.join(Vec::new()).await?;
    let entry = vec![first.identity().clone()];
    for node in nodes.iter().skip(1) {
        if let Err(e) = node.join(entry.clone()).await {
            warn!(node = %node.node_id().to_hex(), error = %e, "join failed");
        }
    }
    info!(nodes = nodes.len(), "overlay formed");

    for node in &nodes {
        node.publish_self().await;
    }

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                match first.discover_entry_points().await {
                    Ok(holders) => info!(holders = holders.len(), "entry point record"),
                    Err(e) => warn!(error = %e, "entry point lookup failed"),
                }
                let stats = first.stats().await;
                info!(
                    state = ?stats.state,
                    routing_contacts = stats.routing_contacts,
                    stored_keys = stats.stored_keys,
                    stale_keys = stats.stale_keys,
                    delivered_ids = stats.delivered_ids,
                    "telemetry snapshot"
                );
            }
        }
    }

    for node in &nodes {
        node.stop().await;
    }
    Ok(())
}
