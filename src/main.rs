//! Standalone discovery node.
//!
//! Listens for TCP connections, dials the configured seeds, and keeps its
//! routing table fresh until killed.
//!
//! # Usage
//!
//! ```bash
//! sdht-discovery --listen 0.0.0.0:20338 --seed 10.0.0.1:20338
//! RUST_LOG=sdht_discovery=debug sdht-discovery --config node.toml
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use rand::RngCore;
use tokio::net::TcpListener;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sdht_discovery::{derive_node_id, server, DiscoveryConfig, DiscoveryNetwork, DiscoveryNode, TcpNetwork};

/// How often routing table statistics are logged.
const STATS_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Parser, Debug)]
#[command(name = "sdht-discovery", about = "Kademlia peer discovery node")]
struct Args {
    /// TOML configuration file. Flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to accept connections on.
    #[arg(long)]
    listen: Option<String>,

    /// Seed peer to dial on startup, `host:port`. May be repeated.
    #[arg(long = "seed")]
    seeds: Vec<String>,

    /// IP address hidden from peers outside the mask list. May be repeated.
    #[arg(long = "mask")]
    mask: Vec<String>,

    /// Refresh loop period in milliseconds.
    #[arg(long)]
    refresh_period_ms: Option<u64>,

    /// Stable identity string; the node id is its BLAKE3 hash. Random if unset.
    #[arg(long)]
    identity: Option<String>,
}

impl Args {
    fn into_config(self) -> Result<(DiscoveryConfig, Option<String>)> {
        let mut config = match &self.config {
            Some(path) => DiscoveryConfig::from_toml_file(path)?,
            None => DiscoveryConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        config.seeds.extend(self.seeds);
        config.mask.extend(self.mask);
        if let Some(period) = self.refresh_period_ms {
            config.refresh_period_ms = period;
        }
        Ok((config, self.identity))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config, identity) = Args::parse().into_config()?;

    let local = match identity {
        Some(identity) => derive_node_id(identity.as_bytes()),
        None => {
            let mut secret = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut secret);
            derive_node_id(&secret)
        }
    };

    let listener = TcpListener::bind(&config.listen).await?;
    let (network, events) = TcpNetwork::new(local, listener.local_addr()?);
    let node = DiscoveryNode::new(network.clone(), &config)?;

    info!(
        id = %hex::encode(local),
        listen = %network.listen_addr(),
        seeds = config.seeds.len(),
        "discovery node started"
    );

    tokio::spawn(server::run_events(node.clone(), events));
    for seed in &config.seeds {
        let network = network.clone();
        let seed = seed.clone();
        tokio::spawn(async move {
            if let Err(err) = network.connect(&seed).await {
                warn!(%seed, "seed dial failed: {err:?}");
            }
        });
    }
    node.start();

    let stats_node = node.clone();
    let stats_network = network.clone();
    tokio::spawn(async move {
        let mut interval = time::interval(STATS_INTERVAL);
        loop {
            interval.tick().await;
            let table = stats_node.dht().routing_table();
            info!(
                peers = table.len(),
                connected = stats_network.peer_count(),
                buckets = table.bucket_count(),
                searches = stats_node.active_searches(),
                "routing table stats"
            );
        }
    });

    server::serve(listener, network).await
}
