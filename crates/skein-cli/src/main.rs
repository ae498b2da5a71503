//! skein — mesh overlay chat demo.
//!
//! Runs one mesh node over the TCP adapter and turns stdin into broadcast
//! messages. Point a few instances at each other with `--seed` and watch
//! routes build.

mod config;

use clap::{Parser, Subcommand};
use config::Config;
use skein_core::{DataPayload, MeshNode, NodeConfig, PeerEvent};
use skein_transport::{DiscoveredPeer, TcpAdapter, TcpAdapterConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// skein - peer-to-peer mesh overlay demo
#[derive(Parser)]
#[command(name = "skein")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output (implies --verbose)
    #[arg(short, long)]
    debug: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/skein/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the mesh and chat over broadcasts
    Chat {
        /// Display name
        #[arg(short, long)]
        username: Option<String>,

        /// TCP listen address
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Seed peers to probe (repeatable)
        #[arg(short, long)]
        seed: Vec<SocketAddr>,

        /// Hop budget for sent messages
        #[arg(long)]
        ttl: Option<u32>,
    },

    /// Print a fresh peer id
    Id,
}

fn init_logging(cli: &Cli, configured_level: &str) {
    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        configured_level
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("skein={level},skein_core={level},skein_transport={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let file = Config::load(&expand_tilde(&cli.config))?;
    init_logging(&cli, &file.logging.level);

    match cli.command {
        Commands::Id => {
            println!("{}", Uuid::new_v4());
            Ok(())
        }
        Commands::Chat {
            username,
            listen,
            seed,
            ttl,
        } => chat(file, username, listen, seed, ttl).await,
    }
}

async fn chat(
    file: Config,
    username: Option<String>,
    listen: Option<SocketAddr>,
    seeds: Vec<SocketAddr>,
    ttl: Option<u32>,
) -> Result<(), Box<dyn std::error::Error>> {
    let username = username
        .or(file.node.username)
        .unwrap_or_else(|| format!("peer-{}", &Uuid::new_v4().to_string()[..8]));

    let mut node_config = NodeConfig::new(&username)
        .with_auto_connect(file.node.auto_connect)
        .with_auto_advertise(file.node.auto_advertise);
    if let Some(peer_id) = file.node.peer_id {
        node_config = node_config.with_peer_id(peer_id);
    }
    if let Some(service) = file.node.service_name {
        node_config = node_config.with_service_name(service);
    }
    if let Some(ttl) = ttl.or(file.node.default_ttl) {
        node_config = node_config.with_default_ttl(ttl);
    }

    let listen_addr = match listen {
        Some(addr) => addr,
        None => file.network.listen_addr.parse()?,
    };
    let mut seed_addrs = seeds;
    for seed in &file.network.seeds {
        seed_addrs.push(seed.parse()?);
    }

    let adapter = Arc::new(TcpAdapter::new(
        DiscoveredPeer::new(&node_config.peer_id, &username),
        TcpAdapterConfig {
            listen_addr,
            seeds: seed_addrs,
        },
    ));

    let node = MeshNode::new(node_config);
    node.add_adapter(adapter.clone()).await?;
    node.start().await?;

    println!("peer id:  {}", node.peer_id());
    if let Some(addr) = adapter.local_addr() {
        println!("listening {addr}");
    }
    println!("type to broadcast; /peers, /ping <id>, /quit");

    // Printer for inbound traffic and peer churn.
    {
        let mut messages = node.on_message();
        tokio::spawn(async move {
            while let Ok(message) = messages.recv().await {
                let text = message
                    .decode_payload::<DataPayload>()
                    .map(|p| p.text)
                    .unwrap_or_default();
                println!("[{}] {}", message.source_username, text);
            }
        });
    }
    {
        let mut peers = node.on_peer_update();
        tokio::spawn(async move {
            while let Ok(event) = peers.recv().await {
                match event {
                    PeerEvent::Updated(peer) => {
                        tracing::info!(
                            peer = %peer.id,
                            username = %peer.username,
                            hops = peer.hop_count,
                            state = ?peer.state,
                            "peer update"
                        );
                    }
                    PeerEvent::Removed(peer_id) => {
                        tracing::info!(peer = %peer_id, "peer removed");
                    }
                }
            }
        });
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = stdin.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if line == "/peers" {
            for peer in node.peers() {
                println!(
                    "  {}  {}  hops={}  state={:?}",
                    peer.id, peer.username, peer.hop_count, peer.state
                );
            }
            continue;
        }
        if let Some(target) = line.strip_prefix("/ping ") {
            match node.ping(target.trim()) {
                Ok(ping_id) => println!("ping {ping_id} sent"),
                Err(e) => println!("ping failed: {e}"),
            }
            continue;
        }
        if let Err(e) = node.broadcast(line, Vec::new(), Default::default(), None) {
            println!("send failed: {e}");
        }
    }

    node.stop().await?;
    Ok(())
}
