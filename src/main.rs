//! Gossip-Node CLI Application
//!
//! Runs a gossip node and logs whatever new content reaches it.

use clap::{Parser, Subcommand};
use gossip_node::network::{Message, Node, NodeConfig};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "gossip-node")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "A peer-to-peer gossip node for blockchain messages", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gossip node
    Start {
        /// Host to listen on
        #[arg(long, default_value = "0.0.0.0")]
        listen: String,

        /// Port to listen on
        #[arg(short, long, default_value = "7878")]
        port: u16,

        /// Address announced to peers (host:port)
        #[arg(long)]
        advertise: Option<String>,

        /// Initial peers to connect to (comma-separated)
        #[arg(long)]
        peers: Option<String>,

        /// Seconds of silence before a peer is dropped
        #[arg(long, default_value = "600")]
        inactivity_timeout: u64,

        /// Seconds between inactivity sweeps
        #[arg(long, default_value = "60")]
        sweep_interval: u64,

        /// Per-read deadline in seconds
        #[arg(long, default_value = "10")]
        read_timeout: u64,

        /// Handshake deadline in seconds
        #[arg(long, default_value = "10")]
        handshake_timeout: u64,

        /// Per-write deadline in seconds
        #[arg(long, default_value = "10")]
        write_timeout: u64,

        /// Read buffer size in bytes
        #[arg(long, default_value = "4096")]
        buffer_size: usize,

        /// Longest accepted frame in bytes
        #[arg(long, default_value = "8388608")]
        max_frame_len: usize,

        /// Seconds to wait before greeting a new peer
        #[arg(long, default_value = "1")]
        bootstrap_delay: u64,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            listen,
            port,
            advertise,
            peers,
            inactivity_timeout,
            sweep_interval,
            read_timeout,
            handshake_timeout,
            write_timeout,
            buffer_size,
            max_frame_len,
            bootstrap_delay,
        } => {
            let bootstrap_peers: Vec<String> = peers
                .map(|p| {
                    p.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default();

            let config = NodeConfig {
                listen_address: listen,
                port,
                advertise_address: advertise,
                bootstrap_peers,
                inactivity_timeout: Duration::from_secs(inactivity_timeout),
                sweep_interval: Duration::from_secs(sweep_interval),
                read_timeout: Duration::from_secs(read_timeout),
                handshake_timeout: Duration::from_secs(handshake_timeout),
                write_timeout: Duration::from_secs(write_timeout),
                buffer_size,
                max_frame_len,
                bootstrap_delay: Duration::from_secs(bootstrap_delay),
                ..Default::default()
            };

            run_node(config)
        }
    }
}

fn run_node(config: NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let mut node = Node::new(config);
        let mut inbound = node
            .inbound_channel()
            .ok_or("inbound channel already taken")?;

        let local_addr = node.start().await?;
        println!("🌐 Gossip node listening on {}", local_addr);

        let mut dialer = AnnouncedPeers::new(&node.config, local_addr.to_string());

        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => handle_inbound(&node, &mut dialer, message).await,
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    println!("\n📴 Shutting down node...");
                    node.shutdown();
                    break;
                }
            }
        }

        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

/// Announced listen addresses this node has already claimed for dialing
///
/// Pool keys are the remote side's ephemeral `ip:port`, so an announced
/// listen address cannot be matched against connected peers. A peer that
/// dialed us first and later announces itself still gets a second link;
/// duplicate frames on it are dropped as stale.
struct AnnouncedPeers {
    claimed: HashSet<String>,
}

impl AnnouncedPeers {
    fn new(config: &NodeConfig, local_addr: String) -> Self {
        let mut claimed: HashSet<String> = config.bootstrap_peers.iter().cloned().collect();
        claimed.insert(local_addr);
        if let Some(advertised) = &config.advertise_address {
            claimed.insert(advertised.clone());
        }
        Self { claimed }
    }

    /// True the first time an address is seen
    fn claim(&mut self, address: &str) -> bool {
        self.claimed.insert(address.to_string())
    }
}

/// Default application sink: log new content and dial announced peers
async fn handle_inbound(node: &Node, dialer: &mut AnnouncedPeers, message: Message) {
    match message {
        Message::Block(m) => {
            log::info!(
                "Block #{} ({} transactions) hash {}",
                m.block.id,
                m.block.transactions().len(),
                m.block.hash()
            );
        }
        Message::Chain(m) => {
            log::info!("Chain of {} blocks", m.chain.len());
        }
        Message::Transaction(m) => {
            log::info!(
                "Transaction from {}: {} ({})",
                m.transaction.sender,
                m.transaction.transfer,
                m.transaction.deal_message
            );
        }
        Message::Peer(m) => {
            for address in m.peer_addresses {
                if !dialer.claim(&address) {
                    continue;
                }
                if let Err(e) = node.connect_to(&address).await {
                    log::warn!("Failed to connect to announced peer {}: {}", address, e);
                }
            }
        }
        other => {
            log::debug!("Ignoring {}", other.type_name());
        }
    }
}
