//! P2P Node implementation
//!
//! The main node that wires the connection pool, the protocol engine and the
//! TCP server together.

use crate::network::message::Message;
use crate::network::peer::PeerError;
use crate::network::pool::{ConnectionPool, PoolConfig, PoolEvent, PoolHandle};
use crate::network::protocol::{Protocol, ProtocolConfig};
use crate::network::server::{connect_to_peer, handle_connection, ConnectionSettings, Server};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Node lifecycle errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),
    #[error("Node already started")]
    AlreadyStarted,
    #[error("Node not started")]
    NotStarted,
}

/// P2P Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Host to listen on
    pub listen_address: String,
    /// Port to listen on
    pub port: u16,
    /// Address announced to peers after connecting
    pub advertise_address: Option<String>,
    /// Initial peers to connect to
    pub bootstrap_peers: Vec<String>,
    /// Idle time after which a peer is evicted
    pub inactivity_timeout: Duration,
    /// How often idle peers are swept
    pub sweep_interval: Duration,
    /// Per-read deadline on peer sockets
    pub read_timeout: Duration,
    /// Deadline for the handshake greeting
    pub handshake_timeout: Duration,
    /// Bound on a single peer write
    pub write_timeout: Duration,
    /// Read chunk size
    pub buffer_size: usize,
    /// Cap on a peer's unterminated frame
    pub max_frame_len: usize,
    /// Pause before the bootstrap messages on a new peer
    pub bootstrap_delay: Duration,
    /// Capacity of the application inbound channel
    pub inbound_capacity: usize,
    /// Capacity of the pool command queue
    pub command_capacity: usize,
    /// Capacity of the pool to engine event queue; a peer that overflows it
    /// is dropped
    pub events_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        let connection = ConnectionSettings::default();
        let protocol = ProtocolConfig::default();

        Self {
            listen_address: "0.0.0.0".to_string(),
            port: 7878,
            advertise_address: None,
            bootstrap_peers: Vec::new(),
            inactivity_timeout: pool.inactivity_timeout,
            sweep_interval: pool.sweep_interval,
            read_timeout: connection.read_timeout,
            handshake_timeout: connection.handshake_timeout,
            write_timeout: pool.write_timeout,
            buffer_size: connection.buffer_size,
            max_frame_len: pool.max_frame_len,
            bootstrap_delay: protocol.bootstrap_delay,
            inbound_capacity: protocol.inbound_capacity,
            command_capacity: pool.command_capacity,
            events_capacity: 1000,
        }
    }
}

impl NodeConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            inactivity_timeout: self.inactivity_timeout,
            sweep_interval: self.sweep_interval,
            write_timeout: self.write_timeout,
            max_frame_len: self.max_frame_len,
            command_capacity: self.command_capacity,
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            handshake_timeout: self.handshake_timeout,
            read_timeout: self.read_timeout,
            inactivity_timeout: self.inactivity_timeout,
            buffer_size: self.buffer_size,
        }
    }

    pub fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            advertise_address: self.advertise_address.clone(),
            bootstrap_delay: self.bootstrap_delay,
            inbound_capacity: self.inbound_capacity,
        }
    }

    fn bind_address(&self) -> String {
        format!("{}:{}", self.listen_address, self.port)
    }
}

/// Parts that only exist until the node is started
struct Pending {
    pool: ConnectionPool,
    events: mpsc::Receiver<PoolEvent>,
}

/// The main P2P node
pub struct Node {
    pub config: NodeConfig,
    pool: PoolHandle,
    protocol: Arc<Protocol>,
    pending: Option<Pending>,
    local_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
}

impl Node {
    /// Create a new node. Nothing listens or connects until [`Node::start`].
    pub fn new(config: NodeConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.events_capacity.max(1));
        let (pool, handle) = ConnectionPool::new(config.pool_config(), events_tx);
        let protocol = Arc::new(Protocol::new(handle.clone(), config.protocol_config()));

        Self {
            config,
            pool: handle,
            protocol,
            pending: Some(Pending {
                pool,
                events: events_rx,
            }),
            local_addr: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Get the connection pool
    pub fn pool(&self) -> PoolHandle {
        self.pool.clone()
    }

    /// Get the protocol engine (for broadcasting from external sources)
    pub fn protocol(&self) -> Arc<Protocol> {
        Arc::clone(&self.protocol)
    }

    /// Channel new content from the network is delivered on; available once
    pub fn inbound_channel(&self) -> Option<mpsc::Receiver<Message>> {
        self.protocol.inbound_channel()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Start the node
    ///
    /// Binds the listener, spawns the pool, the protocol engine and the
    /// acceptor, then dials the bootstrap peers. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr, NodeError> {
        let pending = self.pending.take().ok_or(NodeError::AlreadyStarted)?;

        let server = match Server::bind(&self.config.bind_address()).await {
            Ok(server) => server,
            Err(e) => {
                self.pending = Some(pending);
                return Err(e.into());
            }
        };
        let local_addr = server.local_addr();
        self.local_addr = Some(local_addr);
        log::info!("Node started on {}", local_addr);

        tokio::spawn(pending.pool.run(self.shutdown.clone()));
        tokio::spawn(Arc::clone(&self.protocol).run(pending.events));

        // Spawn connection acceptor
        let pool = self.pool.clone();
        let settings = self.config.connection_settings();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = server.accept() => match accepted {
                        Ok((stream, addr)) => {
                            log::info!("Incoming connection from {}", addr);
                            spawn_connection(stream, addr, pool.clone(), settings.clone());
                        }
                        Err(e) => {
                            log::error!("Accept error: {}", e);
                        }
                    },
                    _ = shutdown.cancelled() => break,
                }
            }
            log::info!("Stopped accepting connections on {}", local_addr);
        });

        // Connect to bootstrap peers
        for peer_addr in self.config.bootstrap_peers.clone() {
            if let Err(e) = self.connect_to(&peer_addr).await {
                log::warn!("Failed to connect to bootstrap peer {}: {}", peer_addr, e);
            }
        }

        Ok(local_addr)
    }

    /// Connect to a peer
    pub async fn connect_to(&self, addr: &str) -> Result<SocketAddr, NodeError> {
        if self.local_addr.is_none() {
            return Err(NodeError::NotStarted);
        }
        log::info!("Connecting to peer: {}", addr);

        let (stream, peer_addr) = connect_to_peer(addr).await?;
        log::info!("Connected to {}", peer_addr);
        spawn_connection(
            stream,
            peer_addr,
            self.pool.clone(),
            self.config.connection_settings(),
        );
        Ok(peer_addr)
    }

    /// Shutdown the node
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait until [`Node::shutdown`] is called
    pub async fn wait_for_shutdown(&self) {
        self.shutdown.cancelled().await;
    }
}

fn spawn_connection(
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    pool: PoolHandle,
    settings: ConnectionSettings,
) {
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, addr, pool, settings).await {
            log::warn!("Connection error with {}: {}", addr, e);
        }
    });
}
