//! Connection pool
//!
//! One task owns the peer table and applies commands from a queue, so every
//! mutation is serialized without a shared lock. Fan-out writes run in the
//! caller against a point-in-time snapshot of the table; a slow peer never
//! blocks the pool task or delivery to other peers. Peers whose write fails
//! are removed once the whole fan-out is done.
//!
//! Events for the protocol engine go through a bounded queue. The pool task
//! never waits on it: a peer whose frames find the queue full is dropped.

use crate::network::codec::{FrameCodec, DEFAULT_MAX_FRAME_LEN};
use crate::network::peer::{PeerConnection, PeerError, PeerWriter};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;

/// Connection pool settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Peers silent for longer than this are evicted by the sweep
    pub inactivity_timeout: Duration,
    /// How often the sweep runs
    pub sweep_interval: Duration,
    /// Bound on a single peer write during fan-out
    pub write_timeout: Duration,
    /// Cap on a peer's unterminated frame
    pub max_frame_len: usize,
    /// Capacity of the command queue
    pub command_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            command_capacity: 1000,
        }
    }
}

/// Notifications from the pool to the protocol engine
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// A peer passed the handshake and was registered
    PeerConnected(String),
    /// A complete frame arrived from a peer
    Frame { from: String, frame: Bytes },
}

/// Commands applied by the pool task
pub enum PoolCommand {
    AddPeer {
        address: String,
        writer: PeerWriter,
        cancel: CancellationToken,
    },
    /// Remove a peer. With `writer` set, only if the entry still uses that
    /// transport.
    RemovePeer {
        address: String,
        writer: Option<PeerWriter>,
    },
    GetPeers {
        reply: oneshot::Sender<Vec<String>>,
    },
    /// Writers of every known peer, for fan-out outside the pool task
    Snapshot {
        reply: oneshot::Sender<Vec<(String, PeerWriter)>>,
    },
    Lookup {
        address: String,
        reply: oneshot::Sender<Option<PeerWriter>>,
    },
    PeerBytes {
        address: String,
        chunk: Bytes,
    },
    Cleanup,
}

/// Peer map and per-peer framing state
///
/// Plain synchronous state; the pool task is its only owner.
#[derive(Debug)]
pub struct PeerTable {
    peers: HashMap<String, PeerConnection>,
    inactivity_timeout: Duration,
    max_frame_len: usize,
}

impl PeerTable {
    pub fn new(inactivity_timeout: Duration, max_frame_len: usize) -> Self {
        Self {
            peers: HashMap::new(),
            inactivity_timeout,
            max_frame_len,
        }
    }

    /// Register a peer. An existing entry under the same address is replaced
    /// and its connection closed.
    pub fn add_peer(&mut self, address: String, writer: PeerWriter, cancel: CancellationToken) {
        let connection =
            PeerConnection::new(address.clone(), writer, cancel, self.max_frame_len);
        if let Some(previous) = self.peers.insert(address.clone(), connection) {
            log::warn!("Replaced existing connection for {}", address);
            previous.close();
        }
        log::info!("Added peer: {}, total peers: {}", address, self.peers.len());
    }

    /// Forget a peer. Returns false if it was not known.
    pub fn remove_peer(&mut self, address: &str) -> bool {
        match self.peers.remove(address) {
            Some(connection) => {
                connection.close();
                log::info!("Removed peer: {}", address);
                true
            }
            None => false,
        }
    }

    /// Forget a peer only if its entry still writes through `writer`.
    /// A connection that replaced it in the meantime is left alone.
    pub fn remove_peer_if(&mut self, address: &str, writer: &PeerWriter) -> bool {
        let same_transport = self.peers.get(address).map(|peer| peer.has_writer(writer));
        match same_transport {
            Some(true) => self.remove_peer(address),
            Some(false) => {
                log::debug!("Peer {} was replaced, keeping the new connection", address);
                false
            }
            None => false,
        }
    }

    pub fn peer_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.peers.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn snapshot(&self) -> Vec<(String, PeerWriter)> {
        self.peers
            .values()
            .map(|peer| (peer.address.clone(), peer.writer()))
            .collect()
    }

    pub fn writer(&self, address: &str) -> Option<PeerWriter> {
        self.peers.get(address).map(PeerConnection::writer)
    }

    pub fn get(&self, address: &str) -> Option<&PeerConnection> {
        self.peers.get(address)
    }

    pub fn get_mut(&mut self, address: &str) -> Option<&mut PeerConnection> {
        self.peers.get_mut(address)
    }

    /// Feed a chunk read from a peer and return the frames it completed
    pub fn handle_peer_bytes(
        &mut self,
        address: &str,
        chunk: &[u8],
        now: Instant,
    ) -> Result<Vec<Bytes>, PeerError> {
        let peer = self
            .peers
            .get_mut(address)
            .ok_or_else(|| PeerError::PeerNotFound(address.to_string()))?;
        peer.push_bytes(chunk, now)
    }

    /// Evict every peer idle for longer than the inactivity timeout
    pub fn cleanup_inactive(&mut self, now: Instant) -> Vec<String> {
        let inactive: Vec<String> = self
            .peers
            .values()
            .filter(|peer| peer.is_inactive(now, self.inactivity_timeout))
            .map(|peer| peer.address.clone())
            .collect();

        for address in &inactive {
            log::info!("Inactive peer timeout: {}", address);
            self.remove_peer(address);
        }
        inactive
    }

    /// Close every connection
    pub fn clear(&mut self) {
        for (_, connection) in self.peers.drain() {
            connection.close();
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// The task owning the peer table
pub struct ConnectionPool {
    table: PeerTable,
    commands: mpsc::Receiver<PoolCommand>,
    events: mpsc::Sender<PoolEvent>,
    sweep_interval: Duration,
}

impl ConnectionPool {
    /// Create the pool and a handle for talking to it. Nothing runs until
    /// [`ConnectionPool::run`] is spawned.
    pub fn new(
        config: PoolConfig,
        events: mpsc::Sender<PoolEvent>,
    ) -> (Self, PoolHandle) {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let pool = Self {
            table: PeerTable::new(config.inactivity_timeout, config.max_frame_len),
            commands: rx,
            events,
            sweep_interval: config.sweep_interval.max(Duration::from_millis(1)),
        };
        let handle = PoolHandle {
            commands: tx,
            write_timeout: config.write_timeout,
        };
        (pool, handle)
    }

    /// Apply commands until every handle is dropped or `shutdown` fires
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        sweep.tick().await;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = sweep.tick() => {
                    log::debug!("Pool cleanup triggered");
                    self.table.cleanup_inactive(Instant::now());
                }
                _ = shutdown.cancelled() => break,
            }
        }

        log::info!("Connection pool stopped, closing {} peers", self.table.len());
        self.table.clear();
    }

    fn handle_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::AddPeer {
                address,
                writer,
                cancel,
            } => {
                self.table.add_peer(address.clone(), writer, cancel);
                if let Err(e) = self.events.try_send(PoolEvent::PeerConnected(address)) {
                    log::warn!("Event queue unavailable, no bootstrap for new peer: {}", e);
                }
            }
            PoolCommand::RemovePeer { address, writer } => match writer {
                Some(writer) => {
                    self.table.remove_peer_if(&address, &writer);
                }
                None => {
                    self.table.remove_peer(&address);
                }
            },
            PoolCommand::GetPeers { reply } => {
                let _ = reply.send(self.table.peer_addresses());
            }
            PoolCommand::Snapshot { reply } => {
                let _ = reply.send(self.table.snapshot());
            }
            PoolCommand::Lookup { address, reply } => {
                let _ = reply.send(self.table.writer(&address));
            }
            PoolCommand::PeerBytes { address, chunk } => {
                self.handle_peer_bytes(address, &chunk);
            }
            PoolCommand::Cleanup => {
                self.table.cleanup_inactive(Instant::now());
            }
        }
    }

    fn handle_peer_bytes(&mut self, address: String, chunk: &[u8]) {
        match self.table.handle_peer_bytes(&address, chunk, Instant::now()) {
            Ok(frames) => {
                for frame in frames {
                    log::debug!("Received {} byte frame from {}", frame.len(), address);
                    let event = PoolEvent::Frame {
                        from: address.clone(),
                        frame,
                    };
                    match self.events.try_send(event) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            log::warn!("Event queue full, dropping flooding peer {}", address);
                            self.table.remove_peer(&address);
                            return;
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            log::warn!("Protocol engine gone, dropping frame from {}", address);
                        }
                    }
                }
            }
            Err(PeerError::PeerNotFound(_)) => {
                log::debug!("Bytes from unknown peer: {}", address);
            }
            Err(e) => {
                log::warn!("Dropping peer {}: {}", address, e);
                self.table.remove_peer(&address);
            }
        }
    }
}

/// Cloneable front end of the connection pool
#[derive(Clone)]
pub struct PoolHandle {
    commands: mpsc::Sender<PoolCommand>,
    write_timeout: Duration,
}

impl PoolHandle {
    async fn send(&self, command: PoolCommand) -> Result<(), PeerError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PeerError::PoolClosed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> PoolCommand,
    ) -> Result<T, PeerError> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply)).await?;
        response.await.map_err(|_| PeerError::PoolClosed)
    }

    /// Register a peer that passed the handshake
    pub async fn add_peer(
        &self,
        address: String,
        writer: PeerWriter,
        cancel: CancellationToken,
    ) -> Result<(), PeerError> {
        self.send(PoolCommand::AddPeer {
            address,
            writer,
            cancel,
        })
        .await
    }

    /// Remove a peer; removing an unknown peer is a no-op
    pub async fn remove_peer(&self, address: &str) -> Result<(), PeerError> {
        self.send(PoolCommand::RemovePeer {
            address: address.to_string(),
            writer: None,
        })
        .await
    }

    /// Remove a peer whose write through `writer` failed
    async fn remove_failed(&self, address: &str, writer: PeerWriter) -> Result<(), PeerError> {
        self.send(PoolCommand::RemovePeer {
            address: address.to_string(),
            writer: Some(writer),
        })
        .await
    }

    /// Snapshot of the currently known peer addresses
    pub async fn peer_addresses(&self) -> Result<Vec<String>, PeerError> {
        self.request(|reply| PoolCommand::GetPeers { reply }).await
    }

    /// Write `payload` plus the frame delimiter to every known peer
    ///
    /// Returns how many peers accepted the write. Peers that failed are removed
    /// after the fan-out completes.
    pub async fn broadcast(&self, payload: &str) -> Result<usize, PeerError> {
        let peers = self.request(|reply| PoolCommand::Snapshot { reply }).await?;
        let frame = encode_frame(payload)?;

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (address, writer) in peers {
            match writer.write_frame(&frame, self.write_timeout).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!("Failed to send to {}: {}", address, e);
                    failed.push((address, writer));
                }
            }
        }

        for (address, writer) in failed {
            self.remove_failed(&address, writer).await?;
        }
        Ok(delivered)
    }

    /// Write `payload` plus the frame delimiter to a single peer
    pub async fn send_to_peer(&self, address: &str, payload: &str) -> Result<(), PeerError> {
        let writer = self
            .request(|reply| PoolCommand::Lookup {
                address: address.to_string(),
                reply,
            })
            .await?
            .ok_or_else(|| PeerError::PeerNotFound(address.to_string()))?;

        let frame = encode_frame(payload)?;
        if let Err(e) = writer.write_frame(&frame, self.write_timeout).await {
            log::warn!("Failed to send to {}: {}", address, e);
            self.remove_failed(address, writer).await?;
            return Err(e);
        }
        Ok(())
    }

    /// Hand a chunk read from a peer to its framer
    pub async fn handle_peer_bytes(&self, address: &str, chunk: Bytes) -> Result<(), PeerError> {
        self.send(PoolCommand::PeerBytes {
            address: address.to_string(),
            chunk,
        })
        .await
    }

    /// Run the inactivity sweep now instead of waiting for the timer
    pub async fn cleanup_inactive(&self) -> Result<(), PeerError> {
        self.send(PoolCommand::Cleanup).await
    }
}

fn encode_frame(payload: &str) -> Result<BytesMut, PeerError> {
    let mut buf = BytesMut::new();
    FrameCodec::default().encode(payload, &mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, DuplexStream};

    const WAIT: Duration = Duration::from_secs(5);

    fn spawn_pool(config: PoolConfig) -> (PoolHandle, mpsc::Receiver<PoolEvent>) {
        spawn_pool_with_events(config, 100)
    }

    fn spawn_pool_with_events(
        config: PoolConfig,
        events_capacity: usize,
    ) -> (PoolHandle, mpsc::Receiver<PoolEvent>) {
        let (events_tx, events_rx) = mpsc::channel(events_capacity);
        let (pool, handle) = ConnectionPool::new(config, events_tx);
        tokio::spawn(pool.run(CancellationToken::new()));
        (handle, events_rx)
    }

    async fn attach(handle: &PoolHandle, address: &str) -> (DuplexStream, CancellationToken) {
        let (local, remote) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        handle
            .add_peer(address.to_string(), PeerWriter::new(local), cancel.clone())
            .await
            .unwrap();
        (remote, cancel)
    }

    fn table_with_peer(address: &str, timeout: Duration) -> PeerTable {
        let mut table = PeerTable::new(timeout, DEFAULT_MAX_FRAME_LEN);
        let (stream, _) = tokio::io::duplex(64);
        table.add_peer(
            address.to_string(),
            PeerWriter::new(stream),
            CancellationToken::new(),
        );
        table
    }

    #[tokio::test]
    async fn test_add_and_remove_peer() {
        let (handle, mut events) = spawn_pool(PoolConfig::default());
        let (_remote, cancel) = attach(&handle, "127.0.0.1:9000").await;

        assert_eq!(
            handle.peer_addresses().await.unwrap(),
            vec!["127.0.0.1:9000".to_string()]
        );
        assert_eq!(
            events.recv().await,
            Some(PoolEvent::PeerConnected("127.0.0.1:9000".to_string()))
        );

        handle.remove_peer("127.0.0.1:9000").await.unwrap();
        // Idempotent
        handle.remove_peer("127.0.0.1:9000").await.unwrap();

        assert!(handle.peer_addresses().await.unwrap().is_empty());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_re_adding_address_replaces_entry() {
        let (handle, _events) = spawn_pool(PoolConfig::default());
        let (_first, first_cancel) = attach(&handle, "127.0.0.1:9000").await;
        let (mut second, second_cancel) = attach(&handle, "127.0.0.1:9000").await;

        assert_eq!(handle.peer_addresses().await.unwrap().len(), 1);
        assert!(first_cancel.is_cancelled());
        assert!(!second_cancel.is_cancelled());

        handle.broadcast("X").await.unwrap();
        let mut buf = [0u8; 2];
        tokio::time::timeout(WAIT, second.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"X\n");
    }

    #[tokio::test]
    async fn test_broadcast_removes_failed_peers() {
        let (handle, _events) = spawn_pool(PoolConfig::default());
        let (healthy, _) = attach(&handle, "127.0.0.1:9001").await;
        let (closed, closed_cancel) = attach(&handle, "127.0.0.1:9002").await;
        drop(closed);

        let delivered = handle.broadcast("X").await.unwrap();
        assert_eq!(delivered, 1);

        let mut reader = BufReader::new(healthy);
        let mut line = String::new();
        tokio::time::timeout(WAIT, reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, "X\n");

        assert_eq!(
            handle.peer_addresses().await.unwrap(),
            vec!["127.0.0.1:9001".to_string()]
        );
        assert!(closed_cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_write_spares_replacement_connection() {
        let mut table = table_with_peer("127.0.0.1:9010", Duration::from_secs(60));
        let stale = table.writer("127.0.0.1:9010").unwrap();

        let (stream, _) = tokio::io::duplex(64);
        let fresh = PeerWriter::new(stream);
        table.add_peer(
            "127.0.0.1:9010".to_string(),
            fresh.clone(),
            CancellationToken::new(),
        );

        // The old transport failed after the address was re-added
        assert!(!table.remove_peer_if("127.0.0.1:9010", &stale));
        assert_eq!(table.len(), 1);

        assert!(table.remove_peer_if("127.0.0.1:9010", &fresh));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_send_to_peer() {
        let (handle, _events) = spawn_pool(PoolConfig::default());
        let (mut remote, _) = attach(&handle, "127.0.0.1:9003").await;

        handle.send_to_peer("127.0.0.1:9003", "hello").await.unwrap();
        let mut buf = [0u8; 6];
        tokio::time::timeout(WAIT, remote.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hello\n");

        assert!(matches!(
            handle.send_to_peer("10.0.0.1:1", "hello").await,
            Err(PeerError::PeerNotFound(addr)) if addr == "10.0.0.1:1"
        ));
    }

    #[tokio::test]
    async fn test_peer_bytes_become_frames() {
        let (handle, mut events) = spawn_pool(PoolConfig::default());
        let (_remote, _) = attach(&handle, "127.0.0.1:9004").await;
        assert!(matches!(
            events.recv().await,
            Some(PoolEvent::PeerConnected(_))
        ));

        handle
            .handle_peer_bytes("127.0.0.1:9004", Bytes::from_static(b"one\ntw"))
            .await
            .unwrap();
        handle
            .handle_peer_bytes("127.0.0.1:9004", Bytes::from_static(b"o\nthree\n"))
            .await
            .unwrap();

        let mut frames = Vec::new();
        for _ in 0..3 {
            match tokio::time::timeout(WAIT, events.recv()).await.unwrap() {
                Some(PoolEvent::Frame { from, frame }) => {
                    assert_eq!(from, "127.0.0.1:9004");
                    frames.push(frame);
                }
                other => panic!("Expected frame, got {:?}", other),
            }
        }
        assert_eq!(frames, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_flooding_peer_dropped_when_event_queue_full() {
        let (handle, mut events) = spawn_pool_with_events(PoolConfig::default(), 2);
        let (_remote, cancel) = attach(&handle, "127.0.0.1:9011").await;

        // PeerConnected and the first frame fill the queue
        handle
            .handle_peer_bytes("127.0.0.1:9011", Bytes::from_static(b"a\nb\nc\n"))
            .await
            .unwrap();

        assert!(handle.peer_addresses().await.unwrap().is_empty());
        assert!(cancel.is_cancelled());

        assert!(matches!(
            events.recv().await,
            Some(PoolEvent::PeerConnected(_))
        ));
        assert_eq!(
            events.recv().await,
            Some(PoolEvent::Frame {
                from: "127.0.0.1:9011".to_string(),
                frame: Bytes::from_static(b"a"),
            })
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_drops_peer() {
        let config = PoolConfig {
            max_frame_len: 8,
            ..Default::default()
        };
        let (handle, _events) = spawn_pool(config);
        let (_remote, cancel) = attach(&handle, "127.0.0.1:9005").await;

        handle
            .handle_peer_bytes("127.0.0.1:9005", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        assert!(handle.peer_addresses().await.unwrap().is_empty());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_cleanup_inactive_boundary() {
        let timeout = Duration::from_secs(60);
        let mut table = table_with_peer("127.0.0.1:9006", timeout);
        let last_seen = table.get("127.0.0.1:9006").unwrap().last_seen;

        let evicted = table.cleanup_inactive(last_seen + timeout - Duration::from_secs(1));
        assert!(evicted.is_empty());
        assert_eq!(table.len(), 1);

        let evicted = table.cleanup_inactive(last_seen + timeout + Duration::from_secs(1));
        assert_eq!(evicted, vec!["127.0.0.1:9006".to_string()]);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_inbound_bytes_refresh_last_seen() {
        let timeout = Duration::from_secs(60);
        let mut table = table_with_peer("127.0.0.1:9007", timeout);
        let start = table.get("127.0.0.1:9007").unwrap().last_seen;

        let later = start + Duration::from_secs(50);
        table
            .handle_peer_bytes("127.0.0.1:9007", b"partial", later)
            .unwrap();

        assert!(table
            .cleanup_inactive(start + Duration::from_secs(90))
            .is_empty());
        assert_eq!(table.get_mut("127.0.0.1:9007").unwrap().pending(), 7);
    }

    #[tokio::test]
    async fn test_sweep_timer_evicts_idle_peers() {
        let config = PoolConfig {
            inactivity_timeout: Duration::from_millis(20),
            sweep_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let (handle, _events) = spawn_pool(config);
        let (_remote, cancel) = attach(&handle, "127.0.0.1:9008").await;

        tokio::time::timeout(WAIT, cancel.cancelled()).await.unwrap();
        assert!(handle.peer_addresses().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_pool_reports_error() {
        let (events_tx, _events_rx) = mpsc::channel(1);
        let (pool, handle) = ConnectionPool::new(PoolConfig::default(), events_tx);
        drop(pool);

        assert!(matches!(
            handle.peer_addresses().await,
            Err(PeerError::PoolClosed)
        ));
    }
}
