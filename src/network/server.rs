//! TCP server and connection handling
//!
//! Accepts incoming peer connections, dials outgoing ones, runs the handshake
//! and then pumps raw bytes from the socket into the connection pool.

use crate::network::peer::{PeerError, PeerWriter, HANDSHAKE_MESSAGE, UNAUTHORIZED_MESSAGE};
use crate::network::pool::PoolHandle;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Longest greeting line we are willing to read
const MAX_HANDSHAKE_LEN: u64 = 256;

/// Per-connection timing and buffer settings
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Deadline for the peer's greeting
    pub handshake_timeout: Duration,
    /// Deadline of a single read; on expiry the idle time is re-checked
    pub read_timeout: Duration,
    /// Idle time after which the connection gives up on the peer
    pub inactivity_timeout: Duration,
    /// Read chunk size
    pub buffer_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            inactivity_timeout: Duration::from_secs(600),
            buffer_size: 4096,
        }
    }
}

/// TCP server for accepting peer connections
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind to an address and create the server
    pub async fn bind(addr: &str) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Server listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Get the bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept incoming connections
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), std::io::Error> {
        self.listener.accept().await
    }
}

/// Connect to a peer
pub async fn connect_to_peer(addr: &str) -> Result<(TcpStream, SocketAddr), PeerError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?;

    let peer_addr = stream
        .peer_addr()
        .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?;

    Ok((stream, peer_addr))
}

/// Send our greeting and check the peer's
///
/// Both sides of a connection run this. A peer whose greeting does not match
/// gets `Unauthorized` and the connection must be dropped.
pub async fn handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    timeout: Duration,
) -> Result<(), PeerError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(HANDSHAKE_MESSAGE.as_bytes()).await?;
    writer.flush().await?;

    let mut line = Vec::new();
    tokio::time::timeout(
        timeout,
        (&mut *reader)
            .take(MAX_HANDSHAKE_LEN)
            .read_until(b'\n', &mut line),
    )
    .await
    .map_err(|_| PeerError::HandshakeTimeout)??;

    if line != HANDSHAKE_MESSAGE.as_bytes() {
        // Best effort, the connection is dropped either way
        let _ = writer.write_all(UNAUTHORIZED_MESSAGE.as_bytes()).await;
        let _ = writer.flush().await;
        return Err(PeerError::InvalidHandshake(
            String::from_utf8_lossy(&line).into_owned(),
        ));
    }
    Ok(())
}

/// Handle a peer connection (both inbound and outbound)
///
/// Registers the peer once the handshake succeeds and forwards everything it
/// reads to the pool until the peer disconnects, goes idle, or the pool drops
/// it.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    pool: PoolHandle,
    settings: ConnectionSettings,
) -> Result<(), PeerError> {
    let peer_address = addr.to_string();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::with_capacity(settings.buffer_size.max(1), read_half);

    if let Err(e) = handshake(&mut reader, &mut write_half, settings.handshake_timeout).await {
        log::warn!("Unauthorized client from {}: {}", peer_address, e);
        return Err(e);
    }
    log::info!("Authorized peer connected from {}", peer_address);

    let cancel = CancellationToken::new();
    pool.add_peer(
        peer_address.clone(),
        PeerWriter::new(write_half),
        cancel.clone(),
    )
    .await?;

    let mut buffer = vec![0u8; settings.buffer_size.max(1)];
    let mut last_activity = Instant::now();

    let result = loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                log::debug!("Connection to {} closed by the pool", peer_address);
                break Ok(());
            }
            read = tokio::time::timeout(settings.read_timeout, reader.read(&mut buffer)) => read,
        };

        match read {
            Err(_) => {
                if last_activity.elapsed() > settings.inactivity_timeout {
                    log::info!(
                        "Peer {} inactive for {:?}, disconnecting",
                        peer_address,
                        settings.inactivity_timeout
                    );
                    break Ok(());
                }
            }
            Ok(Ok(0)) => {
                log::info!("Peer {} disconnected", peer_address);
                break Ok(());
            }
            Ok(Ok(n)) => {
                last_activity = Instant::now();
                let chunk = Bytes::copy_from_slice(&buffer[..n]);
                if let Err(e) = pool.handle_peer_bytes(&peer_address, chunk).await {
                    break Err(e);
                }
            }
            Ok(Err(e)) => {
                log::warn!("Error reading from {}: {}", peer_address, e);
                break Err(e.into());
            }
        }
    };

    if !cancel.is_cancelled() {
        let _ = pool.remove_peer(&peer_address).await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_handshake_accepts_greeting() {
        let (local, remote) = tokio::io::duplex(256);
        let (local_read, mut local_write) = tokio::io::split(local);
        let (remote_read, mut remote_write) = tokio::io::split(remote);
        let mut local_reader = BufReader::new(local_read);
        let mut remote_reader = BufReader::new(remote_read);

        let timeout = Duration::from_secs(5);
        let (a, b) = tokio::join!(
            handshake(&mut local_reader, &mut local_write, timeout),
            handshake(&mut remote_reader, &mut remote_write, timeout),
        );
        assert!(a.is_ok());
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_handshake_rejects_garbage() {
        let (local, mut remote) = tokio::io::duplex(256);
        let (local_read, mut local_write) = tokio::io::split(local);
        let mut reader = BufReader::new(local_read);

        remote.write_all(b"GARBAGE\r\n").await.unwrap();
        let result = handshake(&mut reader, &mut local_write, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(PeerError::InvalidHandshake(line)) if line == "GARBAGE\r\n"));

        let mut received = vec![0u8; HANDSHAKE_MESSAGE.len() + UNAUTHORIZED_MESSAGE.len()];
        remote.read_exact(&mut received).await.unwrap();
        assert_eq!(
            received,
            format!("{}{}", HANDSHAKE_MESSAGE, UNAUTHORIZED_MESSAGE).into_bytes()
        );
    }

    #[tokio::test]
    async fn test_handshake_times_out() {
        let (local, _remote) = tokio::io::duplex(256);
        let (local_read, mut local_write) = tokio::io::split(local);
        let mut reader = BufReader::new(local_read);

        let result = handshake(&mut reader, &mut local_write, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(PeerError::HandshakeTimeout)));
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().to_string();
        drop(server);

        assert!(matches!(
            connect_to_peer(&addr).await,
            Err(PeerError::ConnectionFailed(_))
        ));
    }
}
