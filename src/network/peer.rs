//! Peer connections for P2P networking
//!
//! A peer is admitted after the handshake and then lives in the connection
//! pool until a read or write fails or the inactivity sweep evicts it.

use crate::network::codec::FrameCodec;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

/// Greeting both sides send right after the TCP connection is up
pub const HANDSHAKE_MESSAGE: &str = "NEW_CONNECT!\r\n";

/// Reply to a peer whose greeting did not match
pub const UNAUTHORIZED_MESSAGE: &str = "Unauthorized\n";

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Handshake timed out")]
    HandshakeTimeout,
    #[error("Invalid handshake: {0:?}")]
    InvalidHandshake(String),
    #[error("Peer not found: {0}")]
    PeerNotFound(String),
    #[error("Write timed out")]
    WriteTimeout,
    #[error("Frame too long: {len} bytes (max: {max})")]
    FrameTooLong { len: usize, max: usize },
    #[error("Connection pool closed")]
    PoolClosed,
}

type BoxedStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half of a peer transport, shared between the pool and fan-out callers
///
/// Frames are written under the lock, so two broadcasts never interleave bytes
/// on the same stream.
#[derive(Clone)]
pub struct PeerWriter {
    stream: Arc<Mutex<BoxedStream>>,
}

impl PeerWriter {
    pub fn new<W>(stream: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            stream: Arc::new(Mutex::new(Box::new(stream))),
        }
    }

    /// Write one already framed payload
    pub async fn write_frame(&self, frame: &[u8], timeout: Duration) -> Result<(), PeerError> {
        let mut stream = self.stream.lock().await;
        tokio::time::timeout(timeout, async {
            stream.write_all(frame).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| PeerError::WriteTimeout)??;
        Ok(())
    }

    /// True when both handles write to the same transport
    pub fn same_stream(&self, other: &PeerWriter) -> bool {
        Arc::ptr_eq(&self.stream, &other.stream)
    }
}

impl std::fmt::Debug for PeerWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerWriter").finish_non_exhaustive()
    }
}

/// A live peer as tracked by the connection pool
#[derive(Debug)]
pub struct PeerConnection {
    /// Canonical address string, also the pool key
    pub address: String,
    writer: PeerWriter,
    /// Last time the peer sent us anything
    pub last_seen: Instant,
    /// Partial frame carried over between reads
    buffer: BytesMut,
    codec: FrameCodec,
    /// Stops the connection's read task
    cancel: CancellationToken,
}

impl PeerConnection {
    pub fn new(
        address: String,
        writer: PeerWriter,
        cancel: CancellationToken,
        max_frame_len: usize,
    ) -> Self {
        Self {
            address,
            writer,
            last_seen: Instant::now(),
            buffer: BytesMut::new(),
            codec: FrameCodec::new(max_frame_len),
            cancel,
        }
    }

    pub fn writer(&self) -> PeerWriter {
        self.writer.clone()
    }

    pub fn has_writer(&self, writer: &PeerWriter) -> bool {
        self.writer.same_stream(writer)
    }

    /// Append a chunk and cut off every complete frame
    ///
    /// Whatever follows the last delimiter stays buffered for the next chunk.
    pub fn push_bytes(&mut self, chunk: &[u8], now: Instant) -> Result<Vec<Bytes>, PeerError> {
        self.last_seen = now;
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(frame) = self.codec.decode(&mut self.buffer)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Bytes of an unfinished frame waiting for its delimiter
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_inactive(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }

    /// Signal the read task to close the connection
    pub fn close(&self) {
        self.cancel.cancel();
    }
}
