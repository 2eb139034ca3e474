//! Gossip protocol engine
//!
//! Deduplicates inbound messages by sequence id, answers the bootstrap info
//! exchange, hands new content to the application and floods it back out.
//!
//! The only state is `last_seen_id`, the largest id this node has accepted or
//! assigned. A content message whose id does not exceed it has already been
//! seen and is dropped. Locally originated messages take the next id.

use crate::core::{Block, Transaction};
use crate::network::message::{Envelope, Message, MessageError, MessageType};
use crate::network::peer::PeerError;
use crate::network::pool::{PoolEvent, PoolHandle};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Errors surfaced by the protocol engine
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Message error: {0}")]
    Message(#[from] MessageError),
    #[error("Pool error: {0}")]
    Pool(#[from] PeerError),
}

/// What the engine did with an inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Info request answered with our high-water mark
    InfoAnswered { last_seen_id: u64 },
    /// High-water mark synchronized from an info response
    Synced { last_seen_id: u64 },
    /// New content delivered to the application and rebroadcast
    Accepted { id: u64 },
    /// Already seen; dropped without delivery or rebroadcast
    Stale { id: u64, last_seen_id: u64 },
}

/// Protocol engine settings
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Address announced to the network after a peer connects
    pub advertise_address: Option<String>,
    /// Pause between a peer registering and the bootstrap messages
    pub bootstrap_delay: Duration,
    /// Capacity of the application inbound channel
    pub inbound_capacity: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            advertise_address: None,
            bootstrap_delay: Duration::from_secs(1),
            inbound_capacity: 100,
        }
    }
}

pub struct Protocol {
    pool: PoolHandle,
    last_seen_id: Mutex<u64>,
    inbound_tx: mpsc::Sender<Message>,
    inbound_rx: std::sync::Mutex<Option<mpsc::Receiver<Message>>>,
    config: ProtocolConfig,
}

impl Protocol {
    pub fn new(pool: PoolHandle, config: ProtocolConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        Self {
            pool,
            last_seen_id: Mutex::new(0),
            inbound_tx,
            inbound_rx: std::sync::Mutex::new(Some(inbound_rx)),
            config,
        }
    }

    /// Take the channel new content is delivered on. Only the first call
    /// gets it.
    pub fn inbound_channel(&self) -> Option<mpsc::Receiver<Message>> {
        self.inbound_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    pub async fn last_seen_id(&self) -> u64 {
        *self.last_seen_id.lock().await
    }

    /// Process pool events until the pool goes away
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<PoolEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                PoolEvent::PeerConnected(address) => {
                    let protocol = Arc::clone(&self);
                    tokio::spawn(async move { protocol.bootstrap(&address).await });
                }
                PoolEvent::Frame { from, frame } => match self.handle_frame(&frame).await {
                    Ok(Disposition::Stale { id, last_seen_id }) => {
                        log::debug!(
                            "Dropped already seen message {} from {} (last seen {})",
                            id,
                            from,
                            last_seen_id
                        );
                    }
                    Ok(disposition) => {
                        log::debug!("Handled frame from {}: {:?}", from, disposition);
                    }
                    Err(e) => {
                        log::warn!("Dropped frame from {}: {}", from, e);
                    }
                },
            }
        }
        log::info!("Protocol engine stopped");
    }

    /// Decode one frame and apply the gossip rules to it
    pub async fn handle_frame(&self, frame: impl AsRef<[u8]>) -> Result<Disposition, ProtocolError> {
        let envelope = Envelope::decode(frame.as_ref())?;
        let id = envelope.content.id();
        log::debug!("Received {} with id {}", envelope.message_type, id);

        match envelope.message_type {
            MessageType::RequestMessageInfo => {
                let last_seen_id = self.response_info().await?;
                Ok(Disposition::InfoAnswered { last_seen_id })
            }
            MessageType::ResponseMessageInfo => {
                let mut last_seen_id = self.last_seen_id.lock().await;
                *last_seen_id = (*last_seen_id).max(id);
                Ok(Disposition::Synced {
                    last_seen_id: *last_seen_id,
                })
            }
            _ => {
                {
                    let mut last_seen_id = self.last_seen_id.lock().await;
                    if id <= *last_seen_id {
                        return Ok(Disposition::Stale {
                            id,
                            last_seen_id: *last_seen_id,
                        });
                    }
                    *last_seen_id = id;
                }

                self.deliver(envelope.content.clone());
                self.broadcast(envelope.content, true).await?;
                Ok(Disposition::Accepted { id })
            }
        }
    }

    /// Hand new content to the application without ever blocking the engine
    fn deliver(&self, message: Message) {
        match self.inbound_tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                log::warn!(
                    "Application inbound channel full, dropping {} with id {}",
                    message.type_name(),
                    message.id()
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("Application inbound channel closed");
            }
        }
    }

    /// Encode a message and send it to every peer
    ///
    /// Locally originated content takes the next id; an echo keeps the id its
    /// originator assigned. Info messages carry the current high-water mark
    /// without advancing it. Returns the id the message went out with.
    pub async fn broadcast(&self, mut message: Message, is_echo: bool) -> Result<u64, ProtocolError> {
        if !is_echo {
            let mut last_seen_id = self.last_seen_id.lock().await;
            if !message.message_type().is_control() {
                *last_seen_id = last_seen_id.saturating_add(1);
            }
            message.set_id(*last_seen_id);
        }

        let payload = Envelope::encode_to_string(&message)?;
        let delivered = self.pool.broadcast(&payload).await?;
        log::debug!(
            "Broadcast {} with id {} to {} peers",
            message.type_name(),
            message.id(),
            delivered
        );
        Ok(message.id())
    }

    /// Learn the network's high-water mark, then announce ourselves
    pub async fn bootstrap(&self, peer_address: &str) {
        if !self.config.bootstrap_delay.is_zero() {
            tokio::time::sleep(self.config.bootstrap_delay).await;
        }
        log::debug!("Bootstrapping after connecting to {}", peer_address);

        if let Err(e) = self.request_info().await {
            log::warn!("Failed to request message info: {}", e);
            return;
        }
        if let Some(address) = self.config.advertise_address.clone() {
            if let Err(e) = self.response_peer_list(vec![address]).await {
                log::warn!("Failed to announce address: {}", e);
            }
        }
    }

    pub async fn request_info(&self) -> Result<u64, ProtocolError> {
        self.broadcast(Message::request_info(), false).await
    }

    pub async fn response_info(&self) -> Result<u64, ProtocolError> {
        self.broadcast(Message::response_info(), false).await
    }

    pub async fn request_last_n_blocks(&self, n: u32) -> Result<u64, ProtocolError> {
        self.broadcast(Message::request_last_n_blocks(n), false).await
    }

    pub async fn request_blocks_before(&self) -> Result<u64, ProtocolError> {
        self.broadcast(Message::request_blocks_before(), false).await
    }

    pub async fn response_block(&self, block: Block) -> Result<u64, ProtocolError> {
        self.broadcast(Message::block(block, false), false).await
    }

    pub async fn response_transaction(&self, transaction: Transaction) -> Result<u64, ProtocolError> {
        self.broadcast(Message::transaction(transaction), false).await
    }

    pub async fn response_chain(&self, chain: Vec<Block>) -> Result<u64, ProtocolError> {
        self.broadcast(Message::chain(chain), false).await
    }

    pub async fn response_peer_list(&self, addresses: Vec<String>) -> Result<u64, ProtocolError> {
        self.broadcast(Message::peers(addresses), false).await
    }
}
