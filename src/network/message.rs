//! Network message types for P2P communication
//!
//! Every message travels inside a `{"type": ..., "content": ...}` envelope.
//! The `type` tag selects the schema `content` is decoded against, so the
//! receiver never needs to know the concrete message ahead of time.

use crate::core::{Block, Transaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;
use thiserror::Error;

/// Envelope encoding and decoding errors
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("Invalid {message_type} content: {source}")]
    InvalidContent {
        message_type: MessageType,
        source: serde_json::Error,
    },
}

/// Wire type tags, one per message variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    RequestMessageInfo,
    ResponseMessageInfo,
    RequestLastNBlocksMessage,
    RequestBlocksBeforeMessage,
    ResponseBlockMessage,
    ResponseChainMessage,
    ResponseTransactionMessage,
    ResponsePeerMessage,
}

impl MessageType {
    pub const ALL: [MessageType; 8] = [
        MessageType::RequestMessageInfo,
        MessageType::ResponseMessageInfo,
        MessageType::RequestLastNBlocksMessage,
        MessageType::RequestBlocksBeforeMessage,
        MessageType::ResponseBlockMessage,
        MessageType::ResponseChainMessage,
        MessageType::ResponseTransactionMessage,
        MessageType::ResponsePeerMessage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::RequestMessageInfo => "RequestMessageInfo",
            MessageType::ResponseMessageInfo => "ResponseMessageInfo",
            MessageType::RequestLastNBlocksMessage => "RequestLastNBlocksMessage",
            MessageType::RequestBlocksBeforeMessage => "RequestBlocksBeforeMessage",
            MessageType::ResponseBlockMessage => "ResponseBlockMessage",
            MessageType::ResponseChainMessage => "ResponseChainMessage",
            MessageType::ResponseTransactionMessage => "ResponseTransactionMessage",
            MessageType::ResponsePeerMessage => "ResponsePeerMessage",
        }
    }

    /// Look up the tag as it appears on the wire
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }

    /// Info exchange used for bootstrapping; never delivered or deduplicated
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            MessageType::RequestMessageInfo | MessageType::ResponseMessageInfo
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields shared by every message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseMessage {
    /// Sequence id, assigned by the originating node on broadcast
    #[serde(default)]
    pub id: u64,
    /// Creation time in seconds since the Unix epoch
    #[serde(rename = "time_stamp", default)]
    pub timestamp: i64,
}

impl BaseMessage {
    /// Unstamped base with the current time
    pub fn now() -> Self {
        Self {
            id: 0,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Info request/response; the id carries the sender's high-water mark
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoMessage {
    #[serde(flatten)]
    pub base: BaseMessage,
}

/// Request for the last `n` blocks of the chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastNBlocksMessage {
    #[serde(flatten)]
    pub base: BaseMessage,
    pub n: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlocksBeforeMessage {
    #[serde(flatten)]
    pub base: BaseMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMessage {
    #[serde(flatten)]
    pub base: BaseMessage,
    pub block: Block,
    /// Ask receivers to accept the block even if it conflicts with their tip
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainMessage {
    #[serde(flatten)]
    pub base: BaseMessage,
    pub chain: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionMessage {
    #[serde(flatten)]
    pub base: BaseMessage,
    pub transaction: Transaction,
}

/// Announcement of reachable peer addresses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerMessage {
    #[serde(flatten)]
    pub base: BaseMessage,
    #[serde(rename = "peer_address")]
    pub peer_addresses: Vec<String>,
}

/// Gossip message variants
///
/// Serializes as the bare content object; the type tag lives in the envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    RequestInfo(InfoMessage),
    ResponseInfo(InfoMessage),
    RequestLastNBlocks(LastNBlocksMessage),
    RequestBlocksBefore(BlocksBeforeMessage),
    Block(BlockMessage),
    Chain(ChainMessage),
    Transaction(TransactionMessage),
    Peer(PeerMessage),
}

impl Message {
    pub fn request_info() -> Self {
        Message::RequestInfo(InfoMessage {
            base: BaseMessage::now(),
        })
    }

    pub fn response_info() -> Self {
        Message::ResponseInfo(InfoMessage {
            base: BaseMessage::now(),
        })
    }

    pub fn request_last_n_blocks(n: u32) -> Self {
        Message::RequestLastNBlocks(LastNBlocksMessage {
            base: BaseMessage::now(),
            n,
        })
    }

    pub fn request_blocks_before() -> Self {
        Message::RequestBlocksBefore(BlocksBeforeMessage {
            base: BaseMessage::now(),
        })
    }

    pub fn block(block: Block, force: bool) -> Self {
        Message::Block(BlockMessage {
            base: BaseMessage::now(),
            block,
            force,
        })
    }

    pub fn chain(chain: Vec<Block>) -> Self {
        Message::Chain(ChainMessage {
            base: BaseMessage::now(),
            chain,
        })
    }

    pub fn transaction(transaction: Transaction) -> Self {
        Message::Transaction(TransactionMessage {
            base: BaseMessage::now(),
            transaction,
        })
    }

    pub fn peers(peer_addresses: Vec<String>) -> Self {
        Message::Peer(PeerMessage {
            base: BaseMessage::now(),
            peer_addresses,
        })
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::RequestInfo(_) => MessageType::RequestMessageInfo,
            Message::ResponseInfo(_) => MessageType::ResponseMessageInfo,
            Message::RequestLastNBlocks(_) => MessageType::RequestLastNBlocksMessage,
            Message::RequestBlocksBefore(_) => MessageType::RequestBlocksBeforeMessage,
            Message::Block(_) => MessageType::ResponseBlockMessage,
            Message::Chain(_) => MessageType::ResponseChainMessage,
            Message::Transaction(_) => MessageType::ResponseTransactionMessage,
            Message::Peer(_) => MessageType::ResponsePeerMessage,
        }
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        self.message_type().as_str()
    }

    pub fn base(&self) -> &BaseMessage {
        match self {
            Message::RequestInfo(m) | Message::ResponseInfo(m) => &m.base,
            Message::RequestLastNBlocks(m) => &m.base,
            Message::RequestBlocksBefore(m) => &m.base,
            Message::Block(m) => &m.base,
            Message::Chain(m) => &m.base,
            Message::Transaction(m) => &m.base,
            Message::Peer(m) => &m.base,
        }
    }

    fn base_mut(&mut self) -> &mut BaseMessage {
        match self {
            Message::RequestInfo(m) | Message::ResponseInfo(m) => &mut m.base,
            Message::RequestLastNBlocks(m) => &mut m.base,
            Message::RequestBlocksBefore(m) => &mut m.base,
            Message::Block(m) => &mut m.base,
            Message::Chain(m) => &mut m.base,
            Message::Transaction(m) => &mut m.base,
            Message::Peer(m) => &mut m.base,
        }
    }

    pub fn id(&self) -> u64 {
        self.base().id
    }

    pub fn set_id(&mut self, id: u64) {
        self.base_mut().id = id;
    }

    pub fn timestamp(&self) -> i64 {
        self.base().timestamp
    }
}

/// A decoded `{type, content}` envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message_type: MessageType,
    pub content: Message,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    #[serde(rename = "type")]
    message_type: MessageType,
    content: &'a Message,
}

/// Envelope shell with the content left undecoded until the tag is known
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    message_type: String,
    content: Box<RawValue>,
}

type ContentDecoder = fn(&RawValue) -> Result<Message, serde_json::Error>;

fn decode_content<T: DeserializeOwned>(
    raw: &RawValue,
    wrap: fn(T) -> Message,
) -> Result<Message, serde_json::Error> {
    serde_json::from_str(raw.get()).map(wrap)
}

/// Content schema for each wire tag
const REGISTRY: [(MessageType, ContentDecoder); 8] = [
    (MessageType::RequestMessageInfo, |raw: &RawValue| {
        decode_content(raw, Message::RequestInfo)
    }),
    (MessageType::ResponseMessageInfo, |raw: &RawValue| {
        decode_content(raw, Message::ResponseInfo)
    }),
    (MessageType::RequestLastNBlocksMessage, |raw: &RawValue| {
        decode_content(raw, Message::RequestLastNBlocks)
    }),
    (MessageType::RequestBlocksBeforeMessage, |raw: &RawValue| {
        decode_content(raw, Message::RequestBlocksBefore)
    }),
    (MessageType::ResponseBlockMessage, |raw: &RawValue| {
        decode_content(raw, Message::Block)
    }),
    (MessageType::ResponseChainMessage, |raw: &RawValue| {
        decode_content(raw, Message::Chain)
    }),
    (MessageType::ResponseTransactionMessage, |raw: &RawValue| {
        decode_content(raw, Message::Transaction)
    }),
    (MessageType::ResponsePeerMessage, |raw: &RawValue| {
        decode_content(raw, Message::Peer)
    }),
];

impl Envelope {
    /// Serialize a message inside its envelope. The message id is written as is.
    pub fn encode(message: &Message) -> Result<Vec<u8>, MessageError> {
        let envelope = EnvelopeRef {
            message_type: message.message_type(),
            content: message,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Same as [`Envelope::encode`], as a string ready for framing
    pub fn encode_to_string(message: &Message) -> Result<String, MessageError> {
        let envelope = EnvelopeRef {
            message_type: message.message_type(),
            content: message,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Parse the envelope shell, resolve the tag, then decode the content
    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        let raw: RawEnvelope = serde_json::from_slice(data)?;

        let message_type = MessageType::from_tag(&raw.message_type)
            .ok_or_else(|| MessageError::UnknownMessageType(raw.message_type.clone()))?;
        let decoder = REGISTRY
            .iter()
            .find(|(t, _)| *t == message_type)
            .map(|(_, decoder)| *decoder)
            .ok_or_else(|| MessageError::UnknownMessageType(raw.message_type.clone()))?;

        let content = decoder(&raw.content).map_err(|source| MessageError::InvalidContent {
            message_type,
            source,
        })?;

        Ok(Self {
            message_type,
            content,
        })
    }
}
