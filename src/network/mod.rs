//! P2P Networking module
//!
//! Gossip layer that spreads messages across a mesh of TCP peers.
//!
//! # Features
//! - Symmetric line handshake
//! - Newline-delimited JSON envelopes
//! - Connection pool with inactivity sweeping
//! - Monotonic message IDs for duplicate suppression
//! - Echo relay of newly seen content

pub mod codec;
pub mod message;
pub mod node;
pub mod peer;
pub mod pool;
pub mod protocol;
pub mod server;

pub use codec::{FrameCodec, DEFAULT_MAX_FRAME_LEN, FRAME_DELIMITER};
pub use message::{BaseMessage, Envelope, Message, MessageError, MessageType};
pub use node::{Node, NodeConfig, NodeError};
pub use peer::{PeerError, PeerWriter, HANDSHAKE_MESSAGE, UNAUTHORIZED_MESSAGE};
pub use pool::{ConnectionPool, PoolConfig, PoolEvent, PoolHandle};
pub use protocol::{Disposition, Protocol, ProtocolConfig, ProtocolError};
pub use server::{connect_to_peer, ConnectionSettings, Server};
