//! Gossip-Node: a peer-to-peer gossip node for blockchain messages
//!
//! This crate provides:
//! - A TCP mesh where every node both listens and dials
//! - Newline-delimited JSON message envelopes
//! - Flood broadcast with ID-based duplicate suppression
//! - A channel that hands newly seen blocks and transactions to the application
//!
//! # Example
//!
//! ```no_run
//! use gossip_node::core::Transaction;
//! use gossip_node::network::{Node, NodeConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut node = Node::new(NodeConfig {
//!     port: 7878,
//!     bootstrap_peers: vec!["127.0.0.1:7879".to_string()],
//!     ..Default::default()
//! });
//! let mut inbound = node.inbound_channel().expect("inbound channel");
//! node.start().await?;
//!
//! // Announce a transaction to every peer
//! let tx = Transaction::new("pk", "{\"deal\":1}", 10.0);
//! node.protocol().response_transaction(tx).await?;
//!
//! while let Some(message) = inbound.recv().await {
//!     println!("received {}", message.type_name());
//! }
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod network;

// Re-export commonly used types
pub use core::{Block, Transaction};
pub use network::{Envelope, Message, Node, NodeConfig, Protocol};
