//! Core payload types
//!
//! Blocks and transactions travel inside gossip messages. Signing and
//! verification live with the wallet; this module only describes the data.

pub mod block;
pub mod transaction;

pub use block::Block;
pub use transaction::Transaction;
