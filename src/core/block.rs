//! Block payload carried through the gossip network
//!
//! A block groups transactions and links to its predecessor by hash.

use crate::core::transaction::Transaction;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A block of transactions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Block number
    pub id: i64,
    /// Creation time in seconds since the Unix epoch
    #[serde(rename = "time_create")]
    pub time_created: i64,
    /// Transactions included in the block
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    /// Hash of the previous block
    pub previous_hash: String,
    pub nonce: u64,
}

impl Block {
    /// Create a block stamped with the current time
    pub fn new(id: i64, transactions: Vec<Transaction>, previous_hash: impl Into<String>) -> Self {
        Self {
            id,
            time_created: chrono::Utc::now().timestamp(),
            transactions,
            previous_hash: previous_hash.into(),
            nonce: 0,
        }
    }

    /// SHA-256 digest of the block contents, hex encoded
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(
            format!(
                "{}{}{}{}",
                self.id, self.time_created, self.previous_hash, self.nonce
            )
            .as_bytes(),
        );
        for tx in &self.transactions {
            hasher.update(tx.signature.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }
}
