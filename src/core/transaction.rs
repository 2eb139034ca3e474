//! Transaction payload carried through the gossip network
//!
//! Transactions arrive already signed from the wallet side. The network layer
//! treats them as opaque payloads and never inspects the signature.

use serde::{Deserialize, Serialize};

/// A signed transfer wrapping a deal payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Sender's public key
    pub sender: String,
    /// Serialized deal the transaction settles
    #[serde(rename = "message")]
    pub deal_message: String,
    /// Transferred amount
    pub transfer: f64,
    /// Base64 signature over sender, message and transfer
    pub signature: String,
}

impl Transaction {
    /// Create an unsigned transaction
    pub fn new(sender: impl Into<String>, deal_message: impl Into<String>, transfer: f64) -> Self {
        Self {
            sender: sender.into(),
            deal_message: deal_message.into(),
            transfer,
            signature: String::new(),
        }
    }

    /// Attach a signature produced by the wallet
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        let tx = Transaction::new("pk", "{\"id\":1}", 5000.0).with_signature("c2ln");
        let json = serde_json::to_value(&tx).unwrap();

        assert_eq!(json["sender"], "pk");
        assert_eq!(json["message"], "{\"id\":1}");
        assert_eq!(json["transfer"], 5000.0);
        assert_eq!(json["signature"], "c2ln");
        assert!(tx.is_signed());
    }
}
