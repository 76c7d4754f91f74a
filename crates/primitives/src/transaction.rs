use alloy_primitives::{Address, B256, Bytes, keccak256};
use serde::{Deserialize, Serialize};

use crate::summary::Summary;

/// A signed layer-2 transaction accepted by the node.
///
/// The payload is opaque to the sequencing pipeline: only its size, sender and per-sender
/// sequence number matter for ordering and validation. Once accepted, a transaction is
/// immutable and owned by the batcher's pending queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    /// The account that signed the transaction.
    pub sender: Address,
    /// Monotonic per-sender sequence number (nonce).
    pub sequence: u64,
    /// The raw signed transaction bytes.
    pub payload: Bytes,
}

impl Transaction {
    /// Creates a new [`Transaction`].
    pub const fn new(sender: Address, sequence: u64, payload: Bytes) -> Self {
        Self { sender, sequence, payload }
    }

    /// The transaction hash, computed over the raw payload.
    pub fn hash(&self) -> B256 {
        keccak256(&self.payload)
    }

    /// The size of the raw payload in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Returns `true` if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl Summary for Transaction {
    fn summary(&self) -> String {
        format!(
            "sender={}, sequence={}, size={}, hash={}",
            self.sender,
            self.sequence,
            self.size(),
            self.hash()
        )
    }
}
