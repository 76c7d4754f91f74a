use alloy_primitives::{Address, B256, Bytes, keccak256};
use serde::{Deserialize, Serialize};

use crate::{summary::Summary, time::Timestamp};

/// A message originated on L1 through the bridge's delayed inbox.
///
/// Delayed messages must reach the execution engine in strictly increasing, contiguous
/// `index` order. They can be interleaved with direct transactions but never reordered
/// relative to each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayedMessage {
    /// Position of the message in the delayed inbox.
    pub index: u64,
    /// The L1 block in which the message was delivered.
    pub l1_block_number: u64,
    /// The timestamp of the L1 block in which the message was delivered.
    pub l1_timestamp: Timestamp,
    /// The message kind, as emitted by the bridge.
    pub kind: u8,
    /// The L1 account that sent the message.
    pub sender: Address,
    /// The message data.
    pub data: Bytes,
}

impl DelayedMessage {
    /// The hash of the message data.
    pub fn data_hash(&self) -> B256 {
        keccak256(&self.data)
    }

    /// Returns the number of confirmations of this message, given the current L1 head.
    pub const fn confirmations(&self, l1_head: u64) -> u64 {
        l1_head.saturating_sub(self.l1_block_number)
    }
}

impl Summary for DelayedMessage {
    fn summary(&self) -> String {
        format!(
            "index={}, l1_block={}, kind={}, sender={}, size={}",
            self.index,
            self.l1_block_number,
            self.kind,
            self.sender,
            self.data.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmations_saturate_below_delivery_block() {
        let msg = DelayedMessage {
            index: 0,
            l1_block_number: 100,
            l1_timestamp: 0,
            kind: 3,
            sender: Address::ZERO,
            data: Bytes::new(),
        };

        assert_eq!(msg.confirmations(90), 0);
        assert_eq!(msg.confirmations(100), 0);
        assert_eq!(msg.confirmations(112), 12);
    }

    #[test]
    fn deserializes_camel_case() {
        let json = r#"{
            "index": 7,
            "l1BlockNumber": 21,
            "l1Timestamp": 1700000000,
            "kind": 9,
            "sender": "0x0000000000000000000000000000000000000001",
            "data": "0xdeadbeef"
        }"#;

        let msg: DelayedMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.index, 7);
        assert_eq!(msg.l1_block_number, 21);
        assert_eq!(msg.data.len(), 4);
    }
}
