use IBridge::{IBridgeInstance, MessageDelivered};
use alloy::{
    rpc::types::{Filter, Log},
    sol,
};
use alloy_primitives::Address;
use alloy_sol_types::{Error as SolError, SolEvent as _};
use keel_primitives::DelayedMessage;
use url::Url;

use crate::{DefaultProvider, new_default_provider};

/// A wrapper over a `IBridge` contract that exposes various utility methods.
#[derive(Debug, Clone)]
pub struct Bridge(IBridgeInstance<DefaultProvider>);

impl Bridge {
    /// Create a new `Bridge` instance at the given contract address.
    pub fn new<U: Into<Url>>(el_client_url: U, address: Address) -> Self {
        Self(IBridgeInstance::new(address, new_default_provider(el_client_url)))
    }

    /// The address of the bridge contract.
    pub const fn address(&self) -> &Address {
        self.0.address()
    }

    /// Returns a log [`Filter`] for `MessageDelivered` events in the given block range.
    pub fn message_delivered_filter(&self, from_block: u64, to_block: u64) -> Filter {
        Filter::new()
            .address(*self.0.address())
            .event_signature(MessageDelivered::SIGNATURE_HASH)
            .from_block(from_block)
            .to_block(to_block)
    }
}

/// Decode a `MessageDelivered` log into a [`DelayedMessage`].
pub fn decode_delayed_message(log: &Log) -> Result<DelayedMessage, SolError> {
    let event = log.log_decode::<MessageDelivered>()?.inner.data;
    let l1_block_number = log.block_number.unwrap_or_default();

    Ok(DelayedMessage {
        index: event.messageIndex.saturating_to(),
        l1_block_number,
        l1_timestamp: event.timestamp,
        kind: event.kind,
        sender: event.sender,
        data: event.data,
    })
}

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    #[derive(Debug)]
    interface IBridge {
        error NotDelayedInbox(address sender);
        error Error(string);

        #[derive(Default)]
        event MessageDelivered(
            uint256 indexed messageIndex,
            uint8 kind,
            address indexed sender,
            uint64 timestamp,
            bytes data
        );
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Bytes, LogData, U256};

    use super::*;

    #[test]
    fn decodes_message_delivered_log() {
        let sender = Address::repeat_byte(0x11);
        let event = MessageDelivered {
            messageIndex: U256::from(42),
            kind: 3,
            sender,
            timestamp: 1_700_000_000,
            data: Bytes::from_static(b"deposit"),
        };

        let data: LogData = event.encode_log_data();
        let log = Log {
            inner: alloy::primitives::Log { address: Address::ZERO, data },
            block_number: Some(100),
            ..Default::default()
        };

        let msg = decode_delayed_message(&log).unwrap();
        assert_eq!(msg.index, 42);
        assert_eq!(msg.l1_block_number, 100);
        assert_eq!(msg.sender, sender);
        assert_eq!(msg.data, Bytes::from_static(b"deposit"));
    }
}
