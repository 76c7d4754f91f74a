use ISequencerInbox::{ISequencerInboxInstance, SequencerBatchDelivered};
use alloy::{
    rpc::types::{Filter, Log, TransactionRequest},
    signers::local::PrivateKeySigner,
    sol,
};
use alloy_primitives::{Address, B256};
use alloy_sol_types::{Error as SolError, SolEvent as _};
use derive_more::derive::Deref;
use keel_primitives::{batch::EncodedBatch, summary::Summary};
use url::Url;

use crate::{
    WalletProviderWithSimpleNonceManager, new_http_client,
    new_wallet_provider_with_simple_nonce_management,
};

/// A wrapper over a `ISequencerInbox` contract that exposes various utility methods.
#[derive(Debug, Clone, Deref)]
pub struct SequencerInbox(ISequencerInboxInstance<WalletProviderWithSimpleNonceManager>);

impl SequencerInbox {
    /// Create a new `SequencerInbox` instance at the given contract address.
    pub fn new<U: Into<Url>>(el_client_url: U, address: Address, wallet: PrivateKeySigner) -> Self {
        let provider =
            new_wallet_provider_with_simple_nonce_management(new_http_client(el_client_url), wallet);

        Self(ISequencerInboxInstance::new(address, provider))
    }

    /// Returns a [`TransactionRequest`] for the `addSequencerL2BatchFromOrigin` function.
    pub fn add_batch_tx_request(&self, batch: EncodedBatch) -> TransactionRequest {
        self.0
            .addSequencerL2BatchFromOrigin(
                batch.transactions,
                batch.lengths,
                batch.sections,
                batch.total_delayed_read,
            )
            .into_transaction_request()
    }
}

/// Returns a log [`Filter`] for `SequencerBatchDelivered` events of the inbox at `address`.
pub fn batch_delivered_filter(address: Address, from_block: u64, to_block: u64) -> Filter {
    Filter::new()
        .address(address)
        .event_signature(SequencerBatchDelivered::SIGNATURE_HASH)
        .from_block(from_block)
        .to_block(to_block)
}

/// A sequencer batch confirmed on L1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmedBatch {
    /// The index of the first message of the batch.
    pub first_message: u64,
    /// The total number of sequencer messages after this batch.
    pub new_message_count: u64,
    /// The total number of delayed messages read after this batch.
    pub total_delayed_read: u64,
    /// The hash of the last message of the batch.
    pub last_message_hash: B256,
    /// The L1 block the batch was confirmed in.
    pub l1_block_number: u64,
}

/// Decode a `SequencerBatchDelivered` log.
pub fn decode_confirmed_batch(log: &Log) -> Result<ConfirmedBatch, SolError> {
    let event = log.log_decode::<SequencerBatchDelivered>()?.inner.data;

    Ok(ConfirmedBatch {
        first_message: event.firstMessageNum.saturating_to(),
        new_message_count: event.newMessageCount.saturating_to(),
        total_delayed_read: event.totalDelayedMessagesRead.saturating_to(),
        last_message_hash: event.lastMessageHash,
        l1_block_number: log.block_number.unwrap_or_default(),
    })
}

impl Summary for ConfirmedBatch {
    fn summary(&self) -> String {
        format!(
            "messages={}..{}, delayed_read={}, last_hash={}, l1_block={}",
            self.first_message,
            self.new_message_count,
            self.total_delayed_read,
            self.last_message_hash,
            self.l1_block_number
        )
    }
}

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    #[derive(Debug)]
    interface ISequencerInbox {
        error NotSequencer(address sender);
        error NotOrigin();
        error EmptyBatch();
        error LengthsMismatch(uint256 expected, uint256 actual);
        error InvalidSectionsMetadata();
        error DelayedBackwards(uint256 read, uint256 requested);
        error DelayedTooFar(uint256 available, uint256 requested);
        error DataTooLarge(uint256 size, uint256 max);
        error Error(string);

        #[derive(Default)]
        event SequencerBatchDelivered(
            uint256 indexed firstMessageNum,
            uint256 newMessageCount,
            uint256 totalDelayedMessagesRead,
            bytes32 lastMessageHash
        );

        /// @notice Posts a batch of transactions and delayed message reads.
        /// @param transactions The concatenated transaction payloads.
        /// @param lengths The length of every transaction in `transactions`.
        /// @param sectionsMetadata Pairs of (transaction count, total delayed messages read).
        /// @param totalDelayedMessagesRead The total delayed messages read after the batch.
        function addSequencerL2BatchFromOrigin(
            bytes calldata transactions,
            uint256[] calldata lengths,
            uint256[] calldata sectionsMetadata,
            uint256 totalDelayedMessagesRead
        ) external;

        /// @notice The total number of sequencer messages so far.
        function messageCount() external view returns (uint256);
    }
}
