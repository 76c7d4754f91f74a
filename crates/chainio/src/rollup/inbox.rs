use IInbox::IInboxInstance;
use alloy::{rpc::types::TransactionRequest, signers::local::PrivateKeySigner, sol};
use alloy_primitives::{Address, Bytes};
use derive_more::derive::Deref;
use url::Url;

use crate::{
    WalletProviderWithSimpleNonceManager, new_http_client,
    new_wallet_provider_with_simple_nonce_management,
};

/// A wrapper over a `IInbox` contract, the public entrypoint used by aggregators.
#[derive(Debug, Clone, Deref)]
pub struct AggregatorInbox(IInboxInstance<WalletProviderWithSimpleNonceManager>);

impl AggregatorInbox {
    /// Create a new `AggregatorInbox` instance at the given contract address.
    pub fn new<U: Into<Url>>(el_client_url: U, address: Address, wallet: PrivateKeySigner) -> Self {
        let provider =
            new_wallet_provider_with_simple_nonce_management(new_http_client(el_client_url), wallet);

        Self(IInboxInstance::new(address, provider))
    }

    /// Returns a [`TransactionRequest`] for the `sendL2MessageFromOrigin` function.
    pub fn send_message_tx_request(&self, message: Bytes) -> TransactionRequest {
        self.0.sendL2MessageFromOrigin(message).into_transaction_request()
    }
}

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    #[derive(Debug)]
    interface IInbox {
        error NotOrigin();
        error DataTooLarge(uint256 size, uint256 max);
        error Error(string);

        #[derive(Default)]
        event InboxMessageDelivered(uint256 indexed messageNum, bytes data);

        /// @notice Sends an L2 message batch from the transaction origin.
        /// @param messageData The encoded batch.
        /// @return The index of the delivered message.
        function sendL2MessageFromOrigin(bytes calldata messageData) external returns (uint256);
    }
}
