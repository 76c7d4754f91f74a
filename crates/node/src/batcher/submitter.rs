use std::fmt::Debug;

use alloy::{
    consensus::Transaction as _,
    eips::eip2718::Encodable2718,
    network::TransactionBuilder,
    providers::Provider,
    signers::local::PrivateKeySigner,
    transports::{RpcError, TransportError, TransportErrorKind},
};
use alloy_primitives::{Address, B256};
use alloy_sol_types::SolInterface;
use async_trait::async_trait;
use keel_chainio::{
    TryParseTransportErrorResult, WalletProviderWithSimpleNonceManager,
    rollup::{
        inbox::{AggregatorInbox, IInbox::IInboxErrors},
        sequencer_inbox::{ISequencerInbox::ISequencerInboxErrors, SequencerInbox},
    },
    try_parse_transport_error,
};
use keel_clients::execution::ExecutionClient;
use keel_primitives::{Batch, summary::Summary};
use thiserror::Error;
use tracing::{Level, debug, info, span_enabled, warn};
use url::Url;

/// The error message returned when the nonce was already used by a mined transaction.
const NONCE_TOO_LOW_ERROR: &str = "nonce too low";

/// The error message returned when the exact same transaction is already in the mempool.
const ALREADY_KNOWN_ERROR: &str = "already known";

/// Error messages meaning that the fees are too low to be included or to replace a
/// transaction with the same nonce.
const UNDERPRICED_ERRORS: [&str; 3] = [
    "replacement transaction underpriced",
    "transaction underpriced",
    "max fee per gas less than block base fee",
];

/// The parameters of a submission transaction. `None` fields are filled by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxParams {
    /// The nonce of the transaction.
    pub nonce: Option<u64>,
    /// The gas limit of the transaction.
    pub gas_limit: Option<u64>,
    /// The maximum fee per gas, in wei.
    pub max_fee_per_gas: Option<u128>,
    /// The maximum priority fee per gas, in wei.
    pub max_priority_fee_per_gas: Option<u128>,
}

impl TxParams {
    /// Raise both fees by `percent`, rounding up. Returns `false` and leaves the fees untouched
    /// if they are not known yet or if the new max fee would exceed `cap`.
    pub fn bump(&mut self, percent: u32, cap: u128) -> bool {
        let (Some(max_fee), Some(tip)) = (self.max_fee_per_gas, self.max_priority_fee_per_gas)
        else {
            return false;
        };

        let new_max_fee = bump_by_percent(max_fee, percent);
        if new_max_fee > cap {
            return false;
        }

        self.max_fee_per_gas = Some(new_max_fee);
        self.max_priority_fee_per_gas = Some(bump_by_percent(tip, percent).min(new_max_fee));
        true
    }
}

fn bump_by_percent(value: u128, percent: u32) -> u128 {
    let scaled = value.saturating_mul(100 + u128::from(percent));
    scaled.div_ceil(100)
}

/// A transaction accepted by the L1 mempool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Broadcast {
    /// The transaction hash.
    pub hash: B256,
    /// The parameters the transaction was signed with, all filled.
    pub params: TxParams,
}

/// The outcome of a mined submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptStatus {
    /// Whether the transaction executed successfully.
    pub success: bool,
    /// The block the transaction was included in.
    pub block_number: Option<u64>,
}

/// Errors of a single broadcast attempt.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("Batch rejected by the inbox: {0}")]
    Rejected(String),
    #[error("Fees too low to be included or to replace the pending transaction")]
    Underpriced,
    #[error("Nonce already used")]
    NonceTooLow,
    #[error("Max fee per gas {fee} above the cap of {cap}")]
    FeesTooHigh { fee: u128, cap: u128 },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Signs and broadcasts batches to an L1 inbox.
#[async_trait]
pub trait L1Submitter: Debug + Send + Sync {
    /// Sign and broadcast `batch` with the given parameters.
    async fn broadcast(&self, batch: &Batch, params: TxParams) -> Result<Broadcast, AttemptError>;

    /// Returns the receipt status of the transaction, if it was mined.
    async fn receipt(&self, hash: B256) -> Result<Option<ReceiptStatus>, TransportError>;

    /// Returns the decoded inbox error a mined transaction reverted with, if known.
    async fn revert_reason(&self, hash: B256) -> Option<String>;
}

#[derive(Debug, Clone)]
enum Inbox {
    Sequencer(SequencerInbox),
    Aggregator(AggregatorInbox),
}

/// An [`L1Submitter`] posting to the sequencer inbox or to the public aggregator inbox.
#[derive(Debug, Clone)]
pub struct ContractSubmitter {
    inbox: Inbox,
    l1: ExecutionClient,
    max_fee_per_gas: u128,
}

impl ContractSubmitter {
    /// Creates a submitter posting through `addSequencerL2BatchFromOrigin`.
    pub fn sequencer(
        l1_url: Url,
        address: Address,
        wallet: PrivateKeySigner,
        max_fee_per_gas: u128,
    ) -> Self {
        Self {
            inbox: Inbox::Sequencer(SequencerInbox::new(l1_url.clone(), address, wallet)),
            l1: ExecutionClient::new(l1_url),
            max_fee_per_gas,
        }
    }

    /// Creates a submitter posting through `sendL2MessageFromOrigin`.
    pub fn aggregator(
        l1_url: Url,
        address: Address,
        wallet: PrivateKeySigner,
        max_fee_per_gas: u128,
    ) -> Self {
        Self {
            inbox: Inbox::Aggregator(AggregatorInbox::new(l1_url.clone(), address, wallet)),
            l1: ExecutionClient::new(l1_url),
            max_fee_per_gas,
        }
    }

    fn provider(&self) -> &WalletProviderWithSimpleNonceManager {
        match &self.inbox {
            Inbox::Sequencer(inbox) => inbox.provider(),
            Inbox::Aggregator(inbox) => inbox.provider(),
        }
    }

    fn parse_error(&self, err: TransportError) -> AttemptError {
        match &self.inbox {
            Inbox::Sequencer(_) => classify(try_parse_transport_error::<ISequencerInboxErrors>(err)),
            Inbox::Aggregator(_) => classify(try_parse_transport_error::<IInboxErrors>(err)),
        }
    }
}

#[async_trait]
impl L1Submitter for ContractSubmitter {
    async fn broadcast(&self, batch: &Batch, params: TxParams) -> Result<Broadcast, AttemptError> {
        let mut tx_req = match &self.inbox {
            Inbox::Sequencer(inbox) => inbox.add_batch_tx_request(batch.encode()),
            Inbox::Aggregator(inbox) => inbox.send_message_tx_request(batch.encode_l2_message()),
        };

        // Fixed parameters are reused across attempts, the rest is filled by the provider.
        if let Some(nonce) = params.nonce {
            tx_req.set_nonce(nonce);
        }
        if let Some(gas_limit) = params.gas_limit {
            tx_req.set_gas_limit(gas_limit);
        }
        if let Some(max_fee) = params.max_fee_per_gas {
            tx_req.set_max_fee_per_gas(max_fee);
        }
        if let Some(tip) = params.max_priority_fee_per_gas {
            tx_req.set_max_priority_fee_per_gas(tip);
        }

        // Note: it's critical to use a provider configured with `SimpleNonceManager` here,
        // otherwise a dropped transaction leaves a nonce gap behind.
        let provider = self.provider();
        let envelope = match provider.fill(tx_req).await {
            Ok(filled) => match filled.try_into_envelope() {
                Ok(envelope) => envelope,
                Err(_) => {
                    return Err(TransportErrorKind::custom_str("filled transaction is unsigned").into())
                }
            },
            Err(err) => return Err(self.parse_error(err)),
        };

        let max_fee = envelope.max_fee_per_gas();
        if max_fee > self.max_fee_per_gas {
            return Err(AttemptError::FeesTooHigh { fee: max_fee, cap: self.max_fee_per_gas });
        }

        let filled = TxParams {
            nonce: Some(envelope.nonce()),
            gas_limit: Some(envelope.gas_limit()),
            max_fee_per_gas: Some(max_fee),
            max_priority_fee_per_gas: Some(envelope.max_priority_fee_per_gas().unwrap_or(max_fee)),
        };
        let hash = *envelope.tx_hash();

        if span_enabled!(Level::DEBUG) {
            debug!(tx = %envelope.summary(), "⚒️ Batch prepared");
        } else {
            info!(%hash, nonce = envelope.nonce(), max_fee, "🛠️ Batch prepared");
        }

        // Note: we use send_raw_transaction because send() is just broken.
        match provider.send_raw_transaction(&envelope.encoded_2718()).await {
            Ok(pending) => Ok(Broadcast { hash: *pending.tx_hash(), params: filled }),
            Err(err) if error_message(&err).is_some_and(|m| m.contains(ALREADY_KNOWN_ERROR)) => {
                debug!(%hash, "Transaction already in the mempool");
                Ok(Broadcast { hash, params: filled })
            }
            Err(err) => Err(self.parse_error(err)),
        }
    }

    async fn receipt(&self, hash: B256) -> Result<Option<ReceiptStatus>, TransportError> {
        let receipt = self.provider().get_transaction_receipt(hash).await?;
        Ok(receipt.map(|r| ReceiptStatus { success: r.status(), block_number: r.block_number }))
    }

    async fn revert_reason(&self, hash: B256) -> Option<String> {
        let trace = match self.l1.debug_revert_reason(hash).await {
            Ok(trace) => trace,
            Err(e) => {
                warn!(error = ?e, %hash, "Failed to get revert reason by tracing the tx");
                return None;
            }
        };

        match &self.inbox {
            Inbox::Sequencer(_) => {
                debug!(%hash, reason = trace.describe::<ISequencerInboxErrors>(), "Revert trace");
                trace.decode::<ISequencerInboxErrors>().map(|e| format!("{e:?}"))
            }
            Inbox::Aggregator(_) => {
                debug!(%hash, reason = trace.describe::<IInboxErrors>(), "Revert trace");
                trace.decode::<IInboxErrors>().map(|e| format!("{e:?}"))
            }
        }
    }
}

/// Returns the lowercase message of a JSON-RPC error response.
fn error_message(err: &TransportError) -> Option<String> {
    match err {
        RpcError::ErrorResp(payload) => Some(payload.message.to_lowercase()),
        _ => None,
    }
}

/// Sort a failed attempt into content rejections and retryable failures.
fn classify<I: SolInterface + Debug>(result: TryParseTransportErrorResult<I>) -> AttemptError {
    match result {
        TryParseTransportErrorResult::Decoded(e) => AttemptError::Rejected(format!("{e:?}")),
        TryParseTransportErrorResult::UnknownSelector(data) => {
            AttemptError::Rejected(format!("execution reverted with unknown selector: {data}"))
        }
        TryParseTransportErrorResult::Original(err) => match error_message(&err) {
            Some(msg) if msg.contains(NONCE_TOO_LOW_ERROR) => AttemptError::NonceTooLow,
            Some(msg) if UNDERPRICED_ERRORS.iter().any(|e| msg.contains(e)) => {
                AttemptError::Underpriced
            }
            _ => AttemptError::Transport(err),
        },
    }
}

#[cfg(test)]
mod tests {
    use alloy::rpc::json_rpc::ErrorPayload;

    use super::*;

    fn error_resp(message: &str) -> TransportError {
        RpcError::ErrorResp(ErrorPayload {
            code: -32000,
            message: message.to_owned().into(),
            data: None,
        })
    }

    #[test]
    fn bump_rounds_up_and_respects_the_cap() {
        let mut params = TxParams {
            max_fee_per_gas: Some(100),
            max_priority_fee_per_gas: Some(1),
            ..Default::default()
        };

        assert!(params.bump(10, 1_000));
        assert_eq!(params.max_fee_per_gas, Some(110));
        assert_eq!(params.max_priority_fee_per_gas, Some(2));

        assert!(!params.bump(10, 115));
        assert_eq!(params.max_fee_per_gas, Some(110));

        assert!(!TxParams::default().bump(10, 1_000));
    }

    #[test]
    fn node_errors_are_classified() {
        let classify_msg = |msg: &str| {
            classify(try_parse_transport_error::<ISequencerInboxErrors>(error_resp(msg)))
        };

        assert!(matches!(classify_msg("nonce too low: next nonce 5"), AttemptError::NonceTooLow));
        assert!(matches!(
            classify_msg("replacement transaction underpriced"),
            AttemptError::Underpriced
        ));
        assert!(matches!(classify_msg("header not found"), AttemptError::Transport(_)));
    }
}
