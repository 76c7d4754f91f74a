use alloy::{
    network::Ethereum,
    providers::{
        Provider, ProviderBuilder, RootProvider, fillers::FillProvider,
        utils::JoinedRecommendedFillers,
    },
    rpc::{
        client::RpcClient,
        types::{Filter, Log},
    },
    transports::TransportResult,
};
use alloy_primitives::{Address, B256, Bytes, U64, U256};
use alloy_rpc_types_trace::geth::{
    CallConfig, CallFrame, GethDebugBuiltInTracerType, GethDebugTracerType, GethDebugTracingOptions,
};
use alloy_sol_types::SolInterface;
use derive_more::derive::{Deref, DerefMut};
use keel_chainio::new_http_client;
use url::Url;

/// An HTTP-based JSON-RPC execution client for the L1 chain.
///
/// This struct is a wrapper over an inner [`RootProvider`] and extends it with
/// the few methods the inbox reader and the batch poster rely on.
#[derive(Clone, Debug, Deref, DerefMut)]
pub struct ExecutionClient {
    /// The custom RPC client that allows us to issue raw requests.
    rpc: RpcClient,
    /// The inner provider that implements all the JSON-RPC methods, that can be
    /// easily used via dereferencing this struct.
    #[deref]
    #[deref_mut]
    inner: FillProvider<JoinedRecommendedFillers, RootProvider, Ethereum>,
}

impl ExecutionClient {
    /// Create a new [`ExecutionClient`] with the given HTTP URL.
    pub fn new<U: Into<Url>>(http_url: U) -> Self {
        let rpc = new_http_client(http_url);
        let inner = ProviderBuilder::new().connect_client(rpc.clone());

        Self { rpc, inner }
    }

    /// Get the latest block number
    pub async fn get_head(&self) -> TransportResult<u64> {
        let result: U64 = self.rpc.request("eth_blockNumber", ()).await?;

        Ok(result.to())
    }

    /// Get the logs matching the given filter.
    pub async fn logs(&self, filter: &Filter) -> TransportResult<Vec<Log>> {
        self.inner.get_logs(filter).await
    }

    /// Get the balance of the given account at the latest block.
    pub async fn balance(&self, address: Address) -> TransportResult<U256> {
        self.inner.get_balance(address).await
    }

    /// Runs a simple `debug_traceTransaction` RPC call to establish the revert reason of a
    /// transaction, if any.
    ///
    /// NOTE: assumes a client compatible with the `debug_traceTransaction` RPC call
    pub async fn debug_revert_reason(&self, tx_hash: B256) -> TransportResult<RevertReasonTrace> {
        let opts = GethDebugTracingOptions::default()
            .with_tracer(GethDebugTracerType::BuiltInTracer(GethDebugBuiltInTracerType::CallTracer))
            .with_config(CallConfig::default().only_top_call());

        let trace: CallFrame = self.rpc.request("debug_traceTransaction", (tx_hash, opts)).await?;

        match trace.revert_reason {
            Some(reason) => Ok(RevertReasonTrace::String(reason)),
            None => match trace.output {
                Some(output) => Ok(RevertReasonTrace::ContractBytes(output)),
                None => Ok(RevertReasonTrace::Unknown),
            },
        }
    }
}

/// The result of a `debug_traceTransaction` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertReasonTrace {
    /// The revert reason is a string.
    String(String),
    /// The output is a bytes object.
    ContractBytes(Bytes),
    /// The reason is unknown
    Unknown,
}

impl RevertReasonTrace {
    /// Try to decode the revert reason into a specific interface. Returns `None` if the
    /// output is not a known error of that interface.
    pub fn decode<I: SolInterface>(&self) -> Option<I> {
        match self {
            Self::ContractBytes(bytes) => I::abi_decode(bytes).ok(),
            Self::String(_) | Self::Unknown => None,
        }
    }

    /// Returns a human-readable version of the revert reason.
    pub fn describe<I: SolInterface + std::fmt::Debug>(&self) -> String {
        match self {
            Self::String(reason) => reason.clone(),
            Self::ContractBytes(bytes) => match I::abi_decode(bytes) {
                Ok(decoded) => format!("{decoded:?}"),
                Err(_) => format!("unknown error: {bytes}"),
            },
            Self::Unknown => "unknown".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy_sol_types::SolError;
    use keel_chainio::rollup::sequencer_inbox::ISequencerInbox::{
        DelayedTooFar, ISequencerInboxErrors,
    };

    use super::*;

    #[test]
    fn revert_trace_decodes_known_errors() {
        let err = DelayedTooFar { available: U256::from(3), requested: U256::from(9) };
        let trace = RevertReasonTrace::ContractBytes(err.abi_encode().into());

        let decoded = trace.decode::<ISequencerInboxErrors>();
        assert!(matches!(decoded, Some(ISequencerInboxErrors::DelayedTooFar(_))));
        assert!(trace.describe::<ISequencerInboxErrors>().contains("DelayedTooFar"));
    }

    #[test]
    fn revert_trace_strings_are_not_decoded() {
        let trace = RevertReasonTrace::String("out of gas".to_owned());
        assert!(trace.decode::<ISequencerInboxErrors>().is_none());
        assert_eq!(trace.describe::<ISequencerInboxErrors>(), "out of gas");
    }

    /// This test is ignored because it requires a local devnet running.
    /// It can still be useful for manually debugging reverted transactions.
    #[ignore]
    #[tokio::test]
    async fn test_debug_revert_reason() {
        let url = Url::parse("http://localhost:8545").unwrap();
        let client = ExecutionClient::new(url);

        let tx_hash = B256::ZERO;
        let reason = client.debug_revert_reason(tx_hash).await.unwrap();

        println!("reason: {}", reason.describe::<ISequencerInboxErrors>());
    }
}
