use std::{fmt::Debug, time::Duration};

use alloy_primitives::B256;
use async_trait::async_trait;
use keel_primitives::{BatchItem, summary::Summary};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::rpc::{JsonRpcClient, JsonRpcError};

/// The default timeout of a request to the execution engine.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors returned by an [`ExecutionCore`].
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The engine could not be reached or answered with an error.
    #[error(transparent)]
    Rpc(#[from] JsonRpcError),
    /// The engine refused the delivery, e.g. because of an ordering violation.
    #[error("delivery refused: {0}")]
    Refused(String),
}

/// The outcome of executing a single delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResult {
    /// The hash of the delivered message.
    pub hash: B256,
    /// Whether the message executed successfully.
    pub success: bool,
    /// The execution error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The result of a [`ExecutionCore::deliver`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    /// Per-message results, in delivery order.
    pub results: Vec<MessageResult>,
    /// The content hash of the engine state after the delivery.
    pub content_hash: B256,
}

/// The progress of the execution engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreStatus {
    /// The number of messages executed so far.
    pub message_count: u64,
    /// The number of delayed messages sequenced so far.
    pub delayed_sequenced: u64,
    /// The number of messages whose logs were processed.
    pub logs_processed: u64,
    /// The latest L2 block number.
    pub l2_block: u64,
}

impl Summary for CoreStatus {
    fn summary(&self) -> String {
        format!(
            "messages={}, delayed={}, logs={}, l2_block={}",
            self.message_count, self.delayed_sequenced, self.logs_processed, self.l2_block
        )
    }
}

/// The execution engine the sequencer delivers ordered messages to.
#[async_trait]
pub trait ExecutionCore: Debug + Send + Sync {
    /// Deliver an ordered run of messages for execution.
    async fn deliver(&self, messages: &[BatchItem]) -> Result<DeliveryResult, CoreError>;

    /// Returns the current progress of the engine.
    async fn status(&self) -> Result<CoreStatus, CoreError>;
}

/// An [`ExecutionCore`] reached over JSON-RPC.
#[derive(Debug)]
pub struct RpcExecutionCore {
    client: JsonRpcClient,
}

impl RpcExecutionCore {
    /// Create a new client for the engine at the given URL.
    pub fn new(url: Url) -> Self {
        Self { client: JsonRpcClient::new(url, DEFAULT_TIMEOUT) }
    }
}

#[async_trait]
impl ExecutionCore for RpcExecutionCore {
    async fn deliver(&self, messages: &[BatchItem]) -> Result<DeliveryResult, CoreError> {
        // Deliveries are not retried here: a retry after a timeout could execute twice.
        let result: DeliveryResult = self.client.call("keel_deliverMessages", (messages,)).await?;

        if result.results.len() != messages.len() {
            return Err(CoreError::Refused(format!(
                "expected {} results, got {}",
                messages.len(),
                result.results.len()
            )));
        }

        Ok(result)
    }

    async fn status(&self) -> Result<CoreStatus, CoreError> {
        Ok(self.client.call_with_retries("keel_coreStatus", ()).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread};

    use alloy_primitives::{Address, Bytes};
    use keel_primitives::Transaction;
    use mockito::{Matcher, Server};
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_core_status() {
        let (server_tx, server_rx) = mpsc::channel();

        let server_handle = thread::spawn(move || {
            let mut server = Server::new();
            let mock = server
                .mock("POST", "/")
                .match_body(Matcher::PartialJson(json!({ "method": "keel_coreStatus" })))
                .with_body(
                    json!({
                        "jsonrpc": "2.0",
                        "id": 1,
                        "result": {
                            "messageCount": 12,
                            "delayedSequenced": 4,
                            "logsProcessed": 11,
                            "l2Block": 9
                        }
                    })
                    .to_string(),
                )
                .expect(1)
                .create();

            server_tx.send((server.url(), mock)).unwrap();
            thread::park();
        });

        let (server_url, mock) = server_rx.recv().unwrap();
        let core = RpcExecutionCore::new(Url::parse(&server_url).unwrap());

        let status = core.status().await.unwrap();
        mock.assert();
        assert_eq!(
            status,
            CoreStatus { message_count: 12, delayed_sequenced: 4, logs_processed: 11, l2_block: 9 }
        );

        server_handle.thread().unpark();
        server_handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_deliver_checks_result_count() {
        let (server_tx, server_rx) = mpsc::channel();

        let server_handle = thread::spawn(move || {
            let mut server = Server::new();
            let mock = server
                .mock("POST", "/")
                .match_body(Matcher::PartialJson(json!({ "method": "keel_deliverMessages" })))
                .with_body(
                    json!({
                        "jsonrpc": "2.0",
                        "id": 1,
                        "result": { "results": [], "contentHash": B256::ZERO }
                    })
                    .to_string(),
                )
                .expect(1)
                .create();

            server_tx.send((server.url(), mock)).unwrap();
            thread::park();
        });

        let (server_url, mock) = server_rx.recv().unwrap();
        let core = RpcExecutionCore::new(Url::parse(&server_url).unwrap());

        let tx = Transaction::new(Address::ZERO, 0, Bytes::from_static(b"tx"));
        let result = core.deliver(&[BatchItem::Transaction(tx)]).await;

        mock.assert();
        assert!(matches!(result, Err(CoreError::Refused(_))));

        server_handle.thread().unpark();
        server_handle.join().unwrap();
    }
}
