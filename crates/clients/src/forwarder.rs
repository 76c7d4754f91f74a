use std::time::Duration;

use alloy_primitives::{B256, Bytes, U64};
use url::Url;

use crate::rpc::{JsonRpcClient, JsonRpcError};

/// The default timeout of a forwarded request.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A client of the node accepted transactions are forwarded to.
///
/// Forwarded submissions are retried on transient failures: `eth_sendRawTransaction` is
/// idempotent for the same raw transaction.
#[derive(Debug)]
pub struct ForwarderClient {
    inner: JsonRpcClient,
}

impl ForwarderClient {
    /// Create a new [`ForwarderClient`] for the given target URL.
    pub fn new(url: Url) -> Self {
        Self { inner: JsonRpcClient::new(url, DEFAULT_TIMEOUT) }
    }

    /// The URL of the forwarding target.
    pub const fn url(&self) -> &Url {
        self.inner.url()
    }

    /// Forward a raw signed transaction, returning its hash as reported by the target.
    pub async fn send_raw_transaction(&self, payload: &Bytes) -> Result<B256, JsonRpcError> {
        self.inner.call_with_retries("eth_sendRawTransaction", (payload,)).await
    }

    /// Returns the latest L2 block number of the target.
    pub async fn block_number(&self) -> Result<u64, JsonRpcError> {
        let number: U64 = self.inner.call_with_retries("eth_blockNumber", ()).await?;
        Ok(number.to())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread};

    use mockito::{Matcher, Server};
    use serde_json::json;
    use tokio::time::Instant;

    use super::*;

    #[tokio::test]
    async fn test_retry_logic_first_fails_second_succeeds() {
        let (server_tx, server_rx) = mpsc::channel();

        let server_handle = thread::spawn(move || {
            let mut server = Server::new();

            // Save mocks to verify them
            let fail_mock = server.mock("POST", "/").with_status(503).expect(1).create();
            let success_mock = server
                .mock("POST", "/")
                .match_body(Matcher::PartialJson(json!({ "method": "eth_blockNumber" })))
                .with_body(r#"{"jsonrpc":"2.0","id":2,"result":"0x2a"}"#)
                .expect(1)
                .create();

            server_tx.send((server.url(), fail_mock, success_mock)).unwrap();
            thread::park();
        });

        let (server_url, fail_mock, success_mock) = server_rx.recv().unwrap();
        let client = ForwarderClient::new(Url::parse(&server_url).unwrap());

        let start_time = Instant::now();
        let result = client.block_number().await;
        let elapsed = start_time.elapsed();

        fail_mock.assert();
        success_mock.assert();

        assert_eq!(result.unwrap(), 42);
        assert!(elapsed >= client.inner.config.base_delay);

        server_handle.thread().unpark();
        server_handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_send_raw_transaction() {
        let hash = B256::repeat_byte(0x42);
        let (server_tx, server_rx) = mpsc::channel();

        let server_handle = thread::spawn(move || {
            let mut server = Server::new();
            let mock = server
                .mock("POST", "/")
                .match_body(Matcher::PartialJson(json!({
                    "method": "eth_sendRawTransaction",
                    "params": ["0xdeadbeef"]
                })))
                .with_body(json!({ "jsonrpc": "2.0", "id": 1, "result": hash }).to_string())
                .expect(1)
                .create();

            server_tx.send((server.url(), mock)).unwrap();
            thread::park();
        });

        let (server_url, mock) = server_rx.recv().unwrap();
        let client = ForwarderClient::new(Url::parse(&server_url).unwrap());

        let result = client.send_raw_transaction(&Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef])).await;

        mock.assert();
        assert_eq!(result.unwrap(), hash);

        server_handle.thread().unpark();
        server_handle.join().unwrap();
    }
}
