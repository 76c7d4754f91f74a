use std::sync::Arc;

use keel_clients::{engine::ExecutionCore, forwarder::ForwarderClient};
use keel_primitives::Transaction;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{AcceptError, SubmissionError};
use crate::{health::HealthError, metrics::NodeMetrics};

/// Relays accepted transactions to another node, without batching them.
#[derive(Debug)]
pub struct Forwarder {
    client: ForwarderClient,
    core: Arc<dyn ExecutionCore>,
    max_tx_size: usize,
    max_l2_block_diff: u64,
}

impl Forwarder {
    /// Creates a new instance of [`Forwarder`].
    pub fn new(
        client: ForwarderClient,
        core: Arc<dyn ExecutionCore>,
        max_tx_size: usize,
        max_l2_block_diff: u64,
    ) -> Self {
        Self { client, core, max_tx_size, max_l2_block_diff }
    }

    /// Forward a transaction. The target's refusal is returned to the caller.
    pub async fn accept(&self, tx: Transaction) -> Result<(), AcceptError> {
        if tx.is_empty() {
            return Err(AcceptError::Empty);
        }
        if tx.size() > self.max_tx_size {
            return Err(AcceptError::TooLarge { size: tx.size(), max: self.max_tx_size });
        }

        let hash = self.client.send_raw_transaction(&tx.payload).await?;
        debug!(%hash, target = %self.client.url(), "Transaction forwarded");
        NodeMetrics::increment_forwarded_transactions();
        Ok(())
    }

    /// Forwarding happens inline in [`Self::accept`], so there is no loop to drive.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SubmissionError> {
        info!(target = %self.client.url(), "🤠 Forwarding transactions");
        cancel.cancelled().await;
        Ok(())
    }

    /// Unhealthy if the target is unreachable or too far from the local engine.
    pub async fn health_check(&self) -> Result<(), HealthError> {
        let target_block = self
            .client
            .block_number()
            .await
            .map_err(|e| HealthError::Unhealthy(format!("forwarding target unreachable: {e}")))?;

        let local_block = self
            .core
            .status()
            .await
            .map_err(|e| HealthError::Unhealthy(format!("execution engine unreachable: {e}")))?
            .l2_block;

        let diff = target_block.abs_diff(local_block);
        if diff > self.max_l2_block_diff {
            return Err(HealthError::Unhealthy(format!(
                "forwarding target at block {target_block}, local engine at {local_block}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread};

    use mockito::{Matcher, Server};
    use serde_json::json;
    use url::Url;

    use super::*;
    use crate::testing::{MockCore, tx};

    #[tokio::test]
    async fn forwards_the_raw_payload() {
        let (server_tx, server_rx) = mpsc::channel();

        thread::spawn(move || {
            let mut server = Server::new();
            let mock = server
                .mock("POST", "/")
                .match_body(Matcher::PartialJson(json!({ "method": "eth_sendRawTransaction" })))
                .with_body(format!(
                    r#"{{"jsonrpc":"2.0","id":1,"result":"{}"}}"#,
                    alloy_primitives::B256::ZERO
                ))
                .expect(1)
                .create();

            server_tx.send((server.url(), mock)).unwrap();
            thread::park();
        });

        let (url, mock) = server_rx.recv().unwrap();
        let client = ForwarderClient::new(Url::parse(&url).unwrap());
        let forwarder = Forwarder::new(client, Arc::new(MockCore::new()), 100, 10);

        forwarder.accept(tx(1, 1)).await.unwrap();
        mock.assert();
    }

    #[tokio::test]
    async fn oversized_transactions_are_not_forwarded() {
        // Nothing listens on this address: a forward attempt would fail with a transport error.
        let client = ForwarderClient::new(Url::parse("http://127.0.0.1:1").unwrap());
        let forwarder = Forwarder::new(client, Arc::new(MockCore::new()), 2, 10);

        let err = forwarder.accept(tx(1, 1)).await.unwrap_err();
        assert!(matches!(err, AcceptError::TooLarge { max: 2, .. }));
    }
}
