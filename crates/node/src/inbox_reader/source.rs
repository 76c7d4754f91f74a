use std::fmt::Debug;

use alloy_primitives::Address;
use alloy_sol_types::Error as SolError;
use async_trait::async_trait;
use keel_chainio::{
    DefaultProvider, new_default_provider,
    rollup::{
        bridge::{Bridge, decode_delayed_message},
        sequencer_inbox::{
            ConfirmedBatch,
            ISequencerInbox::{ISequencerInboxErrors, ISequencerInboxInstance},
            batch_delivered_filter, decode_confirmed_batch,
        },
    },
    try_parse_contract_error,
};
use keel_clients::execution::ExecutionClient;
use keel_primitives::DelayedMessage;
use url::Url;

use super::InboxReaderError;

/// A read-only view of the rollup contracts on L1.
#[async_trait]
pub trait L1Source: Debug + Send + Sync {
    /// Returns the latest L1 block number.
    async fn head(&self) -> Result<u64, InboxReaderError>;

    /// Returns the delayed messages delivered in the inclusive block range, ordered by index.
    async fn delayed_messages(&self, from: u64, to: u64) -> Result<Vec<DelayedMessage>, InboxReaderError>;

    /// Returns the sequencer batches confirmed in the inclusive block range, in L1 order.
    async fn confirmed_batches(&self, from: u64, to: u64) -> Result<Vec<ConfirmedBatch>, InboxReaderError>;

    /// Returns the total number of sequencer messages confirmed on L1.
    async fn message_count(&self) -> Result<u64, InboxReaderError>;
}

/// An [`L1Source`] backed by an L1 execution client.
#[derive(Debug, Clone)]
pub struct ContractL1Source {
    l1: ExecutionClient,
    bridge: Bridge,
    sequencer_inbox: ISequencerInboxInstance<DefaultProvider>,
}

impl ContractL1Source {
    /// Create a new source for the given contracts.
    pub fn new(l1_url: Url, bridge: Address, sequencer_inbox: Address) -> Self {
        Self {
            l1: ExecutionClient::new(l1_url.clone()),
            bridge: Bridge::new(l1_url.clone(), bridge),
            sequencer_inbox: ISequencerInboxInstance::new(
                sequencer_inbox,
                new_default_provider(l1_url),
            ),
        }
    }
}

#[async_trait]
impl L1Source for ContractL1Source {
    async fn head(&self) -> Result<u64, InboxReaderError> {
        Ok(self.l1.get_head().await?)
    }

    async fn delayed_messages(&self, from: u64, to: u64) -> Result<Vec<DelayedMessage>, InboxReaderError> {
        let logs = self.l1.logs(&self.bridge.message_delivered_filter(from, to)).await?;

        let mut messages =
            logs.iter().map(decode_delayed_message).collect::<Result<Vec<_>, _>>()?;
        messages.sort_by_key(|msg| msg.index);
        Ok(messages)
    }

    async fn confirmed_batches(&self, from: u64, to: u64) -> Result<Vec<ConfirmedBatch>, InboxReaderError> {
        let filter = batch_delivered_filter(*self.sequencer_inbox.address(), from, to);
        let logs = self.l1.logs(&filter).await?;

        Ok(logs.iter().map(decode_confirmed_batch).collect::<Result<Vec<_>, _>>()?)
    }

    async fn message_count(&self) -> Result<u64, InboxReaderError> {
        match self.sequencer_inbox.messageCount().call().await {
            Ok(count) => Ok(count.saturating_to()),
            Err(err) => {
                let decoded = try_parse_contract_error::<ISequencerInboxErrors>(err)?;
                Err(SolError::custom(format!("{decoded:?}")).into())
            }
        }
    }
}
