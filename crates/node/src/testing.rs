//! Test fixtures and in-memory doubles of the external systems.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use alloy::transports::{TransportError, TransportErrorKind};
use alloy_primitives::{Address, B256, Bytes};
use async_trait::async_trait;
use clap::Parser;
use keel_chainio::rollup::sequencer_inbox::ConfirmedBatch;
use keel_clients::engine::{CoreError, CoreStatus, DeliveryResult, ExecutionCore, MessageResult};
use keel_config::Opts;
use keel_primitives::{Batch, BatchBuilder, BatchItem, BatchSettings, DelayedMessage, Transaction};
use tokio::sync::mpsc;

use crate::{
    NodeError,
    batcher::{AttemptError, Broadcast, L1Submitter, ReceiptStatus, TxParams},
    config::RuntimeConfig,
    context::NodeContext,
    inbox_reader::{InboxReaderError, L1Source},
};

const BASE_ARGS: &[&str] = &[
    "keel",
    "--l1.url",
    "http://localhost:8545",
    "--rollup.chain-id",
    "42161",
    "--rollup.bridge",
    "0x0000000000000000000000000000000000000b0b",
    "--rollup.sequencer-inbox",
    "0x0000000000000000000000000000000000000a11",
    "--node.core-url",
    "http://localhost:9000",
    "--node.forwarder.target",
    "http://localhost:8547",
];

/// A transaction of the given sender, with a 4-byte payload unique per sequence number.
pub(crate) fn tx(sender: u8, sequence: u64) -> Transaction {
    let payload = (sequence as u32).to_be_bytes().to_vec();
    Transaction::new(Address::repeat_byte(sender), sequence, Bytes::from(payload))
}

pub(crate) fn delayed_message(index: u64, l1_block_number: u64) -> DelayedMessage {
    DelayedMessage {
        index,
        l1_block_number,
        l1_timestamp: 1_700_000_000 + l1_block_number * 12,
        kind: 3,
        sender: Address::repeat_byte(0xde),
        data: Bytes::from(index.to_be_bytes().to_vec()),
    }
}

/// A batch of transactions of a single sender.
pub(crate) fn test_batch(sequences: &[u64]) -> Batch {
    let settings = BatchSettings { max_items: sequences.len().max(1), max_size: usize::MAX };
    let mut builder = BatchBuilder::new(settings, 0);
    for seq in sequences {
        builder.push(BatchItem::Transaction(tx(1, *seq))).unwrap();
    }
    builder.take()
}

/// A context built from the base options plus `args`. Options are not validated.
pub(crate) fn test_context(
    args: &[&str],
    core: MockCore,
) -> (NodeContext, mpsc::UnboundedReceiver<NodeError>) {
    let opts = Opts::try_parse_from(BASE_ARGS.iter().chain(args.iter()).copied())
        .expect("valid test options");
    NodeContext::new(RuntimeConfig::new(opts), Arc::new(core))
}

#[derive(Debug, Default)]
struct CoreState {
    status: CoreStatus,
    deliveries: Vec<Vec<BatchItem>>,
}

/// An execution engine recording every delivery.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockCore {
    state: Arc<Mutex<CoreState>>,
}

impl MockCore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_delayed_sequenced(&self, count: u64) {
        self.state.lock().unwrap().status.delayed_sequenced = count;
    }

    pub(crate) fn set_status(&self, update: impl FnOnce(&mut CoreStatus)) {
        update(&mut self.state.lock().unwrap().status);
    }

    pub(crate) fn deliveries(&self) -> Vec<Vec<BatchItem>> {
        self.state.lock().unwrap().deliveries.clone()
    }
}

#[async_trait]
impl ExecutionCore for MockCore {
    async fn deliver(&self, messages: &[BatchItem]) -> Result<DeliveryResult, CoreError> {
        let mut state = self.state.lock().unwrap();

        let mut results = Vec::with_capacity(messages.len());
        for item in messages {
            let hash = match item {
                BatchItem::Delayed(msg) => {
                    state.status.delayed_sequenced = msg.index + 1;
                    msg.data_hash()
                }
                BatchItem::Transaction(tx) => tx.hash(),
            };
            state.status.message_count += 1;
            results.push(MessageResult { hash, success: true, error: None });
        }
        state.status.l2_block += 1;
        state.deliveries.push(messages.to_vec());

        Ok(DeliveryResult { results, content_hash: B256::repeat_byte(0xcc) })
    }

    async fn status(&self) -> Result<CoreStatus, CoreError> {
        Ok(self.state.lock().unwrap().status)
    }
}

#[derive(Debug, Default)]
struct L1State {
    head: u64,
    delayed: Vec<DelayedMessage>,
    batches: Vec<ConfirmedBatch>,
    failures: usize,
    scans: usize,
}

/// An in-memory view of the rollup contracts.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockL1Source {
    state: Arc<Mutex<L1State>>,
}

impl MockL1Source {
    pub(crate) fn new(head: u64) -> Self {
        let source = Self::default();
        source.set_head(head);
        source
    }

    pub(crate) fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    pub(crate) fn add_delayed(&self, msg: DelayedMessage) {
        self.state.lock().unwrap().delayed.push(msg);
    }

    pub(crate) fn add_batch(&self, batch: ConfirmedBatch) {
        self.state.lock().unwrap().batches.push(batch);
    }

    /// Fail the next `count` head requests.
    pub(crate) fn fail_next(&self, count: usize) {
        self.state.lock().unwrap().failures = count;
    }

    /// The number of delayed message range scans so far.
    pub(crate) fn scans(&self) -> usize {
        self.state.lock().unwrap().scans
    }
}

#[async_trait]
impl L1Source for MockL1Source {
    async fn head(&self) -> Result<u64, InboxReaderError> {
        let mut state = self.state.lock().unwrap();
        if state.failures > 0 {
            state.failures -= 1;
            return Err(TransportErrorKind::custom_str("connection refused").into());
        }
        Ok(state.head)
    }

    async fn delayed_messages(&self, from: u64, to: u64) -> Result<Vec<DelayedMessage>, InboxReaderError> {
        let mut state = self.state.lock().unwrap();
        state.scans += 1;

        let mut found: Vec<_> = state
            .delayed
            .iter()
            .filter(|msg| (from..=to).contains(&msg.l1_block_number))
            .cloned()
            .collect();
        found.sort_by_key(|msg| msg.index);
        Ok(found)
    }

    async fn confirmed_batches(&self, from: u64, to: u64) -> Result<Vec<ConfirmedBatch>, InboxReaderError> {
        let state = self.state.lock().unwrap();
        Ok(state.batches.iter().filter(|b| (from..=to).contains(&b.l1_block_number)).copied().collect())
    }

    async fn message_count(&self) -> Result<u64, InboxReaderError> {
        let state = self.state.lock().unwrap();
        Ok(state.batches.iter().map(|b| b.new_message_count).max().unwrap_or_default())
    }
}

/// What happens to the next broadcast of a [`MockSubmitter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubmitterStep {
    /// Accepted but never mined.
    Pending,
    /// Mined successfully.
    Confirm,
    /// Mined and reverted for an unknown reason.
    Revert,
    /// Mined and reverted with a decoded inbox error.
    RevertWith(&'static str),
    /// Refused by the RPC endpoint.
    TransportError,
}

/// A broadcast recorded by a [`MockSubmitter`].
#[derive(Debug, Clone)]
pub(crate) struct BroadcastRecord {
    pub(crate) batch: Batch,
    pub(crate) params: TxParams,
}

#[derive(Debug, Default)]
struct SubmitterState {
    script: VecDeque<SubmitterStep>,
    broadcasts: Vec<BroadcastRecord>,
    outcomes: HashMap<B256, SubmitterStep>,
    next_nonce: u64,
}

/// An L1 submitter following a script. Broadcasts beyond the script are confirmed.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockSubmitter {
    state: Arc<Mutex<SubmitterState>>,
}

impl MockSubmitter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn script(&self, steps: impl IntoIterator<Item = SubmitterStep>) {
        self.state.lock().unwrap().script.extend(steps);
    }

    pub(crate) fn broadcasts(&self) -> Vec<BroadcastRecord> {
        self.state.lock().unwrap().broadcasts.clone()
    }
}

#[async_trait]
impl L1Submitter for MockSubmitter {
    async fn broadcast(&self, batch: &Batch, params: TxParams) -> Result<Broadcast, AttemptError> {
        let mut state = self.state.lock().unwrap();
        let step = state.script.pop_front().unwrap_or(SubmitterStep::Confirm);
        if step == SubmitterStep::TransportError {
            let err: TransportError = TransportErrorKind::custom_str("connection reset");
            return Err(err.into());
        }

        let nonce = params.nonce.unwrap_or_else(|| {
            let nonce = state.next_nonce;
            state.next_nonce += 1;
            nonce
        });
        let filled = TxParams {
            nonce: Some(nonce),
            gas_limit: Some(params.gas_limit.unwrap_or(100_000)),
            max_fee_per_gas: Some(params.max_fee_per_gas.unwrap_or(100)),
            max_priority_fee_per_gas: Some(params.max_priority_fee_per_gas.unwrap_or(1)),
        };

        let hash = B256::left_padding_from(&(state.broadcasts.len() as u64 + 1).to_be_bytes());
        state.broadcasts.push(BroadcastRecord { batch: batch.clone(), params: filled });
        state.outcomes.insert(hash, step);

        Ok(Broadcast { hash, params: filled })
    }

    async fn receipt(&self, hash: B256) -> Result<Option<ReceiptStatus>, TransportError> {
        let state = self.state.lock().unwrap();
        let status = match state.outcomes.get(&hash) {
            Some(SubmitterStep::Confirm) => Some(ReceiptStatus { success: true, block_number: Some(1) }),
            Some(SubmitterStep::Revert | SubmitterStep::RevertWith(_)) => {
                Some(ReceiptStatus { success: false, block_number: Some(1) })
            }
            _ => None,
        };
        Ok(status)
    }

    async fn revert_reason(&self, hash: B256) -> Option<String> {
        match self.state.lock().unwrap().outcomes.get(&hash) {
            Some(SubmitterStep::RevertWith(reason)) => Some((*reason).to_owned()),
            _ => None,
        }
    }
}
