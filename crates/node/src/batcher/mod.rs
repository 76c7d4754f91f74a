use std::sync::Arc;

use alloy::transports::TransportError;
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use keel_clients::{engine::CoreError, rpc::JsonRpcError};
use keel_primitives::Transaction;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::health::HealthError;

mod queue;
pub(crate) use queue::PendingQueue;

mod gate;
pub use gate::{AlwaysOpen, SubmissionGate};

mod submitter;
pub use submitter::{
    AttemptError, Broadcast, ContractSubmitter, L1Submitter, ReceiptStatus, TxParams,
};

mod poster;
pub use poster::{BatchPoster, Confirmed, PosterSettings};

mod forwarder;
pub use forwarder::Forwarder;

mod aggregator;
pub use aggregator::Aggregator;

mod sequencer;
pub use sequencer::Sequencer;

/// The reason why a transaction was refused. Transactions are only ever refused
/// synchronously: once accepted, a transaction is never dropped.
#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("empty transaction")]
    Empty,
    #[error("transaction too large: {size} bytes, max {max}")]
    TooLarge { size: usize, max: usize },
    #[error("sequence number {got} of sender {sender} is not above {last}")]
    SequenceTooLow { sender: Address, last: u64, got: u64 },
    #[error("pending queue is full")]
    QueueFull,
    #[error("not the active sequencer and no active sequencer is known")]
    NotLeader,
    #[error("the node is still starting up")]
    NotReady,
    #[error("failed to forward transaction: {0}")]
    Forward(#[from] JsonRpcError),
}

/// Errors that can occur while submitting batches.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("Batch rejected by the inbox: {0}")]
    Rejected(String),
    #[error("Batch reverted {0} times")]
    TooManyReverts(usize),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Execution engine error: {0}")]
    Core(#[from] CoreError),
    #[error("Submission cancelled before broadcast")]
    Cancelled,
    #[error("Submission stopped with transaction {0} still unconfirmed")]
    Unconfirmed(B256),
    #[error("Sequencer worker exited: {0}")]
    Worker(String),
}

impl SubmissionError {
    /// Returns `true` if the error must stop the node. Content rejections cannot be fixed by
    /// retrying the same batch.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::TooManyReverts(_) | Self::Worker(_))
    }
}

/// The common contract of every submission mode.
#[async_trait]
pub trait TransactionBatcher: std::fmt::Debug + Send + Sync {
    /// Validate and enqueue a transaction.
    async fn accept(&self, tx: Transaction) -> Result<(), AcceptError>;

    /// Run the submission loop until cancellation.
    async fn run(&self, cancel: CancellationToken) -> Result<(), SubmissionError>;

    /// Returns an error if the mode is not able to serve transactions.
    async fn health_check(&self) -> Result<(), HealthError>;
}

/// The submission mode of the node, selected once from the configuration.
#[derive(Debug)]
pub enum Batcher {
    /// Relays transactions to another node.
    Forwarder(Forwarder),
    /// Submits batches concurrently through the public inbox.
    StatelessAggregator(Aggregator),
    /// Submits one batch at a time through the public inbox.
    StatefulAggregator(Aggregator),
    /// Orders delayed messages and transactions and submits them through the sequencer inbox.
    Sequencer(Arc<Sequencer>),
}

#[async_trait]
impl TransactionBatcher for Batcher {
    async fn accept(&self, tx: Transaction) -> Result<(), AcceptError> {
        match self {
            Self::Forwarder(forwarder) => forwarder.accept(tx).await,
            Self::StatelessAggregator(aggregator) | Self::StatefulAggregator(aggregator) => {
                aggregator.accept(tx)
            }
            Self::Sequencer(sequencer) => sequencer.accept(tx),
        }
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), SubmissionError> {
        match self {
            Self::Forwarder(forwarder) => forwarder.run(cancel).await,
            Self::StatelessAggregator(aggregator) => aggregator.run_stateless(cancel).await,
            Self::StatefulAggregator(aggregator) => aggregator.run_stateful(cancel).await,
            Self::Sequencer(sequencer) => sequencer.run(cancel).await,
        }
    }

    async fn health_check(&self) -> Result<(), HealthError> {
        match self {
            Self::Forwarder(forwarder) => forwarder.health_check().await,
            Self::StatelessAggregator(aggregator) | Self::StatefulAggregator(aggregator) => {
                aggregator.health_check()
            }
            Self::Sequencer(sequencer) => sequencer.health_check().await,
        }
    }
}

/// A handle to the batcher of a running node, for the RPC layer.
///
/// The batcher is only built once the node caught up with L1; until then transactions are
/// refused with [`AcceptError::NotReady`].
#[derive(Debug, Clone)]
pub struct BatcherHandle {
    rx: watch::Receiver<Option<Arc<dyn TransactionBatcher>>>,
}

impl BatcherHandle {
    /// Creates a new handle and the sender used to install the batcher.
    pub(crate) fn new() -> (watch::Sender<Option<Arc<dyn TransactionBatcher>>>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { rx })
    }

    /// Submit a transaction to the node.
    pub async fn accept(&self, tx: Transaction) -> Result<(), AcceptError> {
        let batcher = self.rx.borrow().clone();
        match batcher {
            Some(batcher) => batcher.accept(tx).await,
            None => Err(AcceptError::NotReady),
        }
    }
}
