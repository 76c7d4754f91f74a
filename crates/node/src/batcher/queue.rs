use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use alloy_primitives::Address;
use keel_primitives::{Batch, BatchBuilder, BatchItem, Transaction, batch::PushError};
use tokio::{
    sync::Notify,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;

use super::AcceptError;
use crate::metrics::NodeMetrics;

/// Transactions accepted by a batcher and not batched yet.
///
/// `push` is safe for concurrent callers. Transactions leave the queue in acceptance order,
/// and only towards a batch or another sequencer: they are never dropped.
#[derive(Debug)]
pub(crate) struct PendingQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    max_tx_size: usize,
}

#[derive(Debug, Default)]
struct QueueInner {
    txs: VecDeque<Transaction>,
    /// The last sequence number accepted for each sender.
    last_sequence: HashMap<Address, u64>,
}

impl PendingQueue {
    /// Creates an empty queue.
    pub(crate) fn new(capacity: usize, max_tx_size: usize) -> Self {
        Self { inner: Mutex::default(), notify: Notify::new(), capacity, max_tx_size }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reject transactions that can never be included.
    pub(crate) fn validate(&self, tx: &Transaction) -> Result<(), AcceptError> {
        if tx.payload.is_empty() {
            return Err(AcceptError::Empty);
        }
        if tx.payload.len() > self.max_tx_size {
            return Err(AcceptError::TooLarge { size: tx.payload.len(), max: self.max_tx_size });
        }
        Ok(())
    }

    /// Validate and enqueue a transaction.
    pub(crate) fn push(&self, tx: Transaction) -> Result<(), AcceptError> {
        self.validate(&tx)?;

        let mut inner = self.lock();
        if let Some(&last) = inner.last_sequence.get(&tx.sender) {
            if tx.sequence <= last {
                return Err(AcceptError::SequenceTooLow { sender: tx.sender, last, got: tx.sequence });
            }
        }
        if inner.txs.len() >= self.capacity {
            return Err(AcceptError::QueueFull);
        }

        inner.last_sequence.insert(tx.sender, tx.sequence);
        inner.txs.push_back(tx);
        NodeMetrics::set_pending_queue_len(inner.txs.len());
        drop(inner);

        self.notify.notify_one();
        Ok(())
    }

    /// Put transactions back at the front of the queue, preserving their order. Capacity is
    /// not enforced: these were accepted already.
    pub(crate) fn requeue(&self, txs: impl IntoIterator<Item = Transaction>) {
        let txs: Vec<_> = txs.into_iter().collect();
        if txs.is_empty() {
            return;
        }

        let mut inner = self.lock();
        for tx in txs.into_iter().rev() {
            inner.txs.push_front(tx);
        }
        NodeMetrics::set_pending_queue_len(inner.txs.len());
        drop(inner);

        self.notify.notify_one();
    }

    /// Put the transactions of a batch that was never broadcast back in the queue. Delayed
    /// messages are left out: they are read again from the delayed message log.
    pub(crate) fn requeue_batch(&self, batch: Batch) {
        self.requeue(batch.into_items().into_iter().filter_map(|item| match item {
            BatchItem::Transaction(tx) => Some(tx),
            BatchItem::Delayed(_) => None,
        }));
    }

    /// Take every pending transaction.
    pub(crate) fn drain(&self) -> Vec<Transaction> {
        let mut inner = self.lock();
        NodeMetrics::set_pending_queue_len(0);
        inner.txs.drain(..).collect()
    }

    /// The number of pending transactions.
    pub(crate) fn len(&self) -> usize {
        self.lock().txs.len()
    }

    /// Returns `true` if no transaction is pending.
    pub(crate) fn is_empty(&self) -> bool {
        self.lock().txs.is_empty()
    }

    /// Returns `true` if the queue reached its capacity.
    pub(crate) fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Move transactions from the queue into `builder` until either runs out of room.
    ///
    /// Returns `true` if the builder is full.
    pub(crate) fn fill(&self, builder: &mut BatchBuilder) -> bool {
        let mut inner = self.lock();

        while let Some(tx) = inner.txs.pop_front() {
            match builder.push(BatchItem::Transaction(tx)) {
                Ok(()) => {}
                Err(PushError::Full(item)) => {
                    if let BatchItem::Transaction(tx) = item {
                        inner.txs.push_front(tx);
                    }
                    NodeMetrics::set_pending_queue_len(inner.txs.len());
                    return true;
                }
                Err(PushError::OutOfOrder { .. }) => {
                    unreachable!("only delayed messages are checked for ordering")
                }
            }
        }

        NodeMetrics::set_pending_queue_len(0);
        builder.is_full()
    }

    /// Fill `builder` with pending transactions for at most `max_wait`, returning early once
    /// it is full.
    ///
    /// Returns `false` if `cancel` fired first. The builder content is left to the caller.
    pub(crate) async fn accumulate(
        &self,
        builder: &mut BatchBuilder,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        let deadline = Instant::now() + max_wait;

        loop {
            if self.fill(builder) {
                return true;
            }

            tokio::select! {
                biased;

                () = cancel.cancelled() => return false,
                () = sleep_until(deadline) => return true,
                () = self.notify.notified() => {}
            }
        }
    }
}
