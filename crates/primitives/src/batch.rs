use alloy_primitives::{Bytes, U256};
use derive_more::derive::IsVariant;
use serde::{Deserialize, Serialize};

use crate::{delayed::DelayedMessage, summary::Summary, transaction::Transaction};

/// The settings of a [`Batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    /// The maximum number of items (transactions and delayed messages) in a batch.
    pub max_items: usize,
    /// The maximum size of the transaction payloads in a batch, in bytes.
    pub max_size: usize,
}

/// A single entry of a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq, IsVariant, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "camelCase")]
pub enum BatchItem {
    /// A message read from the delayed inbox.
    Delayed(DelayedMessage),
    /// A transaction submitted directly to the node.
    Transaction(Transaction),
}

impl BatchItem {
    /// The number of calldata bytes this item takes in the submitted batch. Delayed
    /// messages are referenced by count only and take no space.
    pub fn encoded_size(&self) -> usize {
        match self {
            Self::Delayed(_) => 0,
            Self::Transaction(tx) => tx.size(),
        }
    }
}

/// An ordered batch of transactions and delayed messages, immutable once built.
///
/// INVARIANT: delayed messages in `items` have contiguous, increasing indexes starting from
/// `delayed_start`, and `delayed_count` is the total number of delayed messages read once
/// the batch is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    items: Vec<BatchItem>,
    delayed_start: u64,
    delayed_count: u64,
    size: usize,
}

/// The calldata form of a [`Batch`], as expected by the inbox contracts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedBatch {
    /// The concatenated transaction payloads.
    pub transactions: Bytes,
    /// The length of each transaction payload in `transactions`.
    pub lengths: Vec<U256>,
    /// Pairs of `(transaction count, total delayed messages read)`, one per section. Each
    /// section is a run of transactions followed by a run of delayed messages.
    pub sections: Vec<U256>,
    /// Total delayed messages read after this batch.
    pub total_delayed_read: U256,
}

impl Batch {
    /// The items of the batch, in sequencing order.
    pub fn items(&self) -> &[BatchItem] {
        &self.items
    }

    /// Consumes the batch and returns its items.
    pub fn into_items(self) -> Vec<BatchItem> {
        self.items
    }

    /// Returns `true` if the batch has no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The number of items in the batch.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// The total delayed messages read after this batch is applied.
    pub const fn delayed_count(&self) -> u64 {
        self.delayed_count
    }

    /// The index of the first delayed message this batch may include.
    pub const fn delayed_start(&self) -> u64 {
        self.delayed_start
    }

    /// The number of delayed messages in this batch.
    pub const fn delayed_len(&self) -> u64 {
        self.delayed_count - self.delayed_start
    }

    /// The total size of the transaction payloads, in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Iterator over the direct transactions of the batch.
    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.items.iter().filter_map(|item| match item {
            BatchItem::Transaction(tx) => Some(tx),
            BatchItem::Delayed(_) => None,
        })
    }

    /// Encode the batch into its calldata form.
    pub fn encode(&self) -> EncodedBatch {
        let mut transactions = Vec::with_capacity(self.size);
        let mut lengths = Vec::new();
        let mut sections = Vec::new();

        let mut delayed_read = self.delayed_start;
        let mut section_txs = 0u64;
        let mut last_was_delayed = false;

        for item in &self.items {
            match item {
                BatchItem::Delayed(msg) => {
                    delayed_read = msg.index + 1;
                    last_was_delayed = true;
                }
                BatchItem::Transaction(tx) => {
                    if last_was_delayed {
                        sections.push(U256::from(section_txs));
                        sections.push(U256::from(delayed_read));
                        section_txs = 0;
                        last_was_delayed = false;
                    }
                    transactions.extend_from_slice(&tx.payload);
                    lengths.push(U256::from(tx.size()));
                    section_txs += 1;
                }
            }
        }

        sections.push(U256::from(section_txs));
        sections.push(U256::from(delayed_read));

        EncodedBatch {
            transactions: transactions.into(),
            lengths,
            sections,
            total_delayed_read: U256::from(self.delayed_count),
        }
    }
}

/// The kind byte of an L2 message carrying a batch of transactions.
pub const L2_MESSAGE_KIND_BATCH: u8 = 3;

impl Batch {
    /// Encode the direct transactions of the batch as a single L2 message, as posted by
    /// aggregators: the kind byte followed by every payload prefixed with its big-endian
    /// 8-byte length. Delayed messages are not part of L2 messages.
    pub fn encode_l2_message(&self) -> Bytes {
        let mut out = Vec::with_capacity(1 + self.size + 8 * self.items.len());
        out.push(L2_MESSAGE_KIND_BATCH);
        for tx in self.transactions() {
            out.extend_from_slice(&(tx.size() as u64).to_be_bytes());
            out.extend_from_slice(&tx.payload);
        }
        out.into()
    }
}

impl Summary for Batch {
    fn summary(&self) -> String {
        format!(
            "items={}, txs={}, delayed={}..{}, size={}b",
            self.items.len(),
            self.transactions().count(),
            self.delayed_start,
            self.delayed_count,
            self.size
        )
    }
}

/// The reason why an item could not be added to a [`BatchBuilder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    /// The batch is full. The rejected item is handed back to the caller.
    Full(BatchItem),
    /// The delayed message does not follow the last one included.
    OutOfOrder {
        /// The index the builder expected next.
        expected: u64,
        /// The index that was pushed.
        got: u64,
    },
}

/// Incrementally assembles a [`Batch`] within the configured [`BatchSettings`].
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    settings: BatchSettings,
    items: Vec<BatchItem>,
    delayed_start: u64,
    next_delayed: u64,
    size: usize,
}

impl BatchBuilder {
    /// Creates a new builder. `delayed_start` is the index of the next delayed message
    /// that may be sequenced.
    pub const fn new(settings: BatchSettings, delayed_start: u64) -> Self {
        Self { settings, items: Vec::new(), delayed_start, next_delayed: delayed_start, size: 0 }
    }

    /// Returns `true` if no item was added yet.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The number of items added so far.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if no further item can be added.
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.settings.max_items
    }

    /// The index of the next delayed message the builder accepts.
    pub const fn next_delayed(&self) -> u64 {
        self.next_delayed
    }

    /// Add an item to the batch.
    ///
    /// An oversized item is always accepted into an empty batch so that it can never stall
    /// the pipeline; callers reject oversized transactions before they are queued.
    pub fn push(&mut self, item: BatchItem) -> Result<(), PushError> {
        if let BatchItem::Delayed(msg) = &item {
            if msg.index != self.next_delayed {
                return Err(PushError::OutOfOrder { expected: self.next_delayed, got: msg.index });
            }
        }

        let new_size = self.size + item.encoded_size();
        if self.is_full() || (!self.items.is_empty() && new_size > self.settings.max_size) {
            return Err(PushError::Full(item));
        }

        if let BatchItem::Delayed(msg) = &item {
            self.next_delayed = msg.index + 1;
        }
        self.size = new_size;
        self.items.push(item);
        Ok(())
    }

    /// Finish the batch. The builder can be reused for the next batch, starting right after the
    /// last delayed message included.
    pub fn take(&mut self) -> Batch {
        let batch = Batch {
            items: std::mem::take(&mut self.items),
            delayed_start: self.delayed_start,
            delayed_count: self.next_delayed,
            size: self.size,
        };
        self.delayed_start = self.next_delayed;
        self.size = 0;
        batch
    }
}
