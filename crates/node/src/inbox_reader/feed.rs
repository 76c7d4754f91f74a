use std::collections::BTreeMap;

use alloy_primitives::B256;
use keel_chainio::rollup::sequencer_inbox::ConfirmedBatch;
use keel_clients::feed::FeedMessage;

/// The outcome of reconciling a confirmed batch with the buffered feed hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Hints up to the confirmed count were dropped.
    Confirmed {
        /// How many hints were dropped.
        dropped: usize,
    },
    /// The feed announced a different message than the one confirmed on L1. Every hint was
    /// dropped.
    Divergent {
        /// The sequence number of the disagreeing message.
        sequence: u64,
        /// The hash confirmed on L1.
        confirmed: B256,
        /// The hash announced by the feed.
        announced: B256,
    },
}

/// Buffers messages announced by the broadcast feed until L1 confirms them.
///
/// Hints are never treated as final: they only serve to detect that the feed diverged from
/// what the sequencer ended up posting.
#[derive(Debug, Default)]
pub struct FeedReconciler {
    hints: BTreeMap<u64, B256>,
    confirmed: u64,
}

impl FeedReconciler {
    /// Creates an empty reconciler.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of unconfirmed hints.
    pub fn len(&self) -> usize {
        self.hints.len()
    }

    /// Returns `true` if no hint is buffered.
    pub fn is_empty(&self) -> bool {
        self.hints.is_empty()
    }

    /// Buffer a feed message. Returns `false` if it is already confirmed and was ignored.
    pub fn observe(&mut self, msg: FeedMessage) -> bool {
        if msg.sequence_number < self.confirmed {
            return false;
        }
        self.hints.insert(msg.sequence_number, msg.message_hash);
        true
    }

    /// Reconcile the hints with a batch confirmed on L1.
    pub fn confirm(&mut self, batch: &ConfirmedBatch) -> Reconciliation {
        self.confirmed = self.confirmed.max(batch.new_message_count);

        let last = batch.new_message_count.saturating_sub(1);
        if let Some(announced) = self.hints.get(&last).copied() {
            if batch.new_message_count > 0 && announced != batch.last_message_hash {
                self.hints.clear();
                return Reconciliation::Divergent {
                    sequence: last,
                    confirmed: batch.last_message_hash,
                    announced,
                };
            }
        }

        let before = self.hints.len();
        self.hints = self.hints.split_off(&self.confirmed);
        Reconciliation::Confirmed { dropped: before - self.hints.len() }
    }
}
