use std::sync::atomic::{AtomicU64, Ordering};

use crate::summary::Summary;

/// Progress counters of the sequencing pipeline.
///
/// Every counter is owned by exactly one stage, which only ever moves it forward. Other
/// components (mainly the health monitor) read a consistent-enough view through
/// [`SyncState::snapshot`].
#[derive(Debug, Default)]
pub struct SyncState {
    l1_head: AtomicU64,
    l1_processed_block: AtomicU64,
    delayed_read: AtomicU64,
    delayed_sequenced: AtomicU64,
    delayed_confirmed: AtomicU64,
    inbox_messages_read: AtomicU64,
    messages_executed: AtomicU64,
    logs_processed: AtomicU64,
    feed_sequence: AtomicU64,
    l2_block: AtomicU64,
}

/// A point-in-time copy of the [`SyncState`] counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSnapshot {
    /// The latest L1 block number observed.
    pub l1_head: u64,
    /// The last L1 block fully scanned by the inbox reader.
    pub l1_processed_block: u64,
    /// The number of delayed messages read from L1.
    pub delayed_read: u64,
    /// The number of delayed messages sequenced into the execution engine.
    pub delayed_sequenced: u64,
    /// The number of delayed messages read by the batches confirmed on L1.
    pub delayed_confirmed: u64,
    /// The number of sequencer messages confirmed on L1.
    pub inbox_messages_read: u64,
    /// The number of messages executed by the engine.
    pub messages_executed: u64,
    /// The number of messages whose logs were processed.
    pub logs_processed: u64,
    /// The latest sequence number seen on the broadcast feed.
    pub feed_sequence: u64,
    /// The latest L2 block number of the execution engine.
    pub l2_block: u64,
}

macro_rules! counter {
    ($getter:ident, $setter:ident, $field:ident, $doc:literal) => {
        #[doc = concat!("Returns ", $doc, ".")]
        pub fn $getter(&self) -> u64 {
            self.$field.load(Ordering::Acquire)
        }

        #[doc = concat!("Moves ", $doc, " forward. Lower values are ignored.")]
        pub fn $setter(&self, value: u64) {
            self.$field.fetch_max(value, Ordering::AcqRel);
        }
    };
}

impl SyncState {
    /// Creates a new [`SyncState`] with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    counter!(l1_head, update_l1_head, l1_head, "the latest L1 block number observed");
    counter!(
        l1_processed_block,
        update_l1_processed_block,
        l1_processed_block,
        "the last L1 block scanned"
    );
    counter!(delayed_read, update_delayed_read, delayed_read, "the delayed messages read");
    counter!(
        delayed_sequenced,
        update_delayed_sequenced,
        delayed_sequenced,
        "the delayed messages sequenced"
    );
    counter!(
        delayed_confirmed,
        update_delayed_confirmed,
        delayed_confirmed,
        "the delayed messages read by the batches confirmed on L1"
    );
    counter!(
        inbox_messages_read,
        update_inbox_messages_read,
        inbox_messages_read,
        "the sequencer messages confirmed on L1"
    );
    counter!(
        messages_executed,
        update_messages_executed,
        messages_executed,
        "the messages executed by the engine"
    );
    counter!(logs_processed, update_logs_processed, logs_processed, "the messages with logs processed");
    counter!(feed_sequence, update_feed_sequence, feed_sequence, "the latest feed sequence number");
    counter!(l2_block, update_l2_block, l2_block, "the latest L2 block number");

    /// The number of delayed messages read from L1 but not sequenced yet.
    pub fn delayed_backlog(&self) -> u64 {
        self.delayed_read().saturating_sub(self.delayed_sequenced())
    }

    /// Take a snapshot of all the counters.
    pub fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            l1_head: self.l1_head(),
            l1_processed_block: self.l1_processed_block(),
            delayed_read: self.delayed_read(),
            delayed_sequenced: self.delayed_sequenced(),
            delayed_confirmed: self.delayed_confirmed(),
            inbox_messages_read: self.inbox_messages_read(),
            messages_executed: self.messages_executed(),
            logs_processed: self.logs_processed(),
            feed_sequence: self.feed_sequence(),
            l2_block: self.l2_block(),
        }
    }
}

impl Summary for SyncSnapshot {
    fn summary(&self) -> String {
        format!(
            "l1_head={}, l1_processed={}, delayed_read={}, delayed_sequenced={}, delayed_confirmed={}, inbox_read={}, executed={}, logs_processed={}, feed_seq={}, l2_block={}",
            self.l1_head,
            self.l1_processed_block,
            self.delayed_read,
            self.delayed_sequenced,
            self.delayed_confirmed,
            self.inbox_messages_read,
            self.messages_executed,
            self.logs_processed,
            self.feed_sequence,
            self.l2_block,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn counters_never_move_backwards() {
        let state = SyncState::new();
        state.update_delayed_read(10);
        state.update_delayed_read(4);
        assert_eq!(state.delayed_read(), 10);

        state.update_delayed_sequenced(7);
        assert_eq!(state.delayed_backlog(), 3);
    }

    #[tokio::test]
    async fn concurrent_updates_keep_the_maximum() {
        let state = Arc::new(SyncState::new());

        let mut handles = Vec::new();
        for i in 0..16u64 {
            let state = Arc::clone(&state);
            handles.push(tokio::spawn(async move { state.update_l1_head(i * 3) }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(state.snapshot().l1_head, 45);
    }
}
