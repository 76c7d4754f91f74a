use std::sync::Arc;

use alloy::{contract::Error as ContractError, transports::TransportError};
use alloy_sol_types::Error as SolError;
use keel_clients::{engine::CoreError, feed::FeedMessage};
use keel_primitives::{SyncState, summary::Summary};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{NodeError, context::NodeContext, metrics::NodeMetrics};

mod log;
pub use log::{AppendOutcome, DelayedMessageLog};

mod source;
pub use source::{ContractL1Source, L1Source};

mod feed;
pub use feed::{FeedReconciler, Reconciliation};

/// Errors that can occur while reading the inbox. None of them stops the reader.
#[derive(Debug, Error)]
pub enum InboxReaderError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Contract error: {0}")]
    Contract(#[from] ContractError),
    #[error("Failed to decode log: {0}")]
    Decode(#[from] SolError),
    #[error("Execution engine error: {0}")]
    Core(#[from] CoreError),
    #[error("Delayed message gap: expected index {expected}, got {got}")]
    Gap { expected: u64, got: u64 },
}

/// Follows the rollup contracts on L1.
///
/// The reader scans confirmed L1 blocks in bounded ranges, appends delayed messages to the
/// shared [`DelayedMessageLog`] and records the sequencer batches confirmed on L1. The scan
/// cursor only moves forward once a whole range was read consistently.
#[derive(Debug)]
pub struct InboxReader {
    source: Arc<dyn L1Source>,
    log: DelayedMessageLog,
    sync: Arc<SyncState>,
    /// The next L1 block to scan.
    next_block: u64,
    confirmations: u64,
    max_log_range: u64,
    poll_interval: std::time::Duration,
    feed: Option<ReceiverStream<FeedMessage>>,
    reconciler: FeedReconciler,
}

impl InboxReader {
    /// Creates a new reader scanning from the configured deployment block.
    pub(crate) fn new(ctx: &NodeContext, source: Arc<dyn L1Source>) -> Self {
        Self {
            source,
            log: ctx.delayed.clone(),
            sync: Arc::clone(&ctx.sync),
            next_block: ctx.cfg.rollup.from_block,
            confirmations: ctx.cfg.l1.confirmations,
            max_log_range: ctx.cfg.l1.max_log_range.max(1),
            poll_interval: ctx.cfg.l1.poll_interval(),
            feed: None,
            reconciler: FeedReconciler::new(),
        }
    }

    /// Follow the given broadcast feed while running.
    pub(crate) fn with_feed(mut self, feed: ReceiverStream<FeedMessage>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// The next L1 block the reader will scan.
    pub const fn next_block(&self) -> u64 {
        self.next_block
    }

    /// Connect to L1 and catch up with the confirmed head.
    ///
    /// The delayed message log is rebased on the messages the engine already sequenced, so
    /// that older messages found on L1 are recognized as duplicates.
    pub(crate) async fn start(&mut self, ctx: &NodeContext) -> Result<(), InboxReaderError> {
        let status = ctx.core.status().await?;
        debug!(status = %status.summary(), "Execution engine status");

        if self.log.is_empty() {
            self.log.rebase(status.delayed_sequenced);
        }
        self.sync.update_delayed_sequenced(status.delayed_sequenced);
        self.sync.update_messages_executed(status.message_count);

        while !self.poll_once().await? {}

        info!(
            l1_head = self.sync.l1_head(),
            next_block = self.next_block,
            delayed = self.log.next_index(),
            "✅ Inbox reader caught up with L1"
        );
        Ok(())
    }

    /// Scan the next range of confirmed L1 blocks.
    ///
    /// Returns `true` if the reader reached the confirmed head.
    pub async fn poll_once(&mut self) -> Result<bool, InboxReaderError> {
        let head = self.source.head().await?;
        self.sync.update_l1_head(head);
        NodeMetrics::set_l1_head(head);

        // Only read blocks deep enough that their logs are not rolled back.
        let safe_head = head.saturating_sub(self.confirmations);
        if self.next_block > safe_head {
            return Ok(true);
        }

        let from = self.next_block;
        let to = safe_head.min(from.saturating_add(self.max_log_range - 1));
        trace!(from, to, "Scanning L1 blocks");

        let (delayed, batches) = tokio::try_join!(
            self.source.delayed_messages(from, to),
            self.source.confirmed_batches(from, to)
        )?;

        let mut appended = 0;
        for msg in delayed {
            let index = msg.index;
            match self.log.append(msg) {
                AppendOutcome::Appended => appended += 1,
                AppendOutcome::Duplicate => trace!(index, "Dropping known delayed message"),
                AppendOutcome::Gap { expected } => {
                    // The range is scanned again on the next poll.
                    self.sync.update_delayed_read(self.log.next_index());
                    return Err(InboxReaderError::Gap { expected, got: index });
                }
            }
        }

        for batch in &batches {
            self.sync.update_inbox_messages_read(batch.new_message_count);
            self.sync.update_delayed_confirmed(batch.total_delayed_read);
            self.reconcile(batch);
        }

        self.sync.update_delayed_read(self.log.next_index());
        self.sync.update_l1_processed_block(to);
        self.next_block = to + 1;

        NodeMetrics::set_l1_processed_block(to);
        NodeMetrics::increment_delayed_messages_read(appended);
        if appended > 0 || !batches.is_empty() {
            debug!(from, to, appended, batches = batches.len(), "Scanned L1 blocks");
        }

        Ok(to >= safe_head)
    }

    fn reconcile(&mut self, batch: &keel_chainio::rollup::sequencer_inbox::ConfirmedBatch) {
        match self.reconciler.confirm(batch) {
            Reconciliation::Confirmed { dropped } => {
                trace!(dropped, batch = %batch.summary(), "Batch confirmed on L1");
            }
            Reconciliation::Divergent { sequence, confirmed, announced } => {
                error!(sequence, %confirmed, %announced, "Broadcast feed diverged from L1");
                NodeMetrics::increment_feed_divergences();
            }
        }
    }

    fn observe_feed(&mut self, msg: FeedMessage) {
        self.sync.update_feed_sequence(msg.sequence_number);
        NodeMetrics::set_feed_sequence(msg.sequence_number);
        if !self.reconciler.observe(msg) {
            trace!(sequence = msg.sequence_number, "Ignoring confirmed feed message");
        }
    }

    /// Run the reader loop until cancellation. Read errors are logged and retried on the next
    /// tick; they never stop the reader.
    pub(crate) async fn run(mut self, cancel: CancellationToken) -> Result<(), NodeError> {
        info!(poll_interval = ?self.poll_interval, "🤠 Starting inbox reader loop");

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    debug!("Inbox reader stopped");
                    return Ok(())
                }

                Some(msg) = next_feed_message(&mut self.feed) => self.observe_feed(msg),

                _ = interval.tick() => {
                    while !cancel.is_cancelled() {
                        match self.poll_once().await {
                            Ok(true) => break,
                            Ok(false) => {}
                            Err(e) => {
                                warn!(error = %e, next_block = self.next_block, "Failed to read inbox");
                                NodeMetrics::increment_inbox_reader_errors(e.to_string());
                                break
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Waits for the next message of the feed, if any. Pending forever without a feed.
async fn next_feed_message(feed: &mut Option<ReceiverStream<FeedMessage>>) -> Option<FeedMessage> {
    match feed {
        Some(stream) => {
            let msg = stream.next().await;
            if msg.is_none() {
                warn!("Broadcast feed closed");
                *feed = None;
            }
            msg
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use keel_chainio::rollup::sequencer_inbox::ConfirmedBatch;

    use super::*;
    use crate::testing::{MockCore, MockL1Source, delayed_message, test_context};

    fn confirmed(new_message_count: u64, block: u64) -> ConfirmedBatch {
        ConfirmedBatch {
            first_message: 0,
            new_message_count,
            total_delayed_read: 0,
            last_message_hash: Default::default(),
            l1_block_number: block,
        }
    }

    #[tokio::test]
    async fn start_catches_up_in_bounded_ranges() {
        let source = MockL1Source::new(250);
        for i in 0..3 {
            source.add_delayed(delayed_message(i, 10 + i * 100));
        }
        source.add_batch(confirmed(7, 120));

        let (ctx, _errors) = test_context(&["--l1.max-log-range", "100"], MockCore::new());
        let mut reader = InboxReader::new(&ctx, Arc::new(source.clone()));
        reader.start(&ctx).await.unwrap();

        assert_eq!(reader.next_block(), 251);
        assert_eq!(ctx.delayed.next_index(), 3);
        assert_eq!(ctx.sync.delayed_read(), 3);
        assert_eq!(ctx.sync.inbox_messages_read(), 7);
        assert_eq!(ctx.sync.l1_processed_block(), 250);
        // [0, 99], [100, 199], [200, 250]
        assert_eq!(source.scans(), 3);
    }

    #[tokio::test]
    async fn confirmed_batches_record_the_delayed_messages_they_read() {
        let source = MockL1Source::new(50);
        source.add_batch(ConfirmedBatch { total_delayed_read: 4, ..confirmed(3, 10) });
        source.add_batch(ConfirmedBatch { total_delayed_read: 6, ..confirmed(5, 20) });

        let (ctx, _errors) = test_context(&[], MockCore::new());
        let mut reader = InboxReader::new(&ctx, Arc::new(source));
        reader.start(&ctx).await.unwrap();

        assert_eq!(ctx.sync.delayed_confirmed(), 6);
        assert_eq!(ctx.sync.inbox_messages_read(), 5);
    }

    #[tokio::test]
    async fn unconfirmed_blocks_are_not_read() {
        let source = MockL1Source::new(100);
        source.add_delayed(delayed_message(0, 95));

        let (ctx, _errors) = test_context(&["--l1.confirmations", "10"], MockCore::new());
        let mut reader = InboxReader::new(&ctx, Arc::new(source.clone()));
        reader.start(&ctx).await.unwrap();

        assert_eq!(ctx.sync.l1_processed_block(), 90);
        assert!(ctx.delayed.is_empty());

        source.set_head(105);
        assert!(reader.poll_once().await.unwrap());
        assert_eq!(ctx.delayed.next_index(), 1);
    }

    #[tokio::test]
    async fn gap_keeps_the_cursor_in_place() {
        let source = MockL1Source::new(10);
        source.add_delayed(delayed_message(0, 2));
        source.add_delayed(delayed_message(2, 3));

        let (ctx, _errors) = test_context(&[], MockCore::new());
        let mut reader = InboxReader::new(&ctx, Arc::new(source.clone()));

        let err = reader.poll_once().await.unwrap_err();
        assert!(matches!(err, InboxReaderError::Gap { expected: 1, got: 2 }));
        assert_eq!(reader.next_block(), 0);
        assert_eq!(ctx.delayed.next_index(), 1);

        // Once the missing message shows up, the rescan appends the rest without duplicates.
        source.add_delayed(delayed_message(1, 2));
        assert!(reader.poll_once().await.unwrap());
        assert_eq!(ctx.delayed.next_index(), 3);
        assert_eq!(ctx.delayed.len(), 3);
    }

    #[tokio::test]
    async fn messages_already_sequenced_are_skipped() {
        let source = MockL1Source::new(10);
        for i in 0..4 {
            source.add_delayed(delayed_message(i, 1));
        }

        let core = MockCore::new();
        core.set_delayed_sequenced(2);
        let (ctx, _errors) = test_context(&[], core);
        let mut reader = InboxReader::new(&ctx, Arc::new(source));
        reader.start(&ctx).await.unwrap();

        let indexes: Vec<_> = ctx.delayed.range(0, 10).iter().map(|m| m.index).collect();
        assert_eq!(indexes, vec![2, 3]);
        assert_eq!(ctx.sync.delayed_backlog(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn read_errors_do_not_stop_the_loop() {
        let source = MockL1Source::new(10);
        source.fail_next(2);

        let (ctx, _errors) = test_context(&["--l1.poll-interval-ms", "1000"], MockCore::new());
        let reader = InboxReader::new(&ctx, Arc::new(source.clone()));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(reader.run(cancel.clone()));

        source.add_delayed(delayed_message(0, 5));
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(ctx.delayed.next_index(), 1);

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }
}
