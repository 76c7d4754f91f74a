use std::{sync::Arc, time::Duration};

use keel_clients::engine::{CoreError, ExecutionCore};
use keel_primitives::{
    Batch, BatchBuilder, BatchItem, BatchSettings, SyncState, Transaction, batch::PushError,
    summary::Summary,
};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AcceptError, BatchPoster, PendingQueue, SubmissionError};
use crate::{
    context::NodeContext, health::HealthError, inbox_reader::DelayedMessageLog,
    metrics::NodeMetrics,
};

/// Orders delayed messages and direct transactions, delivers them to the execution engine and
/// posts them through the sequencer inbox.
///
/// Delayed messages are always included in index order, without gaps: a batch is delivered
/// to the engine before it is posted, and the next batch starts right after the last delayed
/// message delivered.
#[derive(Debug)]
pub struct Sequencer {
    queue: Arc<PendingQueue>,
    poster: BatchPoster,
    core: Arc<dyn ExecutionCore>,
    delayed: DelayedMessageLog,
    sync: Arc<SyncState>,
    settings: BatchSettings,
    max_batch_time: Duration,
    delayed_confirmations: u64,
    retry_delay: Duration,
    /// Held by whichever of the sequencing loop or a delayed message drain is running.
    state: Mutex<SequencerState>,
}

#[derive(Debug)]
struct SequencerState {
    /// The index of the next delayed message to sequence.
    next_delayed: u64,
    /// A batch delivered to the engine whose broadcast was cancelled. It is posted before
    /// anything else.
    unposted: Option<Batch>,
}

impl Sequencer {
    /// Creates a new sequencer, resuming after the delayed messages the engine already
    /// sequenced or the batches confirmed on L1 already read.
    pub(crate) async fn new(
        ctx: &NodeContext,
        poster: BatchPoster,
        queue: Arc<PendingQueue>,
    ) -> Result<Self, CoreError> {
        let status = ctx.core.status().await?;
        let next_delayed = status.delayed_sequenced.max(ctx.sync.delayed_confirmed());
        ctx.sync.update_delayed_sequenced(next_delayed);
        ctx.delayed.prune(next_delayed);
        debug!(status = %status.summary(), next_delayed, "Sequencer resuming from engine status");

        Ok(Self {
            queue,
            poster,
            core: Arc::clone(&ctx.core),
            delayed: ctx.delayed.clone(),
            sync: Arc::clone(&ctx.sync),
            settings: ctx.cfg.batch_settings(),
            max_batch_time: ctx.cfg.batcher.max_batch_time(),
            delayed_confirmations: ctx.cfg.batcher.delayed_confirmations,
            retry_delay: ctx.cfg.batcher.retry_delay(),
            state: Mutex::new(SequencerState { next_delayed, unposted: None }),
        })
    }

    /// The queue of accepted transactions.
    pub(crate) const fn queue(&self) -> &Arc<PendingQueue> {
        &self.queue
    }

    /// Validate and enqueue a transaction.
    pub fn accept(&self, tx: Transaction) -> Result<(), AcceptError> {
        self.queue.push(tx)
    }

    /// Unhealthy if the execution engine cannot be reached.
    pub async fn health_check(&self) -> Result<(), HealthError> {
        self.core
            .status()
            .await
            .map(|_| ())
            .map_err(|e| HealthError::Unhealthy(format!("execution engine unreachable: {e}")))
    }

    /// Catch up with the delayed messages sequenced while this sequencer was not leading,
    /// either by another replica feeding the engine or by batches confirmed on L1.
    ///
    /// Must run at the start of every term. A batch left unposted by an earlier term is
    /// dropped if its delayed range was overtaken, and its transactions are queued again.
    ///
    /// Returns the index of the next delayed message to sequence.
    pub async fn resume(&self) -> Result<u64, SubmissionError> {
        let status = self.core.status().await?;
        let confirmed = self.sync.delayed_confirmed();
        let mut state = self.state.lock().await;

        let overtaken = |batch: &mut Batch| {
            batch.delayed_start() < confirmed || batch.delayed_count() < status.delayed_sequenced
        };
        if let Some(batch) = state.unposted.take_if(overtaken) {
            warn!(
                delayed_start = batch.delayed_start(),
                delayed_count = batch.delayed_count(),
                engine = status.delayed_sequenced,
                confirmed,
                "Dropping unposted batch overtaken by another sequencer"
            );
            self.queue.requeue_batch(batch);
        }

        let position = status.delayed_sequenced.max(confirmed);
        if position > state.next_delayed {
            info!(
                local = state.next_delayed,
                engine = status.delayed_sequenced,
                confirmed,
                "Delayed messages were sequenced elsewhere, skipping ahead"
            );
            state.next_delayed = position;
        }
        self.sync.update_delayed_sequenced(state.next_delayed);
        self.delayed.prune(state.next_delayed);

        Ok(state.next_delayed)
    }

    /// Sequence every delayed message read so far, in index order, in as many batches as
    /// needed. Unless `force_all` is set, only messages with enough L1 confirmations are
    /// included.
    ///
    /// Returns the number of delayed messages sequenced.
    pub async fn sequence_delayed_messages(
        &self,
        cancel: &CancellationToken,
        force_all: bool,
    ) -> Result<u64, SubmissionError> {
        let mut state = self.state.lock().await;
        if let Some(batch) = state.unposted.take() {
            self.post(&mut state, batch, cancel).await?;
        }

        let start = state.next_delayed;
        loop {
            let mut builder = BatchBuilder::new(self.settings, state.next_delayed);
            self.push_ready_delayed(&mut builder, force_all);
            if builder.is_empty() {
                break;
            }
            self.process(&mut state, builder.take(), cancel).await?;
        }

        let sequenced = state.next_delayed - start;
        info!(sequenced, next_delayed = state.next_delayed, force_all, "✅ Delayed messages sequenced");
        Ok(sequenced)
    }

    /// Run the sequencing loop until cancellation, or until the submission gate closes.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SubmissionError> {
        let mut state = self.state.lock().await;
        info!(next_delayed = state.next_delayed, "🤠 Starting sequencer loop");

        if let Some(batch) = state.unposted.take() {
            info!(items = batch.len(), "Posting batch delivered before the last interruption");
            let result = self.post(&mut state, batch, &cancel).await;
            if let Some(result) = self.settle(result, &cancel).await {
                return result;
            }
        }

        loop {
            let mut builder = BatchBuilder::new(self.settings, state.next_delayed);
            self.push_ready_delayed(&mut builder, false);

            if !self.queue.accumulate(&mut builder, self.max_batch_time, &cancel).await {
                self.queue.requeue_batch(builder.take());
                return Ok(());
            }
            // More delayed messages may have been confirmed while waiting.
            self.push_ready_delayed(&mut builder, false);

            let result = self.process(&mut state, builder.take(), &cancel).await;
            if let Some(result) = self.settle(result, &cancel).await {
                return result;
            }
        }
    }

    /// Decide whether the loop stops after a batch. Other errors are retried after a delay.
    async fn settle(
        &self,
        result: Result<(), SubmissionError>,
        cancel: &CancellationToken,
    ) -> Option<Result<(), SubmissionError>> {
        match result {
            Ok(()) => None,
            Err(SubmissionError::Cancelled) => Some(Ok(())),
            Err(SubmissionError::Unconfirmed(hash)) => {
                warn!(%hash, "Stopped with a batch still unconfirmed, it may land later");
                Some(Ok(()))
            }
            Err(e) if e.is_fatal() => Some(Err(e)),
            Err(e) => {
                warn!(error = %e, "Failed to sequence batch, retrying in {:?}", self.retry_delay);
                tokio::select! {
                    () = cancel.cancelled() => {}
                    () = tokio::time::sleep(self.retry_delay) => {}
                }
                None
            }
        }
    }

    /// Add the delayed messages that can be sequenced now to `builder`, in index order.
    fn push_ready_delayed(&self, builder: &mut BatchBuilder, force_all: bool) {
        let l1_head = self.sync.l1_head();
        let room = self.settings.max_items.saturating_sub(builder.len());

        for msg in self.delayed.range(builder.next_delayed(), room) {
            if !force_all && msg.confirmations(l1_head) < self.delayed_confirmations {
                break;
            }
            match builder.push(BatchItem::Delayed(msg)) {
                Ok(()) => {}
                Err(PushError::Full(_)) => break,
                Err(PushError::OutOfOrder { expected, got }) => {
                    warn!(expected, got, "Delayed message log does not start at the next index");
                    break;
                }
            }
        }
    }

    /// Deliver a batch to the engine and post it.
    ///
    /// The submission gate is checked before delivery: a batch that could not be posted is
    /// never delivered, and its transactions go back to the queue.
    async fn process(
        &self,
        state: &mut MutexGuard<'_, SequencerState>,
        batch: Batch,
        cancel: &CancellationToken,
    ) -> Result<(), SubmissionError> {
        if batch.is_empty() {
            return Ok(());
        }
        if cancel.is_cancelled() || !self.poster.can_submit() {
            self.queue.requeue_batch(batch);
            return Err(SubmissionError::Cancelled);
        }

        let delivery = match self.core.deliver(batch.items()).await {
            Ok(delivery) => delivery,
            Err(e) => {
                self.queue.requeue_batch(batch);
                self.resync(state).await;
                return Err(e.into());
            }
        };

        let failed = delivery.results.iter().filter(|r| !r.success).count();
        debug!(
            content_hash = %delivery.content_hash,
            items = batch.len(),
            failed,
            "Batch delivered to the execution engine"
        );

        state.next_delayed = batch.delayed_count();
        self.sync.update_delayed_sequenced(batch.delayed_count());
        self.delayed.prune(batch.delayed_count());
        NodeMetrics::increment_delayed_messages_sequenced(batch.delayed_len());
        NodeMetrics::increment_transactions_sequenced(batch.transactions().count());

        self.post(state, batch, cancel).await
    }

    /// Post a delivered batch. A batch whose broadcast was cancelled is kept for later.
    async fn post(
        &self,
        state: &mut MutexGuard<'_, SequencerState>,
        batch: Batch,
        cancel: &CancellationToken,
    ) -> Result<(), SubmissionError> {
        match self.poster.post(&batch, cancel).await {
            Ok(_) => Ok(()),
            Err(SubmissionError::Cancelled) => {
                state.unposted = Some(batch);
                Err(SubmissionError::Cancelled)
            }
            Err(e) => Err(e),
        }
    }

    /// Re-read the delayed message position from the engine after a failed delivery, in case
    /// it was applied anyway.
    async fn resync(&self, state: &mut MutexGuard<'_, SequencerState>) {
        match self.core.status().await {
            Ok(status) if status.delayed_sequenced > state.next_delayed => {
                warn!(
                    local = state.next_delayed,
                    engine = status.delayed_sequenced,
                    "Engine sequenced delayed messages beyond the local position"
                );
                state.next_delayed = status.delayed_sequenced;
                self.sync.update_delayed_sequenced(status.delayed_sequenced);
                self.delayed.prune(status.delayed_sequenced);
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Failed to read engine status"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        batcher::AlwaysOpen,
        testing::{MockCore, MockSubmitter, delayed_message, test_context, tx},
    };

    async fn sequencer(
        core: &MockCore,
        submitter: &MockSubmitter,
        max_items: &str,
    ) -> (Sequencer, NodeContext) {
        let args = [
            "--batcher.max-batch-time-ms",
            "1000",
            "--batcher.max-batch-items",
            max_items,
            "--sequencer.delayed-confirmations",
            "10",
        ];
        let (ctx, _errors) = test_context(&args, core.clone());
        let poster = BatchPoster::new(
            Arc::new(submitter.clone()),
            Arc::new(AlwaysOpen),
            ctx.cfg.poster_settings(),
        );
        let queue = Arc::new(PendingQueue::new(100, 1024));
        let sequencer = Sequencer::new(&ctx, poster, queue).await.unwrap();
        (sequencer, ctx)
    }

    fn delayed_indexes(items: &[BatchItem]) -> Vec<u64> {
        items
            .iter()
            .filter_map(|item| match item {
                BatchItem::Delayed(msg) => Some(msg.index),
                BatchItem::Transaction(_) => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn only_confirmed_delayed_messages_are_drained_unless_forced() {
        let core = MockCore::new();
        let submitter = MockSubmitter::new();
        let (sequencer, ctx) = sequencer(&core, &submitter, "10").await;

        ctx.delayed.append(delayed_message(0, 10));
        ctx.delayed.append(delayed_message(1, 95));
        ctx.sync.update_l1_head(100);

        let cancel = CancellationToken::new();
        assert_eq!(sequencer.sequence_delayed_messages(&cancel, false).await.unwrap(), 1);
        assert_eq!(sequencer.sequence_delayed_messages(&cancel, true).await.unwrap(), 1);
        assert_eq!(sequencer.sequence_delayed_messages(&cancel, true).await.unwrap(), 0);

        let delivered: Vec<_> = core.deliveries().iter().map(|d| delayed_indexes(d)).collect();
        assert_eq!(delivered, vec![vec![0], vec![1]]);
        assert_eq!(ctx.sync.delayed_sequenced(), 2);
        assert!(ctx.delayed.is_empty());
        assert_eq!(submitter.broadcasts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn large_backlogs_are_drained_in_bounded_batches() {
        let core = MockCore::new();
        let submitter = MockSubmitter::new();
        let (sequencer, ctx) = sequencer(&core, &submitter, "2").await;

        for index in 0..5 {
            ctx.delayed.append(delayed_message(index, 1));
        }

        let cancel = CancellationToken::new();
        assert_eq!(sequencer.sequence_delayed_messages(&cancel, true).await.unwrap(), 5);

        let batches: Vec<_> = submitter.broadcasts().iter().map(|b| b.batch.delayed_len()).collect();
        assert_eq!(batches, vec![2, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_order_is_preserved_with_interleaved_transactions() {
        let core = MockCore::new();
        let submitter = MockSubmitter::new();
        let (sequencer, ctx) = sequencer(&core, &submitter, "3").await;
        let sequencer = Arc::new(sequencer);
        ctx.sync.update_l1_head(1_000);

        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let sequencer = Arc::clone(&sequencer);
            let cancel = cancel.clone();
            async move { sequencer.run(cancel).await }
        });

        for i in 0..6 {
            ctx.delayed.append(delayed_message(i, 1));
            sequencer.accept(tx(1, i + 1)).unwrap();
            tokio::time::sleep(Duration::from_millis(700)).await;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        run.await.unwrap().unwrap();

        let delivered: Vec<u64> =
            core.deliveries().iter().flat_map(|items| delayed_indexes(items)).collect();
        assert_eq!(delivered, (0..6).collect::<Vec<_>>());

        let sequences: Vec<u64> = core
            .deliveries()
            .iter()
            .flatten()
            .filter_map(|item| match item {
                BatchItem::Transaction(tx) => Some(tx.sequence),
                BatchItem::Delayed(_) => None,
            })
            .collect();
        assert_eq!(sequences, (1..=6).collect::<Vec<_>>());
        assert_eq!(core.deliveries().len(), submitter.broadcasts().len());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_skips_delayed_messages_confirmed_on_l1() {
        let core = MockCore::new();
        let submitter = MockSubmitter::new();
        let (sequencer, ctx) = sequencer(&core, &submitter, "10").await;

        for index in 0..3 {
            ctx.delayed.append(delayed_message(index, 1));
        }
        ctx.sync.update_delayed_confirmed(2);

        assert_eq!(sequencer.resume().await.unwrap(), 2);
        assert_eq!(ctx.delayed.len(), 1);

        let cancel = CancellationToken::new();
        assert_eq!(sequencer.sequence_delayed_messages(&cancel, true).await.unwrap(), 1);
        let delivered: Vec<_> = core.deliveries().iter().map(|d| delayed_indexes(d)).collect();
        assert_eq!(delivered, vec![vec![2]]);
    }

    fn unposted_batch(sequencer: &Sequencer) -> Batch {
        let mut builder = BatchBuilder::new(sequencer.settings, 0);
        builder.push(BatchItem::Delayed(delayed_message(0, 1))).unwrap();
        builder.push(BatchItem::Transaction(tx(1, 1))).unwrap();
        builder.take()
    }

    #[tokio::test(start_paused = true)]
    async fn overtaken_unposted_batch_is_dropped_on_resume() {
        let core = MockCore::new();
        let submitter = MockSubmitter::new();
        let (sequencer, ctx) = sequencer(&core, &submitter, "10").await;

        {
            let mut state = sequencer.state.lock().await;
            state.unposted = Some(unposted_batch(&sequencer));
            state.next_delayed = 1;
        }
        // Another sequencer posted delayed messages 0 and 1 in the meantime.
        ctx.sync.update_delayed_confirmed(2);

        assert_eq!(sequencer.resume().await.unwrap(), 2);
        assert!(sequencer.state.lock().await.unposted.is_none());
        assert_eq!(sequencer.queue().len(), 1);

        let cancel = CancellationToken::new();
        assert_eq!(sequencer.sequence_delayed_messages(&cancel, true).await.unwrap(), 0);
        assert!(submitter.broadcasts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn own_unposted_batch_survives_resume() {
        let core = MockCore::new();
        let submitter = MockSubmitter::new();
        let (sequencer, _ctx) = sequencer(&core, &submitter, "10").await;

        {
            let mut state = sequencer.state.lock().await;
            state.unposted = Some(unposted_batch(&sequencer));
            state.next_delayed = 1;
        }
        core.set_delayed_sequenced(1);

        assert_eq!(sequencer.resume().await.unwrap(), 1);

        let cancel = CancellationToken::new();
        assert_eq!(sequencer.sequence_delayed_messages(&cancel, true).await.unwrap(), 0);
        assert_eq!(submitter.broadcasts().len(), 1);
        assert!(sequencer.queue().is_empty());
    }

    #[derive(Debug)]
    struct Closed;

    impl crate::batcher::SubmissionGate for Closed {
        fn is_open(&self) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_is_delivered_through_a_closed_gate() {
        let core = MockCore::new();
        let submitter = MockSubmitter::new();
        let (ctx, _errors) = test_context(&[], core.clone());
        let poster =
            BatchPoster::new(Arc::new(submitter.clone()), Arc::new(Closed), ctx.cfg.poster_settings());
        let queue = Arc::new(PendingQueue::new(100, 1024));
        let sequencer = Sequencer::new(&ctx, poster, Arc::clone(&queue)).await.unwrap();

        ctx.delayed.append(delayed_message(0, 1));
        sequencer.accept(tx(1, 1)).unwrap();

        let err = sequencer.sequence_delayed_messages(&CancellationToken::new(), true).await;
        assert!(matches!(err, Err(SubmissionError::Cancelled)));
        assert!(core.deliveries().is_empty());
        assert_eq!(ctx.delayed.len(), 1);
        assert_eq!(queue.len(), 1);
    }
}
