use std::{sync::Arc, time::Duration};

use keel_primitives::{Batch, BatchBuilder, BatchSettings, Transaction};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AcceptError, BatchPoster, Confirmed, PendingQueue, SubmissionError};
use crate::{NodeError, context::NodeContext, health::HealthError};

/// Batches transactions and submits them through the public inbox.
///
/// The stateless flavour posts every batch in its own task, letting the provider pick
/// nonces. The stateful one keeps a single batch in flight and confirms it before
/// assembling the next.
#[derive(Debug)]
pub struct Aggregator {
    ctx: NodeContext,
    queue: Arc<PendingQueue>,
    poster: BatchPoster,
    settings: BatchSettings,
    max_batch_time: Duration,
}

impl Aggregator {
    /// Creates a new instance of [`Aggregator`].
    pub(crate) fn new(ctx: &NodeContext, poster: BatchPoster) -> Self {
        let queue = PendingQueue::new(ctx.cfg.batcher.queue_capacity, ctx.cfg.batcher.max_tx_size);

        Self {
            queue: Arc::new(queue),
            poster,
            settings: ctx.cfg.batch_settings(),
            max_batch_time: ctx.cfg.batcher.max_batch_time(),
            ctx: ctx.clone(),
        }
    }

    /// Validate and enqueue a transaction.
    pub fn accept(&self, tx: Transaction) -> Result<(), AcceptError> {
        self.queue.push(tx)
    }

    /// Unhealthy while the pending queue is full.
    pub fn health_check(&self) -> Result<(), HealthError> {
        if self.queue.is_full() {
            return Err(HealthError::Unhealthy(format!(
                "pending queue full with {} transactions",
                self.queue.len()
            )));
        }
        Ok(())
    }

    /// Assemble the next batch. Returns `None` on cancellation, after putting back what was
    /// taken from the queue.
    async fn next_batch(&self, cancel: &CancellationToken) -> Option<Batch> {
        let mut builder = BatchBuilder::new(self.settings, 0);

        loop {
            if !self.queue.accumulate(&mut builder, self.max_batch_time, cancel).await {
                self.queue.requeue_batch(builder.take());
                return None;
            }
            if !builder.is_empty() {
                return Some(builder.take());
            }
        }
    }

    /// Post batches concurrently until cancellation. In-flight batches are awaited before
    /// returning.
    pub async fn run_stateless(&self, cancel: CancellationToken) -> Result<(), SubmissionError> {
        info!(max_batch_time = ?self.max_batch_time, "🤠 Starting stateless aggregator loop");
        let mut tasks = JoinSet::new();

        while let Some(batch) = self.next_batch(&cancel).await {
            while let Some(res) = tasks.try_join_next() {
                log_task_panic(res);
            }

            let poster = self.poster.clone();
            let queue = Arc::clone(&self.queue);
            let ctx = self.ctx.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = poster.post(&batch, &cancel).await;
                if let Err(e) = settle(&queue, batch, result) {
                    ctx.report_fatal(NodeError::Submission(e));
                }
            });
        }

        debug!(in_flight = tasks.len(), "Waiting for in-flight batches");
        while let Some(res) = tasks.join_next().await {
            log_task_panic(res);
        }
        Ok(())
    }

    /// Post one batch at a time until cancellation.
    pub async fn run_stateful(&self, cancel: CancellationToken) -> Result<(), SubmissionError> {
        info!(max_batch_time = ?self.max_batch_time, "🤠 Starting stateful aggregator loop");

        while let Some(batch) = self.next_batch(&cancel).await {
            let result = self.poster.post(&batch, &cancel).await;
            settle(&self.queue, batch, result)?;
        }
        Ok(())
    }
}

/// Handle the outcome of a post. Batches that were never broadcast go back to the queue;
/// fatal errors are returned.
fn settle(
    queue: &PendingQueue,
    batch: Batch,
    result: Result<Confirmed, SubmissionError>,
) -> Result<(), SubmissionError> {
    match result {
        Ok(_) => Ok(()),
        Err(SubmissionError::Unconfirmed(hash)) => {
            // Requeueing it could submit the same transactions twice.
            warn!(%hash, "Batch still unconfirmed after cancellation, it may land later");
            Ok(())
        }
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            debug!(error = %e, txs = batch.len(), "Batch not broadcast, requeueing it");
            queue.requeue_batch(batch);
            Ok(())
        }
    }
}

fn log_task_panic(res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        warn!(error = %e, "Batch posting task failed");
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        batcher::AlwaysOpen,
        testing::{MockCore, MockSubmitter, SubmitterStep, test_context, tx},
    };

    fn aggregator(
        submitter: &MockSubmitter,
        stateful: bool,
    ) -> (Aggregator, mpsc::UnboundedReceiver<NodeError>) {
        let mut args = vec!["--batcher.max-batch-time-ms", "1000", "--batcher.max-batch-items", "2"];
        if stateful {
            args.push("--node.aggregator.stateful");
        }
        let (ctx, errors) = test_context(&args, MockCore::new());
        let poster = BatchPoster::new(
            Arc::new(submitter.clone()),
            Arc::new(AlwaysOpen),
            ctx.cfg.poster_settings(),
        );
        (Aggregator::new(&ctx, poster), errors)
    }

    #[tokio::test(start_paused = true)]
    async fn stateful_aggregator_posts_full_batches_in_order() {
        let submitter = MockSubmitter::new();
        let (aggregator, _errors) = aggregator(&submitter, true);
        for seq in 1..=5 {
            aggregator.accept(tx(1, seq)).unwrap();
        }

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            canceller.cancel();
        });
        aggregator.run_stateful(cancel).await.unwrap();

        let sequences: Vec<Vec<u64>> = submitter
            .broadcasts()
            .iter()
            .map(|b| b.batch.transactions().map(|tx| tx.sequence).collect())
            .collect();
        assert_eq!(sequences, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[tokio::test(start_paused = true)]
    async fn stateless_aggregator_reports_rejections() {
        let submitter = MockSubmitter::new();
        submitter.script([SubmitterStep::RevertWith("DataTooLarge")]);

        let (aggregator, mut errors) = aggregator(&submitter, false);
        aggregator.accept(tx(1, 1)).unwrap();

        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let cancel = cancel.clone();
            async move { aggregator.run_stateless(cancel).await }
        });

        let err = errors.recv().await.unwrap();
        assert!(matches!(err, NodeError::Submission(SubmissionError::Rejected(_))));

        cancel.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unsent_transactions_stay_queued_on_cancellation() {
        let submitter = MockSubmitter::new();
        let (aggregator, _errors) = aggregator(&submitter, true);
        aggregator.accept(tx(1, 1)).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        aggregator.run_stateful(cancel).await.unwrap();

        assert!(submitter.broadcasts().is_empty());
        assert_eq!(aggregator.queue.len(), 1);
    }
}
