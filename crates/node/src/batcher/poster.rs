use std::{sync::Arc, time::Duration};

use alloy_primitives::B256;
use keel_primitives::{Batch, summary::Summary};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{AttemptError, L1Submitter, ReceiptStatus, SubmissionError, SubmissionGate, TxParams};
use crate::metrics::NodeMetrics;

/// The number of reverted submissions of the same batch after which posting is abandoned.
const MAX_REVERTS: usize = 3;

/// The settings of the [`BatchPoster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PosterSettings {
    /// The interval between receipt checks.
    pub receipt_poll_interval: Duration,
    /// How long a broadcast transaction may stay unconfirmed before being replaced.
    pub confirmation_timeout: Duration,
    /// The fee increase of every replacement, in percent.
    pub gas_bump_percent: u32,
    /// The maximum fee per gas ever paid, in wei.
    pub max_gas_price_wei: u128,
    /// The delay before retrying after a transport error.
    pub retry_delay: Duration,
}

/// A batch confirmed on L1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmed {
    /// The hash of the transaction that landed.
    pub hash: B256,
    /// The block it landed in.
    pub block_number: Option<u64>,
    /// The number of broadcasts it took.
    pub attempts: u32,
}

/// Carries a batch submission to L1, with retries.
#[derive(Debug, Clone)]
pub struct BatchPoster {
    submitter: Arc<dyn L1Submitter>,
    gate: Arc<dyn SubmissionGate>,
    settings: PosterSettings,
}

impl BatchPoster {
    /// Creates a new instance of [`BatchPoster`].
    pub fn new(
        submitter: Arc<dyn L1Submitter>,
        gate: Arc<dyn SubmissionGate>,
        settings: PosterSettings,
    ) -> Self {
        Self { submitter, gate, settings }
    }

    /// Returns `true` if new broadcasts are currently allowed.
    pub fn can_submit(&self) -> bool {
        self.gate.is_open()
    }

    /// Post a batch to L1 and wait for its confirmation.
    ///
    /// The nonce and gas limit picked on the first attempt are kept across replacements, so
    /// that at most one version of the batch can land. A transaction stuck in the mempool is
    /// replaced with bumped fees; a reverted one is resubmitted with a fresh nonce.
    ///
    /// Cancellation or a closed gate stops further broadcasts. A transaction already in
    /// flight is awaited once more, for at most the confirmation timeout.
    pub async fn post(&self, batch: &Batch, cancel: &CancellationToken) -> Result<Confirmed, SubmissionError> {
        info!("🧑‍🍳 posting batch: {}", batch.summary());
        NodeMetrics::set_batch_size(batch.len(), batch.size());

        let start = Instant::now();
        let result = self.post_with_retries(batch, cancel).await;

        match &result {
            Ok(confirmed) => {
                info!(
                    hash = %confirmed.hash,
                    block_number = confirmed.block_number,
                    attempts = confirmed.attempts,
                    "🦅 Batch landed"
                );
                NodeMetrics::increment_batches_confirmed();
                NodeMetrics::set_batch_attempts(confirmed.attempts);
                NodeMetrics::record_batch_inclusion_time(start.elapsed());
            }
            Err(SubmissionError::Cancelled) => debug!("Batch not broadcast before cancellation"),
            Err(e) => {
                error!(error = %e, "Failed to post batch");
                NodeMetrics::increment_batch_submission_failures(e.to_string());
            }
        }

        result
    }

    async fn post_with_retries(
        &self,
        batch: &Batch,
        cancel: &CancellationToken,
    ) -> Result<Confirmed, SubmissionError> {
        let settings = self.settings;
        let mut params = TxParams::default();
        // Hashes broadcast with the current nonce. Any of them may land.
        let mut in_flight: Vec<B256> = Vec::new();
        let mut needs_broadcast = true;
        let mut attempts = 0;
        let mut reverts = 0;

        loop {
            if cancel.is_cancelled() || !self.gate.is_open() {
                return match in_flight.last() {
                    Some(hash) => Err(SubmissionError::Unconfirmed(*hash)),
                    None => Err(SubmissionError::Cancelled),
                };
            }

            if needs_broadcast {
                attempts += 1;
                match self.submitter.broadcast(batch, params).await {
                    Ok(broadcast) => {
                        NodeMetrics::increment_batches_submitted();
                        params = broadcast.params;
                        in_flight.push(broadcast.hash);
                        needs_broadcast = false;
                    }
                    Err(AttemptError::Rejected(reason)) => {
                        return Err(SubmissionError::Rejected(reason));
                    }
                    Err(AttemptError::Underpriced) => {
                        warn!(attempts, "Batch underpriced, bumping fees");
                        if !params.bump(settings.gas_bump_percent, settings.max_gas_price_wei) {
                            self.sleep(settings.retry_delay, cancel).await;
                        }
                        continue;
                    }
                    Err(AttemptError::NonceTooLow) => {
                        // One of our broadcasts may have landed in the meantime.
                        if let Some((hash, status)) = self.find_receipt(&in_flight).await {
                            if status.success {
                                return Ok(Confirmed { hash, block_number: status.block_number, attempts });
                            }
                        }
                        warn!(attempts, "Nonce already used, resubmitting with a fresh nonce");
                        params.nonce = None;
                        in_flight.clear();
                        continue;
                    }
                    Err(e @ (AttemptError::FeesTooHigh { .. } | AttemptError::Transport(_))) => {
                        warn!(error = %e, attempts, "Failed to broadcast batch, retrying in {:?}", settings.retry_delay);
                        self.sleep(settings.retry_delay, cancel).await;
                        continue;
                    }
                }
            }

            let Some((hash, status)) = self.wait_for_receipt(&in_flight).await else {
                if params.bump(settings.gas_bump_percent, settings.max_gas_price_wei) {
                    warn!(attempts, ?params, "Batch not confirmed in time, replacing it with higher fees");
                    needs_broadcast = true;
                } else {
                    warn!(attempts, "Batch not confirmed in time and fees reached the cap, waiting");
                }
                continue;
            };

            if status.success {
                return Ok(Confirmed { hash, block_number: status.block_number, attempts });
            }

            reverts += 1;
            NodeMetrics::increment_batches_reverted();
            if let Some(reason) = self.submitter.revert_reason(hash).await {
                error!(%hash, reason, "‼️ Batch reverted");
                return Err(SubmissionError::Rejected(reason));
            }
            if reverts >= MAX_REVERTS {
                return Err(SubmissionError::TooManyReverts(reverts));
            }

            warn!(%hash, reverts, "Batch reverted for an unknown reason, resubmitting");
            params.nonce = None;
            params.bump(settings.gas_bump_percent, settings.max_gas_price_wei);
            in_flight.clear();
            needs_broadcast = true;
        }
    }

    /// Poll the receipts of the in-flight transactions until one is mined or the confirmation
    /// timeout elapses.
    async fn wait_for_receipt(&self, in_flight: &[B256]) -> Option<(B256, ReceiptStatus)> {
        let deadline = Instant::now() + self.settings.confirmation_timeout;

        loop {
            if let Some(found) = self.find_receipt(in_flight).await {
                return Some(found);
            }
            if Instant::now() + self.settings.receipt_poll_interval > deadline {
                return None;
            }
            tokio::time::sleep(self.settings.receipt_poll_interval).await;
        }
    }

    async fn find_receipt(&self, in_flight: &[B256]) -> Option<(B256, ReceiptStatus)> {
        for hash in in_flight.iter().rev() {
            match self.submitter.receipt(*hash).await {
                Ok(Some(status)) => return Some((*hash, status)),
                Ok(None) => {}
                Err(e) => debug!(error = %e, %hash, "Failed to get receipt"),
            }
        }
        None
    }

    async fn sleep(&self, delay: Duration, cancel: &CancellationToken) {
        tokio::select! {
            () = cancel.cancelled() => {}
            () = tokio::time::sleep(delay) => {}
        }
    }
}
