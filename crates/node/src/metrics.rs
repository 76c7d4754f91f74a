use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::lockout::LockoutState;

#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeMetrics;

impl NodeMetrics {
    // ################ COUNTERS ################ //

    // ============= L1 STATE ================ //

    /// Sets the L1 execution client head (aka: latest block number)
    pub(crate) fn set_l1_head(value: u64) {
        counter!("keel_l1_head").absolute(value);
    }

    /// Sets the last L1 block scanned by the inbox reader
    pub(crate) fn set_l1_processed_block(value: u64) {
        counter!("keel_l1_processed_block").absolute(value);
    }

    /// Sets the latest sequence number seen on the broadcast feed
    pub(crate) fn set_feed_sequence(value: u64) {
        counter!("keel_feed_sequence").absolute(value);
    }

    // ============= INBOX ================ //

    /// Increments the amount of delayed messages read from L1
    pub(crate) fn increment_delayed_messages_read(count: usize) {
        counter!("keel_delayed_messages_read").increment(count as u64);
    }

    /// Increments the amount of inbox reader failures by reason
    pub(crate) fn increment_inbox_reader_errors(reason: String) {
        counter!("keel_inbox_reader_errors", "reason" => reason).increment(1);
    }

    /// Increments the amount of feed messages that disagreed with L1
    pub(crate) fn increment_feed_divergences() {
        counter!("keel_feed_divergences").increment(1);
    }

    // ============= Sequencing ================ //

    /// Increments the amount of delayed messages sequenced
    pub(crate) fn increment_delayed_messages_sequenced(count: u64) {
        counter!("keel_delayed_messages_sequenced").increment(count);
    }

    /// Increments the amount of transactions sequenced
    pub(crate) fn increment_transactions_sequenced(count: usize) {
        counter!("keel_transactions_sequenced").increment(count as u64);
    }

    /// Increments the amount of transactions forwarded to another node
    pub(crate) fn increment_forwarded_transactions() {
        counter!("keel_forwarded_transactions").increment(1);
    }

    /// Increments the amount of transactions relayed to the lease holder
    pub(crate) fn increment_relayed_transactions(count: usize) {
        counter!("keel_relayed_transactions").increment(count as u64);
    }

    // ============= Batches ================ //

    /// Increments the amount of L1 batch transactions broadcast, replacements included
    pub(crate) fn increment_batches_submitted() {
        counter!("keel_batches_submitted").increment(1);
    }

    /// Increments the amount of L1 batches successfully included
    pub(crate) fn increment_batches_confirmed() {
        counter!("keel_batches_confirmed").increment(1);
    }

    /// Increments the amount of L1 batches included but reverted
    pub(crate) fn increment_batches_reverted() {
        counter!("keel_batches_reverted").increment(1);
    }

    /// Increments the amount of L1 batch submission failures by reason
    pub(crate) fn increment_batch_submission_failures(reason: String) {
        counter!("keel_batch_submission_failures", "reason" => reason).increment(1);
    }

    // ============= Lockout ================ //

    /// Increments the amount of leases acquired
    pub(crate) fn increment_lease_acquisitions() {
        counter!("keel_lease_acquisitions").increment(1);
    }

    /// Increments the amount of leases lost before being released
    pub(crate) fn increment_lease_losses() {
        counter!("keel_lease_losses").increment(1);
    }

    // ################ GAUGES ################ //

    /// Sets the version of the Keel node.
    pub(crate) fn set_keel_version(tag: String) {
        gauge!("keel_version", "tag" => tag).set(1.0);
    }

    /// Sets the amount of transactions waiting to be batched
    pub(crate) fn set_pending_queue_len(len: usize) {
        gauge!("keel_pending_queue_len").set(len as f64);
    }

    /// Sets the size of the last posted batch, in items and bytes
    pub(crate) fn set_batch_size(items: usize, bytes: usize) {
        gauge!("keel_batch_items").set(items as f64);
        gauge!("keel_batch_size_bytes").set(bytes as f64);
    }

    /// Sets the amount of broadcasts the last confirmed batch took
    pub(crate) fn set_batch_attempts(attempts: u32) {
        gauge!("keel_batch_attempts").set(f64::from(attempts));
    }

    /// Sets the balance of the operator wallet, in ETH
    pub(crate) fn set_wallet_balance(eth: f64) {
        gauge!("keel_wallet_balance_eth").set(eth);
    }

    /// Sets the leader election state.
    pub(crate) fn set_lockout_state(state: LockoutState) {
        let displayed = state.to_string();

        for other in LockoutState::ALL {
            if other == state {
                // Don't temporarily set the current state to 0.
                continue;
            }
            gauge!("keel_lockout_state", "state" => other.to_string()).set(0);
        }

        gauge!("keel_lockout_state", "state" => displayed).set(1);
    }

    /// Sets the result of a health check.
    pub(crate) fn set_health_check(registry: &'static str, check: &'static str, healthy: bool) {
        gauge!("keel_health_check", "registry" => registry, "check" => check)
            .set(if healthy { 1.0 } else { 0.0 });
    }

    // ################ HISTOGRAMS ################ //

    /// Records the time from the first broadcast of a batch to its confirmation
    pub(crate) fn record_batch_inclusion_time(elapsed: Duration) {
        histogram!("keel_batch_inclusion_time_seconds").record(elapsed.as_secs_f64());
    }
}
