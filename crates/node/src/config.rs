use std::time::Duration;

use derive_more::derive::{Deref, DerefMut};
use keel_config::{NodeType, Opts};
use keel_primitives::{BYTES_PER_KB, BatchSettings, summary::Summary, wei_to_eth};

use crate::batcher::PosterSettings;

/// The share of the lease TTL kept as a safety margin before the lease is considered expired.
const LEASE_SAFETY_MARGIN_PERCENT: u32 = 10;

/// The runtime configuration for the Keel node.
#[derive(Debug, Clone, Deref, DerefMut)]
pub struct RuntimeConfig {
    /// CLI options that can be accessed as dereferenced fields.
    #[deref]
    #[deref_mut]
    pub opts: Opts,
}

impl RuntimeConfig {
    /// Create a new [`RuntimeConfig`] from already validated [`Opts`].
    pub const fn new(opts: Opts) -> Self {
        Self { opts }
    }

    /// Returns the limits of a batch.
    pub const fn batch_settings(&self) -> BatchSettings {
        BatchSettings {
            max_items: self.opts.batcher.max_batch_items,
            max_size: self.opts.batcher.max_batch_size_kb * BYTES_PER_KB,
        }
    }

    /// Returns the settings of the batch poster.
    pub const fn poster_settings(&self) -> PosterSettings {
        PosterSettings {
            receipt_poll_interval: self.opts.batcher.receipt_poll_interval(),
            confirmation_timeout: self.opts.batcher.confirmation_timeout(),
            gas_bump_percent: self.opts.batcher.gas_bump_percent,
            max_gas_price_wei: self.opts.batcher.max_gas_price_wei(),
            retry_delay: self.opts.batcher.retry_delay(),
        }
    }

    /// The margin subtracted from the lease TTL by the submission gate.
    pub fn lease_safety_margin(&self) -> Duration {
        keel_primitives::time::percent_of(self.opts.node.lockout.ttl(), LEASE_SAFETY_MARGIN_PERCENT)
    }

    /// Returns `true` if this node submits batches to L1.
    pub fn is_submitter(&self) -> bool {
        self.opts.node.node_type != NodeType::Forwarder
    }
}

impl Summary for RuntimeConfig {
    fn summary(&self) -> String {
        let operator = self
            .opts
            .operator
            .private_key
            .as_ref()
            .map_or_else(|| "none".to_owned(), |key| key.address().to_string());

        format!(
            "Running with the following configuration:
            - Instance name: {}
            - Node: type={:?}, wait_to_catch_up={}, lockout={}
            - L1: poll_interval={:?}, confirmations={}, max_log_range={}
            - Rollup: chain_id={}, bridge={}, sequencer_inbox={}, from_block={}
            - Operator: address={}, min_eth_balance={:.2}
            - Batch: max_items={}, max_size={}b, max_time={:?}, max_tx_size={}b
            - Feed: urls={}
            ",
            self.opts.instance_name,
            self.opts.node.node_type,
            self.opts.node.wait_to_catch_up,
            self.opts.node.lockout.is_enabled(),
            self.opts.l1.poll_interval(),
            self.opts.l1.confirmations,
            self.opts.l1.max_log_range,
            self.opts.rollup.chain_id,
            self.opts.rollup.bridge,
            self.opts.rollup.sequencer_inbox,
            self.opts.rollup.from_block,
            operator,
            wei_to_eth(self.opts.operator.min_eth_balance),
            self.batch_settings().max_items,
            self.batch_settings().max_size,
            self.opts.batcher.max_batch_time(),
            self.opts.batcher.max_tx_size,
            self.opts.feed.urls.len(),
        )
    }
}
