use std::time::Duration;

use clap::Parser;

/// Batch assembly and submission options
#[derive(Debug, Clone, Parser)]
pub struct BatcherOpts {
    /// The maximum time a transaction waits in the queue before a batch is posted, in
    /// milliseconds
    #[clap(long = "batcher.max-batch-time-ms", env = "KEEL_BATCHER_MAX_BATCH_TIME_MS", default_value_t = 10_000)]
    pub max_batch_time_ms: u64,
    /// The maximum number of items in a batch
    #[clap(long = "batcher.max-batch-items", env = "KEEL_BATCHER_MAX_BATCH_ITEMS", default_value_t = 500)]
    pub max_batch_items: usize,
    /// The maximum size of a batch, in kilobytes
    #[clap(long = "batcher.max-batch-size-kb", env = "KEEL_BATCHER_MAX_BATCH_SIZE_KB", default_value_t = 100)]
    pub max_batch_size_kb: usize,
    /// The maximum size of a single transaction, in bytes
    #[clap(long = "batcher.max-tx-size", env = "KEEL_BATCHER_MAX_TX_SIZE", default_value_t = 128 * 1024)]
    pub max_tx_size: usize,
    /// The maximum number of transactions waiting to be batched
    #[clap(long = "batcher.queue-capacity", env = "KEEL_BATCHER_QUEUE_CAPACITY", default_value_t = 10_000)]
    pub queue_capacity: usize,
    /// The interval between receipt checks of a broadcast batch, in milliseconds
    #[clap(
        long = "batcher.receipt-poll-interval-ms",
        env = "KEEL_BATCHER_RECEIPT_POLL_INTERVAL_MS",
        default_value_t = 2_000
    )]
    pub receipt_poll_interval_ms: u64,
    /// How long a broadcast batch may stay unconfirmed before it is resubmitted, in seconds
    #[clap(
        long = "batcher.confirmation-timeout-secs",
        env = "KEEL_BATCHER_CONFIRMATION_TIMEOUT_SECS",
        default_value_t = 60
    )]
    pub confirmation_timeout_secs: u64,
    /// The gas price increase applied to every resubmission, in percent. Replacement
    /// transactions need at least 10%.
    #[clap(long = "batcher.gas-bump-percent", env = "KEEL_BATCHER_GAS_BUMP_PERCENT", default_value_t = 20)]
    pub gas_bump_percent: u32,
    /// The maximum fee per gas paid for a batch submission, in gwei
    #[clap(long = "batcher.max-gas-price-gwei", env = "KEEL_BATCHER_MAX_GAS_PRICE_GWEI", default_value_t = 500)]
    pub max_gas_price_gwei: u64,
    /// The delay before retrying a submission after a transport error, in milliseconds
    #[clap(long = "batcher.retry-delay-ms", env = "KEEL_BATCHER_RETRY_DELAY_MS", default_value_t = 3_000)]
    pub retry_delay_ms: u64,
    /// The L1 confirmations a delayed message needs before a sequencer includes it on its
    /// own initiative
    #[clap(
        long = "sequencer.delayed-confirmations",
        env = "KEEL_SEQUENCER_DELAYED_CONFIRMATIONS",
        default_value_t = 12
    )]
    pub delayed_confirmations: u64,
}

impl BatcherOpts {
    /// The maximum time a transaction waits in the queue before a batch is posted.
    pub const fn max_batch_time(&self) -> Duration {
        Duration::from_millis(self.max_batch_time_ms)
    }

    /// The interval between receipt checks.
    pub const fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }

    /// How long a broadcast batch may stay unconfirmed.
    pub const fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    /// The delay before retrying a submission after a transport error.
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// The maximum fee per gas, in wei.
    pub const fn max_gas_price_wei(&self) -> u128 {
        self.max_gas_price_gwei as u128 * 1_000_000_000
    }
}
