use std::time::Duration;

use alloy::primitives::Address;
use clap::Parser;
use url::Url;

/// L1-related configuration options
#[derive(Debug, Clone, Parser)]
pub struct L1Opts {
    /// The URL of the L1 execution client HTTP connection
    #[clap(long = "l1.url", env = "KEEL_L1_URL", id = "l1-url")]
    pub url: Url,
    /// The interval between two scans of the L1 chain, in milliseconds
    #[clap(long = "l1.poll-interval-ms", env = "KEEL_L1_POLL_INTERVAL_MS", default_value_t = 2_000)]
    pub poll_interval_ms: u64,
    /// The number of confirmations an L1 block needs before its logs are read
    #[clap(long = "l1.confirmations", env = "KEEL_L1_CONFIRMATIONS", default_value_t = 0)]
    pub confirmations: u64,
    /// The maximum number of L1 blocks scanned in a single log query
    #[clap(long = "l1.max-log-range", env = "KEEL_L1_MAX_LOG_RANGE", default_value_t = 1_000)]
    pub max_log_range: u64,
}

impl L1Opts {
    /// The interval between two scans of the L1 chain.
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// The rollup deployment the node follows.
#[derive(Debug, Clone, Parser)]
pub struct RollupOpts {
    /// The chain ID of the rollup
    #[clap(long = "rollup.chain-id", env = "KEEL_ROLLUP_CHAIN_ID")]
    pub chain_id: u64,
    /// The address of the L1 `Bridge.sol`, which emits delayed messages
    #[clap(long = "rollup.bridge", env = "KEEL_ROLLUP_BRIDGE")]
    pub bridge: Address,
    /// The address of the L1 `SequencerInbox.sol`
    #[clap(long = "rollup.sequencer-inbox", env = "KEEL_ROLLUP_SEQUENCER_INBOX")]
    pub sequencer_inbox: Address,
    /// The address of the L1 `Inbox.sol` used by aggregators
    #[clap(long = "rollup.aggregator-inbox", env = "KEEL_ROLLUP_AGGREGATOR_INBOX")]
    pub aggregator_inbox: Option<Address>,
    /// The L1 block at which the rollup was deployed. The inbox is scanned from this block.
    #[clap(long = "rollup.from-block", env = "KEEL_ROLLUP_FROM_BLOCK", default_value_t = 0)]
    pub from_block: u64,
}

/// The broadcast feed options.
#[derive(Debug, Clone, Parser)]
pub struct FeedOpts {
    /// URLs of sequencer broadcast feeds to follow. Can be repeated.
    #[clap(long = "feed.url", env = "KEEL_FEED_URLS", value_delimiter = ',')]
    pub urls: Vec<Url>,
    /// Seconds without feed messages after which a connection is considered stale
    #[clap(long = "feed.timeout-secs", env = "KEEL_FEED_TIMEOUT_SECS", default_value_t = 20)]
    pub timeout_secs: u64,
}

impl FeedOpts {
    /// Returns the feed staleness timeout.
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
