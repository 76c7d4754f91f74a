use std::{net::SocketAddr, time::Duration};

use clap::Parser;

/// Health and readiness options
#[derive(Debug, Clone, Parser)]
pub struct HealthOpts {
    /// The address the health endpoints listen on
    #[clap(long = "health.addr", env = "KEEL_HEALTH_ADDR", default_value = "0.0.0.0:8080")]
    pub addr: SocketAddr,
    /// The interval between two evaluations of the health checks, in milliseconds
    #[clap(long = "health.interval-ms", env = "KEEL_HEALTH_INTERVAL_MS", default_value_t = 1_000)]
    pub interval_ms: u64,
    /// The maximum number of blocks the node may lag behind the L1 head
    #[clap(long = "health.max-l1-block-diff", env = "KEEL_HEALTH_MAX_L1_BLOCK_DIFF", default_value_t = 100)]
    pub max_l1_block_diff: u64,
    /// The maximum number of L2 blocks a forwarder's target may differ from the local engine
    #[clap(long = "health.max-l2-block-diff", env = "KEEL_HEALTH_MAX_L2_BLOCK_DIFF", default_value_t = 100)]
    pub max_l2_block_diff: u64,
    /// The maximum number of sequencer messages the engine may lag behind the inbox
    #[clap(long = "health.max-inbox-sync-diff", env = "KEEL_HEALTH_MAX_INBOX_SYNC_DIFF", default_value_t = 100)]
    pub max_inbox_sync_diff: u64,
    /// The maximum number of messages read but not executed yet
    #[clap(
        long = "health.max-messages-sync-diff",
        env = "KEEL_HEALTH_MAX_MESSAGES_SYNC_DIFF",
        default_value_t = 100
    )]
    pub max_messages_sync_diff: u64,
    /// The maximum number of executed messages whose logs are not processed yet
    #[clap(
        long = "health.max-logs-processed-sync-diff",
        env = "KEEL_HEALTH_MAX_LOGS_PROCESSED_SYNC_DIFF",
        default_value_t = 100
    )]
    pub max_logs_processed_sync_diff: u64,
    /// The maximum number of delayed messages read but not sequenced yet
    #[clap(long = "health.max-delayed-backlog", env = "KEEL_HEALTH_MAX_DELAYED_BACKLOG", default_value_t = 1_000)]
    pub max_delayed_backlog: u64,
    /// The maximum number of messages the broadcast feed may be ahead of the engine
    #[clap(long = "health.max-feed-lag", env = "KEEL_HEALTH_MAX_FEED_LAG", default_value_t = 1_000)]
    pub max_feed_lag: u64,
}

impl HealthOpts {
    /// The interval between two evaluations of the health checks.
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}
