use std::time::Duration;

use clap::{Parser, ValueEnum};
use url::Url;

/// The role of the node in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NodeType {
    /// Relays transactions to another node.
    Forwarder,
    /// Batches transactions and posts them through the public inbox.
    Aggregator,
    /// Orders transactions and delayed messages and posts them through the sequencer inbox.
    Sequencer,
}

/// Node role configuration options
#[derive(Debug, Clone, Parser)]
pub struct NodeOpts {
    /// The role of this node
    #[clap(long = "node.type", env = "KEEL_NODE_TYPE", value_enum, default_value_t = NodeType::Forwarder)]
    pub node_type: NodeType,
    /// Block readiness until the node has caught up with L1. Always enabled for sequencers.
    #[clap(long = "node.wait-to-catch-up", env = "KEEL_NODE_WAIT_TO_CATCH_UP", default_value_t = false)]
    pub wait_to_catch_up: bool,
    /// The URL of the execution engine JSON-RPC endpoint
    #[clap(long = "node.core-url", env = "KEEL_NODE_CORE_URL")]
    pub core_url: Url,
    /// Forwarder options
    #[clap(flatten)]
    pub forwarder: ForwarderOpts,
    /// Aggregator options
    #[clap(flatten)]
    pub aggregator: AggregatorOpts,
    /// Sequencer lockout options
    #[clap(flatten)]
    pub lockout: LockoutOpts,
}

/// Forwarder options
#[derive(Debug, Clone, Parser)]
pub struct ForwarderOpts {
    /// The JSON-RPC endpoint transactions are forwarded to
    #[clap(long = "node.forwarder.target", env = "KEEL_FORWARDER_TARGET")]
    pub target: Option<Url>,
}

/// Aggregator options
#[derive(Debug, Clone, Parser)]
pub struct AggregatorOpts {
    /// Only keep one batch in flight per signing key, confirming each before the next
    #[clap(long = "node.aggregator.stateful", env = "KEEL_AGGREGATOR_STATEFUL", default_value_t = false)]
    pub stateful: bool,
}

/// Sequencer lockout options
#[derive(Debug, Clone, Parser)]
pub struct LockoutOpts {
    /// The Redis URL of the shared lock service. Enables leader election between replicas.
    #[clap(long = "sequencer.lockout.redis", env = "KEEL_LOCKOUT_REDIS")]
    pub redis: Option<Url>,
    /// This replica's RPC URL, used as its identity in the lock service and as the address
    /// other replicas forward transactions to while this one is the leader
    #[clap(long = "sequencer.lockout.self-rpc-url", env = "KEEL_LOCKOUT_SELF_RPC_URL")]
    pub self_rpc_url: Option<Url>,
    /// The lease time-to-live, in milliseconds
    #[clap(long = "sequencer.lockout.ttl-ms", env = "KEEL_LOCKOUT_TTL_MS", default_value_t = 30_000)]
    pub ttl_ms: u64,
    /// The interval between lease renewals, in milliseconds. Must be lower than the TTL.
    #[clap(
        long = "sequencer.lockout.renew-interval-ms",
        env = "KEEL_LOCKOUT_RENEW_INTERVAL_MS",
        default_value_t = 10_000
    )]
    pub renew_interval_ms: u64,
    /// The interval between acquisition attempts while another replica holds the lease, in
    /// milliseconds
    #[clap(
        long = "sequencer.lockout.acquire-interval-ms",
        env = "KEEL_LOCKOUT_ACQUIRE_INTERVAL_MS",
        default_value_t = 5_000
    )]
    pub acquire_interval_ms: u64,
}

impl LockoutOpts {
    /// Returns `true` if a lock service is configured.
    pub const fn is_enabled(&self) -> bool {
        self.redis.is_some()
    }

    /// The lease time-to-live.
    pub const fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// The interval between lease renewals.
    pub const fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    /// The interval between acquisition attempts.
    pub const fn acquire_interval(&self) -> Duration {
        Duration::from_millis(self.acquire_interval_ms)
    }
}
