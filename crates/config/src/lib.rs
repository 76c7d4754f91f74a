#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Configuration for the Keel sequencing node.

use alloy::primitives::Address;
use clap::{
    Parser,
    builder::{
        Styles,
        styling::{AnsiColor, Color, Style},
    },
};
use thiserror::Error;

mod chain;
pub use chain::{FeedOpts, L1Opts, RollupOpts};

mod node;
pub use node::{AggregatorOpts, ForwarderOpts, LockoutOpts, NodeOpts, NodeType};

mod batcher;
pub use batcher::BatcherOpts;

mod health;
pub use health::HealthOpts;

mod operator;
pub use operator::OperatorOpts;

mod telemetry;
pub use telemetry::{LogProvider, TelemetryError, TelemetryOpts};

/// CLI options for the Keel node.
#[derive(Debug, Clone, Parser)]
#[command(author, version, styles = cli_styles(), about)]
pub struct Opts {
    /// A unique name for this Keel instance, used in metrics and logs
    #[clap(long, env = "KEEL_INSTANCE_NAME", default_value = "keel")]
    pub instance_name: String,
    /// L1-related configuration options
    #[clap(flatten)]
    pub l1: L1Opts,
    /// The rollup deployment
    #[clap(flatten)]
    pub rollup: RollupOpts,
    /// The role of the node
    #[clap(flatten)]
    pub node: NodeOpts,
    /// Batch assembly and submission options
    #[clap(flatten)]
    pub batcher: BatcherOpts,
    /// Broadcast feed options
    #[clap(flatten)]
    pub feed: FeedOpts,
    /// Operator-related configuration options
    #[clap(flatten)]
    pub operator: OperatorOpts,
    /// Health and readiness options
    #[clap(flatten)]
    pub health: HealthOpts,
    /// Telemetry-related configuration options
    #[clap(flatten)]
    pub telemetry: TelemetryOpts,
}

/// An invalid combination of options. The node refuses to start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("--rollup.chain-id must be set")]
    MissingChainId,
    #[error("--rollup.{0} must be a non-zero address")]
    ZeroAddress(&'static str),
    #[error("the sequencer lockout is only supported on sequencer nodes")]
    LockoutRequiresSequencer,
    #[error("--sequencer.lockout.redis and --sequencer.lockout.self-rpc-url must be set together")]
    IncompleteLockout,
    #[error("lockout renew interval ({renew_ms}ms) must be lower than its ttl ({ttl_ms}ms)")]
    RenewIntervalTooLong { renew_ms: u64, ttl_ms: u64 },
    #[error("forwarders need --node.forwarder.target")]
    MissingForwarderTarget,
    #[error("aggregators need --rollup.aggregator-inbox")]
    MissingAggregatorInbox,
    #[error("{0:?} nodes need --operator.private-key to sign batches")]
    MissingOperatorKey(NodeType),
    #[error("--batcher.{0} must be greater than zero")]
    ZeroBatchLimit(&'static str),
    #[error("--batcher.gas-bump-percent must be at least 10, got {0}")]
    GasBumpTooLow(u32),
}

impl Opts {
    /// Check the options for inconsistencies and normalize them.
    ///
    /// Sequencers always wait to catch up with L1 before serving.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.rollup.chain_id == 0 {
            return Err(ConfigError::MissingChainId);
        }
        if self.rollup.bridge == Address::ZERO {
            return Err(ConfigError::ZeroAddress("bridge"));
        }
        if self.rollup.sequencer_inbox == Address::ZERO {
            return Err(ConfigError::ZeroAddress("sequencer-inbox"));
        }

        let lockout = &self.node.lockout;
        if lockout.redis.is_some() && self.node.node_type != NodeType::Sequencer {
            return Err(ConfigError::LockoutRequiresSequencer);
        }
        if lockout.redis.is_some() != lockout.self_rpc_url.is_some() {
            return Err(ConfigError::IncompleteLockout);
        }
        if lockout.is_enabled() && lockout.renew_interval_ms >= lockout.ttl_ms {
            return Err(ConfigError::RenewIntervalTooLong {
                renew_ms: lockout.renew_interval_ms,
                ttl_ms: lockout.ttl_ms,
            });
        }

        match self.node.node_type {
            NodeType::Forwarder => {
                if self.node.forwarder.target.is_none() {
                    return Err(ConfigError::MissingForwarderTarget);
                }
            }
            NodeType::Aggregator => {
                if self.rollup.aggregator_inbox.is_none() {
                    return Err(ConfigError::MissingAggregatorInbox);
                }
                self.check_batcher()?;
            }
            NodeType::Sequencer => {
                self.check_batcher()?;
                self.node.wait_to_catch_up = true;
            }
        }

        Ok(self)
    }

    fn check_batcher(&self) -> Result<(), ConfigError> {
        if self.operator.private_key.is_none() {
            return Err(ConfigError::MissingOperatorKey(self.node.node_type));
        }
        if self.batcher.max_batch_items == 0 {
            return Err(ConfigError::ZeroBatchLimit("max-batch-items"));
        }
        if self.batcher.max_batch_size_kb == 0 {
            return Err(ConfigError::ZeroBatchLimit("max-batch-size-kb"));
        }
        if self.batcher.queue_capacity == 0 {
            return Err(ConfigError::ZeroBatchLimit("queue-capacity"));
        }
        if self.batcher.gas_bump_percent < 10 {
            return Err(ConfigError::GasBumpTooLow(self.batcher.gas_bump_percent));
        }
        Ok(())
    }
}

/// Styles for the CLI.
const fn cli_styles() -> Styles {
    Styles::styled()
        .usage(Style::new().bold().underline().fg_color(Some(Color::Ansi(AnsiColor::Yellow))))
        .header(Style::new().bold().underline().fg_color(Some(Color::Ansi(AnsiColor::Yellow))))
        .literal(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Green))))
        .invalid(Style::new().bold().fg_color(Some(Color::Ansi(AnsiColor::Red))))
        .error(Style::new().bold().fg_color(Some(Color::Ansi(AnsiColor::Red))))
        .valid(Style::new().bold().underline().fg_color(Some(Color::Ansi(AnsiColor::Green))))
        .placeholder(Style::new().fg_color(Some(Color::Ansi(AnsiColor::White))))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    const BASE: &[&str] = &[
        "keel",
        "--l1.url",
        "http://localhost:8545",
        "--rollup.chain-id",
        "42161",
        "--rollup.bridge",
        "0x0000000000000000000000000000000000000b0b",
        "--rollup.sequencer-inbox",
        "0x0000000000000000000000000000000000000a11",
        "--node.core-url",
        "http://localhost:9000",
    ];

    const KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn parse(extra: &[&str]) -> Opts {
        let args = BASE.iter().chain(extra.iter()).copied();
        Opts::try_parse_from(args).expect("valid cli args")
    }

    #[test]
    fn test_verify_cli() {
        use clap::CommandFactory;
        Opts::command().debug_assert()
    }

    #[test]
    fn forwarder_needs_a_target() {
        let err = parse(&[]).validate().unwrap_err();
        assert_eq!(err, ConfigError::MissingForwarderTarget);

        let opts = parse(&["--node.forwarder.target", "http://sequencer:8547"]).validate();
        assert!(opts.is_ok());
    }

    #[test]
    fn lockout_requires_a_sequencer() {
        let err = parse(&[
            "--node.forwarder.target",
            "http://sequencer:8547",
            "--sequencer.lockout.redis",
            "redis://localhost:6379",
            "--sequencer.lockout.self-rpc-url",
            "http://replica-a:8547",
        ])
        .validate()
        .unwrap_err();

        assert_eq!(err, ConfigError::LockoutRequiresSequencer);
    }

    #[test]
    fn lockout_options_come_in_pairs() {
        let err = parse(&[
            "--node.type",
            "sequencer",
            "--operator.private-key",
            KEY,
            "--sequencer.lockout.redis",
            "redis://localhost:6379",
        ])
        .validate()
        .unwrap_err();

        assert_eq!(err, ConfigError::IncompleteLockout);
    }

    #[test]
    fn renew_interval_must_be_below_ttl() {
        let err = parse(&[
            "--node.type",
            "sequencer",
            "--operator.private-key",
            KEY,
            "--sequencer.lockout.redis",
            "redis://localhost:6379",
            "--sequencer.lockout.self-rpc-url",
            "http://replica-a:8547",
            "--sequencer.lockout.ttl-ms",
            "1000",
            "--sequencer.lockout.renew-interval-ms",
            "1000",
        ])
        .validate()
        .unwrap_err();

        assert_eq!(err, ConfigError::RenewIntervalTooLong { renew_ms: 1000, ttl_ms: 1000 });
    }

    #[test]
    fn aggregator_needs_inbox_and_key() {
        let err = parse(&["--node.type", "aggregator"]).validate().unwrap_err();
        assert_eq!(err, ConfigError::MissingAggregatorInbox);

        let err = parse(&[
            "--node.type",
            "aggregator",
            "--rollup.aggregator-inbox",
            "0x00000000000000000000000000000000000000aa",
        ])
        .validate()
        .unwrap_err();
        assert_eq!(err, ConfigError::MissingOperatorKey(NodeType::Aggregator));
    }

    #[test]
    fn sequencer_always_waits_to_catch_up() {
        let opts = parse(&["--node.type", "sequencer", "--operator.private-key", KEY])
            .validate()
            .unwrap();

        assert!(opts.node.wait_to_catch_up);
    }
}
