use alloy::{consensus::constants::ETH_TO_WEI, primitives::U256, signers::local::PrivateKeySigner};
use clap::Parser;

/// Operator-related configuration options
#[derive(Debug, Clone, Parser)]
pub struct OperatorOpts {
    /// The private key used to sign batch submissions. Required by aggregators and sequencers.
    #[clap(long = "operator.private-key", env = "KEEL_OPERATOR_PRIVATE_KEY")]
    pub private_key: Option<PrivateKeySigner>,
    /// The minimum ETH balance required to start submitting batches (in wei)
    ///
    /// Default: 0.1 ETH
    #[clap(long = "operator.min-eth", env = "KEEL_MIN_ETH_BALANCE", default_value_t = U256::from(ETH_TO_WEI / 10))]
    pub min_eth_balance: U256,
}
