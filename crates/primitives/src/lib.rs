#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Keel primitive types, utilities and constants.

use alloy::eips::eip4895::GWEI_TO_WEI;
use alloy_primitives::U256;

/// Layer-2 transactions submitted directly to the node.
pub mod transaction;
pub use transaction::Transaction;

/// Messages originated on L1 through the delayed inbox.
pub mod delayed;
pub use delayed::DelayedMessage;

/// Ordered batches of transactions and delayed messages.
pub mod batch;
pub use batch::{Batch, BatchBuilder, BatchItem, BatchSettings};

/// Progress counters shared between the pipeline stages.
pub mod sync;
pub use sync::{SyncSnapshot, SyncState};

/// Time-related utilities.
pub mod time;

/// Transport and startup retry utilities.
pub mod retries;

/// Utility for summarizing objects into a string for logging purposes.
pub mod summary;

/// Utilities for triggering shutdown signals from active tasks.
pub mod shutdown;

/// Utilities for handling long-running tasks.
pub mod task;

/// A constant for the number of bytes in a kilobyte.
pub const BYTES_PER_KB: usize = 1024;

/// From a balance expressed in wei, return the balance in ETH as a f64 with gwei precision.
///
/// NOTE:
/// * returns zero if the balance is less than 1 gwei;
/// * returns at most a balance of ~9M ETH to avoid floating point inaccuracies above certain
///   numbers.
pub fn wei_to_eth(balance: U256) -> f64 {
    const GWEI_IN_ETH: f64 = 1e-9;
    const F64_REPRESENTATION_THRESHOLD: u64 = 1 << 53;

    let balance_in_gwei = balance / U256::from(GWEI_TO_WEI);

    if balance_in_gwei.is_zero() {
        return 0.0;
    }

    if balance_in_gwei > U256::from(F64_REPRESENTATION_THRESHOLD) {
        return 9_007_199.254740992;
    }

    balance_in_gwei.as_limbs()[0] as f64 * GWEI_IN_ETH
}

#[cfg(test)]
mod tests {
    use alloy::consensus::constants::ETH_TO_WEI;

    use super::*;

    #[test]
    fn wei_to_eth_below_one_gwei_is_zero() {
        let balance_eth = wei_to_eth(U256::from(1_000));
        assert_eq!(balance_eth, 0.0, "Balance should be zero. Got: {balance_eth}");
    }

    #[test]
    fn wei_to_eth_half_eth() {
        let balance_eth = wei_to_eth(U256::from(ETH_TO_WEI / 2));
        assert_eq!(balance_eth, 0.5, "Expected 0.5 ETH. Got: {balance_eth}");
    }

    #[test]
    fn wei_to_eth_huge_balance_is_capped() {
        let balance = U256::from(ETH_TO_WEI) * U256::from(10_000_000u64);
        let balance_eth = wei_to_eth(balance);
        assert!(balance_eth < 10_000_000_f64, "Computed balance should be capped");
    }
}
