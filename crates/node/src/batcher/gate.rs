use std::fmt::Debug;

/// Checked right before every L1 broadcast. A closed gate stops new broadcasts but never
/// interrupts a transaction already in flight.
pub trait SubmissionGate: Debug + Send + Sync {
    /// Returns `true` if the node may broadcast a new transaction.
    fn is_open(&self) -> bool;
}

/// The gate of nodes that do not take part in leader election.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOpen;

impl SubmissionGate for AlwaysOpen {
    fn is_open(&self) -> bool {
        true
    }
}
