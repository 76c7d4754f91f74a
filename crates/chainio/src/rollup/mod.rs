/// `IBridge.sol` L1 contract bindings, the source of delayed messages.
pub mod bridge;

/// `ISequencerInbox.sol` L1 contract bindings, where sequencer batches are posted.
pub mod sequencer_inbox;

/// `IInbox.sol` L1 contract bindings, where aggregators post their batches.
pub mod inbox;
