use std::sync::Arc;

use keel_clients::engine::ExecutionCore;
use keel_primitives::SyncState;
use tokio::sync::mpsc;

use crate::{NodeError, config::RuntimeConfig, inbox_reader::DelayedMessageLog};

/// Handles shared by every stage of the pipeline.
///
/// Cheap to clone: every field is either reference counted or a channel handle.
#[derive(Debug, Clone)]
pub(crate) struct NodeContext {
    /// Node runtime configuration.
    pub(crate) cfg: RuntimeConfig,
    /// Progress counters, written by the stage owning each of them.
    pub(crate) sync: Arc<SyncState>,
    /// Delayed messages read from L1 and not sequenced yet.
    pub(crate) delayed: DelayedMessageLog,
    /// The execution engine.
    pub(crate) core: Arc<dyn ExecutionCore>,
    /// Fatal errors raised by detached tasks. Any message shuts the node down.
    pub(crate) errors: mpsc::UnboundedSender<NodeError>,
}

impl NodeContext {
    /// Creates a new context. Returns the receiving half of the root error channel.
    pub(crate) fn new(
        cfg: RuntimeConfig,
        core: Arc<dyn ExecutionCore>,
    ) -> (Self, mpsc::UnboundedReceiver<NodeError>) {
        let (errors, errors_rx) = mpsc::unbounded_channel();
        let ctx = Self {
            cfg,
            sync: Arc::new(SyncState::new()),
            delayed: DelayedMessageLog::default(),
            core,
            errors,
        };
        (ctx, errors_rx)
    }

    /// Report a fatal error to the root event loop.
    pub(crate) fn report_fatal(&self, err: NodeError) {
        // The receiver only goes away once the node is already shutting down.
        let _ = self.errors.send(err);
    }
}
