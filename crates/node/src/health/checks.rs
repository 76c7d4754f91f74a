use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use keel_clients::engine::ExecutionCore;
use keel_primitives::SyncState;

use super::{HealthCheck, HealthError, HealthRegistry};
use crate::{batcher::TransactionBatcher, inbox_reader::L1Source};

/// A startup stage tracked by [`NodeInitialization`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStage {
    /// The inbox reader caught up with L1 and its loop is running.
    InboxReader,
    /// The batcher loop is running.
    Batcher,
}

/// Healthy once every startup stage completed.
#[derive(Debug, Default)]
pub struct NodeInitialization {
    inbox_reader: AtomicBool,
    batcher: AtomicBool,
}

impl NodeInitialization {
    /// Record that a stage completed.
    pub fn mark(&self, stage: InitStage) {
        match stage {
            InitStage::InboxReader => self.inbox_reader.store(true, Ordering::Release),
            InitStage::Batcher => self.batcher.store(true, Ordering::Release),
        }
    }
}

#[async_trait]
impl HealthCheck for NodeInitialization {
    fn name(&self) -> &'static str {
        "node_initialization"
    }

    async fn check(&self) -> Result<(), HealthError> {
        if !self.inbox_reader.load(Ordering::Acquire) {
            return Err(HealthError::Unhealthy("inbox reader not started".to_owned()));
        }
        if !self.batcher.load(Ordering::Acquire) {
            return Err(HealthError::Unhealthy("batcher not started".to_owned()));
        }
        Ok(())
    }
}

/// Returns an error if `behind` exceeds `max`.
fn within(what: &str, behind: u64, max: u64) -> Result<(), HealthError> {
    if behind > max {
        return Err(HealthError::Unhealthy(format!("{what} behind by {behind}, max {max}")));
    }
    Ok(())
}

/// L1 is reachable and the inbox reader keeps up with its confirmed head.
#[derive(Debug)]
pub struct L1Check {
    source: Arc<dyn L1Source>,
    sync: Arc<SyncState>,
    confirmations: u64,
    max_block_diff: u64,
}

impl L1Check {
    /// Creates a new instance of [`L1Check`].
    pub fn new(
        source: Arc<dyn L1Source>,
        sync: Arc<SyncState>,
        confirmations: u64,
        max_block_diff: u64,
    ) -> Self {
        Self { source, sync, confirmations, max_block_diff }
    }
}

#[async_trait]
impl HealthCheck for L1Check {
    fn name(&self) -> &'static str {
        "l1"
    }

    async fn check(&self) -> Result<(), HealthError> {
        let head = self
            .source
            .head()
            .await
            .map_err(|e| HealthError::Unhealthy(format!("L1 unreachable: {e}")))?;

        let safe_head = head.saturating_sub(self.confirmations);
        within("inbox reader", safe_head.saturating_sub(self.sync.l1_processed_block()), self.max_block_diff)
    }
}

/// The batcher mode is able to serve transactions.
#[derive(Debug)]
pub struct BatcherCheck(pub Arc<dyn TransactionBatcher>);

#[async_trait]
impl HealthCheck for BatcherCheck {
    fn name(&self) -> &'static str {
        "batcher"
    }

    async fn check(&self) -> Result<(), HealthError> {
        self.0.health_check().await
    }
}

/// Every liveness check passed on its last evaluation.
#[derive(Debug)]
pub struct LivenessCheck(pub HealthRegistry);

#[async_trait]
impl HealthCheck for LivenessCheck {
    fn name(&self) -> &'static str {
        "liveness"
    }

    async fn check(&self) -> Result<(), HealthError> {
        let report = self.0.report();
        if report.is_healthy() {
            return Ok(());
        }
        Err(HealthError::Unhealthy(format!("failing: {}", report.failing().join(", "))))
    }
}

/// The inbox reader read every sequencer message confirmed on L1.
#[derive(Debug)]
pub struct InboxSyncCheck {
    source: Arc<dyn L1Source>,
    sync: Arc<SyncState>,
    max_diff: u64,
}

impl InboxSyncCheck {
    /// Creates a new instance of [`InboxSyncCheck`].
    pub fn new(source: Arc<dyn L1Source>, sync: Arc<SyncState>, max_diff: u64) -> Self {
        Self { source, sync, max_diff }
    }
}

#[async_trait]
impl HealthCheck for InboxSyncCheck {
    fn name(&self) -> &'static str {
        "inbox_sync"
    }

    async fn check(&self) -> Result<(), HealthError> {
        let count = self
            .source
            .message_count()
            .await
            .map_err(|e| HealthError::Unhealthy(format!("failed to read message count: {e}")))?;

        within("inbox", count.saturating_sub(self.sync.inbox_messages_read()), self.max_diff)
    }
}

/// The engine executed the messages read from L1. Also refreshes the engine counters of the
/// [`SyncState`].
#[derive(Debug)]
pub struct MessagesSyncCheck {
    core: Arc<dyn ExecutionCore>,
    sync: Arc<SyncState>,
    max_diff: u64,
}

impl MessagesSyncCheck {
    /// Creates a new instance of [`MessagesSyncCheck`].
    pub fn new(core: Arc<dyn ExecutionCore>, sync: Arc<SyncState>, max_diff: u64) -> Self {
        Self { core, sync, max_diff }
    }
}

#[async_trait]
impl HealthCheck for MessagesSyncCheck {
    fn name(&self) -> &'static str {
        "messages_sync"
    }

    async fn check(&self) -> Result<(), HealthError> {
        let status = self
            .core
            .status()
            .await
            .map_err(|e| HealthError::Unhealthy(format!("execution engine unreachable: {e}")))?;

        self.sync.update_messages_executed(status.message_count);
        self.sync.update_logs_processed(status.logs_processed);
        self.sync.update_l2_block(status.l2_block);

        let read = self.sync.inbox_messages_read();
        within("execution", read.saturating_sub(status.message_count), self.max_diff)
    }
}

/// The logs of executed messages are processed.
#[derive(Debug)]
pub struct LogsProcessedCheck {
    sync: Arc<SyncState>,
    max_diff: u64,
}

impl LogsProcessedCheck {
    /// Creates a new instance of [`LogsProcessedCheck`].
    pub const fn new(sync: Arc<SyncState>, max_diff: u64) -> Self {
        Self { sync, max_diff }
    }
}

#[async_trait]
impl HealthCheck for LogsProcessedCheck {
    fn name(&self) -> &'static str {
        "logs_processed"
    }

    async fn check(&self) -> Result<(), HealthError> {
        let behind = self.sync.messages_executed().saturating_sub(self.sync.logs_processed());
        within("log processing", behind, self.max_diff)
    }
}

/// The engine keeps up with the broadcast feed.
#[derive(Debug)]
pub struct FeedLagCheck {
    sync: Arc<SyncState>,
    max_lag: u64,
}

impl FeedLagCheck {
    /// Creates a new instance of [`FeedLagCheck`].
    pub const fn new(sync: Arc<SyncState>, max_lag: u64) -> Self {
        Self { sync, max_lag }
    }
}

#[async_trait]
impl HealthCheck for FeedLagCheck {
    fn name(&self) -> &'static str {
        "feed_lag"
    }

    async fn check(&self) -> Result<(), HealthError> {
        let lag = self.sync.feed_sequence().saturating_sub(self.sync.messages_executed());
        within("execution vs feed", lag, self.max_lag)
    }
}

/// The delayed messages read from L1 are sequenced in time.
#[derive(Debug)]
pub struct DelayedBacklogCheck {
    sync: Arc<SyncState>,
    max_backlog: u64,
}

impl DelayedBacklogCheck {
    /// Creates a new instance of [`DelayedBacklogCheck`].
    pub const fn new(sync: Arc<SyncState>, max_backlog: u64) -> Self {
        Self { sync, max_backlog }
    }
}

#[async_trait]
impl HealthCheck for DelayedBacklogCheck {
    fn name(&self) -> &'static str {
        "delayed_backlog"
    }

    async fn check(&self) -> Result<(), HealthError> {
        within("delayed sequencing", self.sync.delayed_backlog(), self.max_backlog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockCore, MockL1Source};

    #[tokio::test]
    async fn initialization_requires_every_stage() {
        let init = NodeInitialization::default();
        assert!(init.check().await.is_err());

        init.mark(InitStage::InboxReader);
        let err = init.check().await.unwrap_err();
        assert_eq!(err, HealthError::Unhealthy("batcher not started".to_owned()));

        init.mark(InitStage::Batcher);
        assert!(init.check().await.is_ok());
    }

    #[tokio::test]
    async fn l1_check_accounts_for_confirmations() {
        let source = MockL1Source::new(120);
        let sync = Arc::new(SyncState::new());
        let check = L1Check::new(Arc::new(source.clone()), Arc::clone(&sync), 10, 50);

        sync.update_l1_processed_block(60);
        assert!(check.check().await.is_ok());

        sync.update_l1_processed_block(59);
        // Monotonic: lower values are ignored.
        assert!(check.check().await.is_ok());

        source.set_head(200);
        assert!(check.check().await.is_err());

        source.fail_next(1);
        let err = check.check().await.unwrap_err();
        assert!(err.to_string().contains("L1 unreachable"));
    }

    #[tokio::test]
    async fn sync_checks_follow_the_engine() {
        let core = MockCore::new();
        let sync = Arc::new(SyncState::new());
        let messages = MessagesSyncCheck::new(Arc::new(core.clone()), Arc::clone(&sync), 5);
        let logs = LogsProcessedCheck::new(Arc::clone(&sync), 5);
        let feed = FeedLagCheck::new(Arc::clone(&sync), 5);

        sync.update_inbox_messages_read(10);
        assert!(messages.check().await.is_err());

        core.set_status(|status| {
            status.message_count = 8;
            status.logs_processed = 2;
        });
        assert!(messages.check().await.is_ok());
        assert_eq!(sync.messages_executed(), 8);
        assert!(logs.check().await.is_err());

        sync.update_feed_sequence(13);
        assert!(feed.check().await.is_ok());
        sync.update_feed_sequence(14);
        assert!(feed.check().await.is_err());
    }

    #[tokio::test]
    async fn delayed_backlog_is_bounded() {
        let sync = Arc::new(SyncState::new());
        let check = DelayedBacklogCheck::new(Arc::clone(&sync), 3);

        sync.update_delayed_read(5);
        sync.update_delayed_sequenced(1);
        assert!(check.check().await.is_err());

        sync.update_delayed_sequenced(2);
        assert!(check.check().await.is_ok());
    }
}
