use std::{sync::Arc, time::Duration};

use alloy_primitives::Address;
use keel_clients::{
    engine::{ExecutionCore, RpcExecutionCore},
    execution::ExecutionClient,
    feed::FeedClient,
    forwarder::ForwarderClient,
    lock::{DEFAULT_LOCK_KEY, LockError, RedisLockService},
};
use keel_config::{ConfigError, NodeType, Opts};
use keel_primitives::{
    retries::{Cancelled, STARTUP_RETRY_DELAY, retry_until_success},
    summary::Summary,
    task::{CriticalTasks, TaskOutcome},
    wei_to_eth,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    batcher::{
        Aggregator, AlwaysOpen, BatchPoster, Batcher, BatcherHandle, ContractSubmitter, Forwarder,
        PendingQueue, Sequencer, SubmissionError, SubmissionGate, TransactionBatcher,
    },
    config::RuntimeConfig,
    context::NodeContext,
    health::{
        self, BatcherCheck, DelayedBacklogCheck, FeedLagCheck, HealthCheck, HealthRegistry,
        InboxSyncCheck, InitStage, L1Check, LivenessCheck, LogsProcessedCheck,
        MessagesSyncCheck, NodeInitialization,
    },
    inbox_reader::{ContractL1Source, InboxReader, InboxReaderError, L1Source},
    lockout::{LeaseClock, Lockout, RpcRelay},
    metrics::NodeMetrics,
};

/// How long workers are given to stop once the node exits.
const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(20);

/// The terminal errors of the node. Any of them stops every worker.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Batch submission failed: {0}")]
    Submission(#[from] SubmissionError),
    #[error("Inbox reader error: {0}")]
    InboxReader(#[from] InboxReaderError),
    #[error("Lock service error: {0}")]
    Lock(#[from] LockError),
    #[error("Health server error: {0}")]
    HealthServer(#[from] std::io::Error),
    #[error("Startup interrupted by shutdown")]
    Interrupted(#[from] Cancelled),
    #[error("Critical task {name} exited: {reason}")]
    TaskFailed { name: String, reason: String },
}

/// The submission mode, before its startup work is done.
enum BatcherPlan {
    /// Modes that can serve as soon as they are built.
    Ready(Batcher),
    /// Sequencers still need to catch up with the engine and drain the delayed backlog.
    Sequencer { poster: BatchPoster, clock: Option<LeaseClock> },
}

/// The Keel node.
///
/// The node owns every long-running worker:
/// - the inbox reader, following the rollup contracts on L1
/// - the batcher, in the submission mode selected by the configuration
/// - the health registries and their HTTP server
#[derive(Debug)]
pub struct Node {
    /// Handles shared with the workers.
    ctx: NodeContext,
    /// Fatal errors reported by detached tasks.
    errors: mpsc::UnboundedReceiver<NodeError>,
    /// Long-running tasks manager
    tasks: CriticalTasks<NodeError>,
    /// The read-only view of L1 shared by the reader and the health checks.
    source: Arc<dyn L1Source>,
    init: Arc<NodeInitialization>,
    liveness: HealthRegistry,
    readiness: HealthRegistry,
    /// The sync checks, awaited before serving.
    catch_up: HealthRegistry,
    /// Installs the batcher once it is ready to serve.
    installer: watch::Sender<Option<Arc<dyn TransactionBatcher>>>,
    handle: BatcherHandle,
}

impl Node {
    /// Create a new [`Node`] from the CLI options. Fails if the options are inconsistent.
    pub fn new(opts: Opts) -> Result<Self, NodeError> {
        let cfg = RuntimeConfig::new(opts.validate()?);
        info!("{}", cfg.summary());

        let source: Arc<dyn L1Source> = Arc::new(ContractL1Source::new(
            cfg.l1.url.clone(),
            cfg.rollup.bridge,
            cfg.rollup.sequencer_inbox,
        ));
        let core: Arc<dyn ExecutionCore> = Arc::new(RpcExecutionCore::new(cfg.node.core_url.clone()));
        let (ctx, errors) = NodeContext::new(cfg, core);
        let (installer, handle) = BatcherHandle::new();

        Ok(Self {
            ctx,
            errors,
            tasks: CriticalTasks::new(),
            source,
            init: Arc::default(),
            liveness: HealthRegistry::new("liveness"),
            readiness: HealthRegistry::new("readiness"),
            catch_up: HealthRegistry::new("catch_up"),
            installer,
            handle,
        })
    }

    /// A handle to submit transactions to the node. Transactions are refused until the
    /// batcher is started.
    pub fn batcher_handle(&self) -> BatcherHandle {
        self.handle.clone()
    }

    /// Start every worker and run until cancellation or the first fatal error.
    ///
    /// Cancellation during startup is a clean exit. Workers are stopped before returning in
    /// every case.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), NodeError> {
        let workers = cancel.child_token();

        let res = match self.start(&workers).await {
            Ok(()) => watch_workers(&workers, &mut self.errors, &mut self.tasks).await,
            Err(NodeError::Interrupted(_)) => {
                info!("Shutdown requested during startup");
                Ok(())
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &res {
            error!(error = %e, "💀 Node stopped");
        }

        workers.cancel();
        self.tasks.join_all(WORKER_SHUTDOWN_TIMEOUT).await;
        res
    }

    async fn start(&mut self, cancel: &CancellationToken) -> Result<(), NodeError> {
        NodeMetrics::set_keel_version(env!("CARGO_PKG_VERSION").to_owned());

        // 1. Health checks and their server
        self.register_checks();
        self.spawn_health(cancel);

        // 2. Broadcast feed, connecting in the background
        let cfg = self.ctx.cfg.clone();
        let feed = (!cfg.feed.urls.is_empty())
            .then(|| FeedClient::new(cfg.feed.urls.clone(), cfg.feed.timeout()).subscribe(cancel.clone()));

        // 3. Inbox reader
        let mut reader = start_inbox_reader(&self.ctx, Arc::clone(&self.source), cancel).await?;
        if let Some(feed) = feed {
            reader = reader.with_feed(feed);
        }
        self.tasks.add_task(reader.run(cancel.clone()), "Inbox reader");
        self.init.mark(InitStage::InboxReader);

        // 4. Submission mode
        let plan = self.build_batcher(cancel).await?;

        // 5. Catch up before serving
        if cfg.node.wait_to_catch_up {
            info!("Waiting for the node to catch up with L1 before serving");
            health::wait_until_synced(&self.catch_up, cancel).await?;
            info!(sync = %self.ctx.sync.snapshot().summary(), "Caught up");
        }

        // 6. Startup work of the submission mode
        let batcher = self.setup_batcher(plan, cancel).await?;

        // 7. Serve
        self.liveness.register(Arc::new(BatcherCheck(Arc::clone(&batcher))));
        self.installer.send_replace(Some(Arc::clone(&batcher)));

        let token = cancel.clone();
        self.tasks.add_task(
            async move { batcher.run(token).await.map_err(NodeError::from) },
            "Batcher",
        );
        self.init.mark(InitStage::Batcher);

        info!(node_type = ?cfg.node.node_type, "✅ Node started");
        Ok(())
    }

    fn register_checks(&self) {
        let cfg = &self.ctx.cfg;
        let sync = &self.ctx.sync;

        self.liveness.register(Arc::clone(&self.init) as Arc<dyn HealthCheck>);
        self.liveness.register(Arc::new(L1Check::new(
            Arc::clone(&self.source),
            Arc::clone(sync),
            cfg.l1.confirmations,
            cfg.health.max_l1_block_diff,
        )));

        // Catching up only depends on the sync checks: liveness needs the batcher running.
        let mut sync_checks: Vec<Arc<dyn HealthCheck>> = vec![
            Arc::new(InboxSyncCheck::new(
                Arc::clone(&self.source),
                Arc::clone(sync),
                cfg.health.max_inbox_sync_diff,
            )),
            Arc::new(MessagesSyncCheck::new(
                Arc::clone(&self.ctx.core),
                Arc::clone(sync),
                cfg.health.max_messages_sync_diff,
            )),
            Arc::new(LogsProcessedCheck::new(
                Arc::clone(sync),
                cfg.health.max_logs_processed_sync_diff,
            )),
        ];
        if !cfg.feed.urls.is_empty() {
            sync_checks.push(Arc::new(FeedLagCheck::new(Arc::clone(sync), cfg.health.max_feed_lag)));
        }

        self.readiness.register(Arc::new(LivenessCheck(self.liveness.clone())));
        for check in sync_checks {
            self.catch_up.register(Arc::clone(&check));
            self.readiness.register(check);
        }
        self.readiness.register(Arc::new(DelayedBacklogCheck::new(
            Arc::clone(sync),
            cfg.health.max_delayed_backlog,
        )));
    }

    fn spawn_health(&mut self, cancel: &CancellationToken) {
        let interval = self.ctx.cfg.health.interval();

        for registry in [self.liveness.clone(), self.readiness.clone()] {
            let name = format!("Health registry ({})", registry.name());
            let token = cancel.clone();
            self.tasks.add_task(
                async move {
                    registry.run(interval, token).await;
                    Ok(())
                },
                &name,
            );
        }

        let router = health::router(self.liveness.clone(), self.readiness.clone());
        let server = health::serve(self.ctx.cfg.health.addr, router, cancel.clone());
        self.tasks.add_task(async move { server.await.map_err(NodeError::from) }, "Health server");
    }

    /// Build the submission mode. Submitting modes wait for the operator to be funded.
    async fn build_batcher(&self, cancel: &CancellationToken) -> Result<BatcherPlan, NodeError> {
        let cfg = &self.ctx.cfg;
        let settings = cfg.poster_settings();

        match cfg.node.node_type {
            NodeType::Forwarder => {
                let target =
                    cfg.node.forwarder.target.clone().ok_or(ConfigError::MissingForwarderTarget)?;
                info!(%target, "Forwarding transactions");

                let forwarder = Forwarder::new(
                    ForwarderClient::new(target),
                    Arc::clone(&self.ctx.core),
                    cfg.batcher.max_tx_size,
                    cfg.health.max_l2_block_diff,
                );
                Ok(BatcherPlan::Ready(Batcher::Forwarder(forwarder)))
            }
            NodeType::Aggregator => {
                let inbox =
                    cfg.rollup.aggregator_inbox.ok_or(ConfigError::MissingAggregatorInbox)?;
                let wallet =
                    cfg.operator.private_key.clone().ok_or(ConfigError::MissingOperatorKey(NodeType::Aggregator))?;
                self.wait_for_balance(wallet.address(), cancel).await?;

                let submitter = ContractSubmitter::aggregator(
                    cfg.l1.url.clone(),
                    inbox,
                    wallet,
                    settings.max_gas_price_wei,
                );
                let poster = BatchPoster::new(Arc::new(submitter), Arc::new(AlwaysOpen), settings);
                let aggregator = Aggregator::new(&self.ctx, poster);

                Ok(BatcherPlan::Ready(if cfg.node.aggregator.stateful {
                    Batcher::StatefulAggregator(aggregator)
                } else {
                    Batcher::StatelessAggregator(aggregator)
                }))
            }
            NodeType::Sequencer => {
                let wallet =
                    cfg.operator.private_key.clone().ok_or(ConfigError::MissingOperatorKey(NodeType::Sequencer))?;
                self.wait_for_balance(wallet.address(), cancel).await?;

                let clock = cfg
                    .node
                    .lockout
                    .is_enabled()
                    .then(|| LeaseClock::new(cfg.node.lockout.ttl(), cfg.lease_safety_margin()));
                let gate: Arc<dyn SubmissionGate> = match &clock {
                    Some(clock) => Arc::new(clock.clone()),
                    None => Arc::new(AlwaysOpen),
                };

                let submitter = ContractSubmitter::sequencer(
                    cfg.l1.url.clone(),
                    cfg.rollup.sequencer_inbox,
                    wallet,
                    settings.max_gas_price_wei,
                );
                let poster = BatchPoster::new(Arc::new(submitter), gate, settings);

                Ok(BatcherPlan::Sequencer { poster, clock })
            }
        }
    }

    /// Wait until the operator holds at least the configured minimum balance.
    async fn wait_for_balance(&self, operator: Address, cancel: &CancellationToken) -> Result<(), Cancelled> {
        let l1 = ExecutionClient::new(self.ctx.cfg.l1.url.clone());
        let min = self.ctx.cfg.operator.min_eth_balance;

        let balance = retry_until_success(cancel, STARTUP_RETRY_DELAY, "Operator balance check", || {
            let l1 = l1.clone();
            async move {
                let balance = l1.balance(operator).await.map_err(|e| e.to_string())?;
                NodeMetrics::set_wallet_balance(wei_to_eth(balance));

                if balance < min {
                    return Err(format!(
                        "operator balance of {:.4} ETH is below the minimum of {:.4} ETH",
                        wei_to_eth(balance),
                        wei_to_eth(min)
                    ));
                }
                Ok(balance)
            }
        })
        .await?;

        info!(%operator, balance = wei_to_eth(balance), "Operator balance verified");
        Ok(())
    }

    /// Finish the startup work of the submission mode.
    ///
    /// A sequencer behind a lockout drains the delayed backlog whenever it acquires the lease.
    /// A plain sequencer drains the confirmed backlog right away.
    async fn setup_batcher(
        &self,
        plan: BatcherPlan,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn TransactionBatcher>, NodeError> {
        let (poster, clock) = match plan {
            BatcherPlan::Ready(batcher) => return Ok(Arc::new(batcher)),
            BatcherPlan::Sequencer { poster, clock } => (poster, clock),
        };

        let cfg = &self.ctx.cfg;
        let queue = Arc::new(PendingQueue::new(cfg.batcher.queue_capacity, cfg.batcher.max_tx_size));

        let ctx = &self.ctx;
        let sequencer = retry_until_success(cancel, STARTUP_RETRY_DELAY, "Sequencer setup", || {
            Sequencer::new(ctx, poster.clone(), Arc::clone(&queue))
        })
        .await?;

        let Some(clock) = clock else {
            let seq = &sequencer;
            let drained =
                retry_until_success(cancel, STARTUP_RETRY_DELAY, "Delayed messages sequencing", move || async move {
                    match seq.sequence_delayed_messages(cancel, false).await {
                        // Fatal errors are not retried.
                        Err(e) if e.is_fatal() => Ok(Err(e)),
                        res => res.map(Ok),
                    }
                })
                .await??;

            info!(drained, "Delayed backlog sequenced");
            return Ok(Arc::new(Batcher::Sequencer(Arc::new(sequencer))));
        };

        let lockout_opts = &cfg.node.lockout;
        let (Some(redis), Some(identity)) = (&lockout_opts.redis, &lockout_opts.self_rpc_url) else {
            return Err(ConfigError::IncompleteLockout.into());
        };

        let lock = retry_until_success(cancel, STARTUP_RETRY_DELAY, "Lock service connection", || {
            RedisLockService::connect(redis, DEFAULT_LOCK_KEY)
        })
        .await?;
        info!(%identity, "🔒 Connected to the lock service");

        let lockout = Lockout::new(
            &self.ctx,
            Arc::new(sequencer),
            Arc::new(lock),
            Arc::new(RpcRelay::default()),
            clock,
            identity.to_string(),
        );
        Ok(Arc::new(lockout))
    }
}

/// Construct the inbox reader and catch up with L1, retrying until it succeeds.
async fn start_inbox_reader(
    ctx: &NodeContext,
    source: Arc<dyn L1Source>,
    cancel: &CancellationToken,
) -> Result<InboxReader, Cancelled> {
    retry_until_success(cancel, STARTUP_RETRY_DELAY, "Inbox reader startup", || {
        let source = Arc::clone(&source);
        async move {
            let mut reader = InboxReader::new(ctx, source);
            reader.start(ctx).await?;
            Ok::<_, InboxReaderError>(reader)
        }
    })
    .await
}

/// Wait for the first terminal event: cancellation, a fatal error reported by a task or a
/// critical task exiting.
async fn watch_workers(
    cancel: &CancellationToken,
    errors: &mut mpsc::UnboundedReceiver<NodeError>,
    tasks: &mut CriticalTasks<NodeError>,
) -> Result<(), NodeError> {
    info!("🤠 Starting node event loop");

    tokio::select! {
        biased;

        () = cancel.cancelled() => {
            info!("Shutdown requested, stopping workers");
            Ok(())
        }

        Some(err) = errors.recv() => Err(err),

        Some(task_res) = &mut *tasks => {
            let name = task_res.name().to_owned();
            let reason = task_res.error_message();
            match task_res.into_outcome() {
                TaskOutcome::Failed(err) => Err(err),
                TaskOutcome::Completed => {
                    Err(NodeError::TaskFailed { name, reason: "exited unexpectedly".to_owned() })
                }
                TaskOutcome::Crashed(_) => Err(NodeError::TaskFailed { name, reason }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::testing::{MockCore, MockL1Source, delayed_message, test_context};

    #[tokio::test(start_paused = true)]
    async fn inbox_reader_startup_survives_failures() {
        let source = MockL1Source::new(10);
        source.add_delayed(delayed_message(0, 5));
        source.fail_next(3);

        let (ctx, _errors) = test_context(&[], MockCore::new());
        let start = Instant::now();
        let reader = start_inbox_reader(&ctx, Arc::new(source), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reader.next_block(), 11);
        assert_eq!(ctx.delayed.next_index(), 1);
        assert!(start.elapsed() >= STARTUP_RETRY_DELAY * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn inbox_reader_startup_stops_on_cancellation() {
        let source = MockL1Source::new(10);
        source.fail_next(100);

        let (ctx, _errors) = test_context(&[], MockCore::new());
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            canceller.cancel();
        });

        let res = start_inbox_reader(&ctx, Arc::new(source), &cancel).await;
        assert!(matches!(res, Err(Cancelled)));
    }

    #[tokio::test]
    async fn reported_errors_stop_the_node() {
        let (ctx, mut errors) = test_context(&[], MockCore::new());
        let mut tasks = CriticalTasks::<NodeError>::new();
        tasks.add_task(std::future::pending(), "forever");

        ctx.report_fatal(NodeError::Submission(SubmissionError::TooManyReverts(3)));
        let err = watch_workers(&CancellationToken::new(), &mut errors, &mut tasks).await.unwrap_err();
        assert!(matches!(err, NodeError::Submission(SubmissionError::TooManyReverts(3))));
    }

    #[tokio::test]
    async fn exited_tasks_stop_the_node() {
        let (_ctx, mut errors) = test_context(&[], MockCore::new());
        let mut tasks = CriticalTasks::<NodeError>::new();
        tasks.add_task(async { Ok(()) }, "Inbox reader");

        let err = watch_workers(&CancellationToken::new(), &mut errors, &mut tasks).await.unwrap_err();
        assert!(matches!(err, NodeError::TaskFailed { ref name, .. } if name == "Inbox reader"));
    }

    #[tokio::test]
    async fn cancellation_is_a_clean_exit() {
        let (_ctx, mut errors) = test_context(&[], MockCore::new());
        let mut tasks = CriticalTasks::<NodeError>::new();
        tasks.add_task(std::future::pending(), "forever");

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(watch_workers(&cancel, &mut errors, &mut tasks).await.is_ok());
    }
}
