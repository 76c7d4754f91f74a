use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use derive_more::derive::Display;
use keel_clients::{forwarder::ForwarderClient, lock::LockService};
use keel_primitives::{Transaction, time::percent_of};
use rand::Rng;
use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    batcher::{AcceptError, Sequencer, SubmissionError, TransactionBatcher},
    context::NodeContext,
    health::HealthError,
    metrics::NodeMetrics,
};

mod lease;
pub use lease::LeaseClock;

/// The share of the acquire interval added as random jitter between acquisition attempts.
const ACQUIRE_JITTER_PERCENT: u32 = 10;

/// The leader election state of a sequencer replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LockoutState {
    /// Not trying to hold the lease.
    #[display("unleased")]
    Unleased,
    /// Waiting for the lease, another replica may hold it.
    #[display("acquiring")]
    Acquiring,
    /// Holding the lease and sequencing.
    #[display("leased")]
    Leased,
    /// Holding the lease, a renewal is in progress.
    #[display("renewing")]
    Renewing,
    /// Shutting down, the lease is being released.
    #[display("releasing")]
    Releasing,
    /// The lease was lost. Submission stopped.
    #[display("expired")]
    Expired,
}

impl LockoutState {
    /// Every state, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Unleased,
        Self::Acquiring,
        Self::Leased,
        Self::Renewing,
        Self::Releasing,
        Self::Expired,
    ];
}

/// Hands transactions over to the replica holding the lease.
#[async_trait]
pub trait TxRelay: Debug + Send + Sync {
    /// Forward `tx` to the replica with identity `target`.
    async fn relay(&self, target: &str, tx: &Transaction) -> Result<(), AcceptError>;
}

/// A [`TxRelay`] over JSON-RPC. Replica identities are their RPC URLs.
#[derive(Debug, Default)]
pub struct RpcRelay {
    clients: Mutex<HashMap<String, Arc<ForwarderClient>>>,
}

impl RpcRelay {
    fn client(&self, target: &str) -> Result<Arc<ForwarderClient>, AcceptError> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(target) {
            return Ok(Arc::clone(client));
        }

        let url = Url::parse(target).map_err(|e| {
            warn!(target, error = %e, "Lease holder identity is not a valid URL");
            AcceptError::NotLeader
        })?;
        let client = Arc::new(ForwarderClient::new(url));
        clients.insert(target.to_owned(), Arc::clone(&client));
        Ok(client)
    }
}

#[async_trait]
impl TxRelay for RpcRelay {
    async fn relay(&self, target: &str, tx: &Transaction) -> Result<(), AcceptError> {
        let client = self.client(target)?;
        client.send_raw_transaction(&tx.payload).await?;
        Ok(())
    }
}

/// How a leadership term ended.
#[derive(Debug)]
enum TermEnd {
    /// The node is shutting down.
    Shutdown,
    /// The lease could not be renewed.
    Lost,
    /// The sequencer stopped on its own.
    Stopped(Result<Result<(), SubmissionError>, JoinError>),
}

/// Wraps a [`Sequencer`] so that only the replica holding the shared lease submits batches.
///
/// While leased, transactions are sequenced locally. Otherwise they are relayed to the
/// current holder. Losing the lease closes the submission gate at once; the sequencer is then
/// stopped and awaited, so that a batch already broadcast is waited for but never resubmitted.
#[derive(Debug)]
pub struct Lockout {
    sequencer: Arc<Sequencer>,
    lock: Arc<dyn LockService>,
    relay: Arc<dyn TxRelay>,
    identity: String,
    clock: LeaseClock,
    state: watch::Sender<LockoutState>,
    /// Set once the delayed backlog of the current term has been sequenced.
    serving: Arc<AtomicBool>,
    ttl: Duration,
    renew_interval: Duration,
    acquire_interval: Duration,
}

impl Lockout {
    /// Creates a new instance of [`Lockout`]. `clock` must be the gate of the sequencer's
    /// batch poster.
    pub(crate) fn new(
        ctx: &NodeContext,
        sequencer: Arc<Sequencer>,
        lock: Arc<dyn LockService>,
        relay: Arc<dyn TxRelay>,
        clock: LeaseClock,
        identity: String,
    ) -> Self {
        let opts = &ctx.cfg.node.lockout;
        let (state, _) = watch::channel(LockoutState::Unleased);

        Self {
            sequencer,
            lock,
            relay,
            identity,
            clock,
            state,
            serving: Arc::default(),
            ttl: opts.ttl(),
            renew_interval: opts.renew_interval(),
            acquire_interval: opts.acquire_interval(),
        }
    }

    /// The current state.
    pub fn state(&self) -> LockoutState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<LockoutState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: LockoutState) {
        let prev = self.state.send_replace(state);
        if prev != state {
            debug!(identity = self.identity, %prev, %state, "Lockout state changed");
        }
        NodeMetrics::set_lockout_state(state);
    }

    /// Campaign for the lease and sequence while holding it, until cancellation.
    async fn run_terms(&self, cancel: CancellationToken) -> Result<(), SubmissionError> {
        info!(identity = self.identity, ttl = ?self.ttl, "🤠 Starting lockout loop");

        loop {
            self.set_state(LockoutState::Acquiring);
            if !self.acquire(&cancel).await {
                self.set_state(LockoutState::Unleased);
                return Ok(());
            }

            info!(identity = self.identity, "🔒 Lease acquired, sequencing");
            self.set_state(LockoutState::Leased);
            NodeMetrics::increment_lease_acquisitions();

            let term = cancel.child_token();
            let mut worker = tokio::spawn(lead(
                Arc::clone(&self.sequencer),
                Arc::clone(&self.serving),
                term.clone(),
            ));

            let end = self.hold(&cancel, &mut worker).await;
            let shutdown = matches!(end, TermEnd::Shutdown);
            if shutdown {
                self.set_state(LockoutState::Releasing);
            } else {
                // Close the gate before anything else.
                self.clock.invalidate();
                self.set_state(LockoutState::Expired);
                NodeMetrics::increment_lease_losses();
                warn!(identity = self.identity, "⛔ Lease lost, submission stopped");
            }

            term.cancel();
            let result = match end {
                TermEnd::Stopped(result) => result,
                TermEnd::Shutdown | TermEnd::Lost => worker.await,
            };
            self.serving.store(false, Ordering::Release);
            self.clock.invalidate();

            let result = result.unwrap_or_else(|e| Err(SubmissionError::Worker(e.to_string())));
            if let Err(e) = result {
                error!(error = %e, "Sequencer stopped with a fatal error");
                self.release().await;
                self.set_state(LockoutState::Unleased);
                return Err(e);
            }

            if shutdown {
                self.release().await;
                self.set_state(LockoutState::Unleased);
                return Ok(());
            }

            self.handoff_pending().await;
        }
    }

    /// Try to acquire the lease until success. Returns `false` on cancellation.
    async fn acquire(&self, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }

            let started = Instant::now();
            match self.lock.acquire(&self.identity, self.ttl).await {
                Ok(true) => {
                    self.clock.record_renewal(started);
                    return true;
                }
                Ok(false) => debug!(identity = self.identity, "Lease held by another replica"),
                Err(e) => warn!(error = %e, "Failed to acquire lease"),
            }

            self.handoff_pending().await;

            let jitter = percent_of(self.acquire_interval, ACQUIRE_JITTER_PERCENT);
            let jitter = rand::rng().random_range(Duration::ZERO..=jitter);
            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(self.acquire_interval + jitter) => {}
            }
        }
    }

    /// Renew the lease periodically until it is lost, the sequencer stops, or cancellation.
    async fn hold(
        &self,
        cancel: &CancellationToken,
        worker: &mut JoinHandle<Result<(), SubmissionError>>,
    ) -> TermEnd {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.renew_interval, self.renew_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => return TermEnd::Shutdown,
                result = &mut *worker => return TermEnd::Stopped(result),
                _ = ticker.tick() => {
                    if !self.renew().await {
                        return TermEnd::Lost;
                    }
                }
            }
        }
    }

    /// Renew the lease once. A renewal slower than the renewal interval counts as a failure.
    async fn renew(&self) -> bool {
        self.set_state(LockoutState::Renewing);
        let started = Instant::now();

        let renewed = tokio::time::timeout(
            self.renew_interval,
            self.lock.renew(&self.identity, self.ttl),
        )
        .await;

        match renewed {
            Ok(Ok(true)) => {
                self.clock.record_renewal(started);
                self.set_state(LockoutState::Leased);
                true
            }
            Ok(Ok(false)) => {
                warn!(identity = self.identity, "Lease taken over by another replica");
                false
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to renew lease");
                false
            }
            Err(_) => {
                warn!(timeout = ?self.renew_interval, "Lease renewal timed out");
                false
            }
        }
    }

    async fn release(&self) {
        match self.lock.release(&self.identity).await {
            Ok(true) => info!(identity = self.identity, "🔓 Lease released"),
            Ok(false) => debug!(identity = self.identity, "Lease already gone"),
            Err(e) => warn!(error = %e, "Failed to release lease"),
        }
    }

    /// Relay the transactions left in the queue to the current holder, if another replica
    /// holds the lease. Whatever cannot be relayed stays queued.
    async fn handoff_pending(&self) {
        let queue = self.sequencer.queue();
        if queue.is_empty() {
            return;
        }

        let holder = match self.lock.holder().await {
            Ok(Some(holder)) if holder != self.identity => holder,
            Ok(_) => return,
            Err(e) => {
                debug!(error = %e, "Failed to get lease holder");
                return;
            }
        };

        let mut txs = queue.drain().into_iter();
        let mut relayed = 0;
        while let Some(tx) = txs.next() {
            if let Err(e) = self.relay.relay(&holder, &tx).await {
                warn!(error = %e, holder, "Failed to hand over pending transactions");
                queue.requeue(std::iter::once(tx).chain(txs));
                break;
            }
            relayed += 1;
        }

        if relayed > 0 {
            info!(relayed, holder, "Pending transactions handed over to the lease holder");
            NodeMetrics::increment_relayed_transactions(relayed);
        }
    }
}

/// The work of a leadership term: catch up with what earlier holders sequenced, sequence the
/// delayed backlog, then serve transactions.
async fn lead(
    sequencer: Arc<Sequencer>,
    serving: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> Result<(), SubmissionError> {
    loop {
        match drain_backlog(&sequencer, &cancel).await {
            Ok(_) => break,
            Err(SubmissionError::Cancelled | SubmissionError::Unconfirmed(_)) => return Ok(()),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Failed to sequence delayed backlog, retrying");
                tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    () = tokio::time::sleep(keel_primitives::retries::STARTUP_RETRY_DELAY) => {}
                }
            }
        }
    }

    serving.store(true, Ordering::Release);
    sequencer.run(cancel).await
}

async fn drain_backlog(sequencer: &Sequencer, cancel: &CancellationToken) -> Result<u64, SubmissionError> {
    let next_delayed = sequencer.resume().await?;
    debug!(next_delayed, "Resuming delayed messages for the new term");
    sequencer.sequence_delayed_messages(cancel, true).await
}

#[async_trait]
impl TransactionBatcher for Lockout {
    async fn accept(&self, tx: Transaction) -> Result<(), AcceptError> {
        let state = self.state();
        if matches!(state, LockoutState::Leased | LockoutState::Renewing) && self.clock.is_valid() {
            if !self.serving.load(Ordering::Acquire) {
                return Err(AcceptError::NotReady);
            }
            return self.sequencer.accept(tx);
        }

        self.sequencer.queue().validate(&tx)?;
        match self.lock.holder().await {
            Ok(Some(holder)) if holder != self.identity => {
                self.relay.relay(&holder, &tx).await?;
                NodeMetrics::increment_relayed_transactions(1);
                Ok(())
            }
            Ok(_) => Err(AcceptError::NotLeader),
            Err(e) => {
                debug!(error = %e, "Failed to get lease holder");
                Err(AcceptError::NotLeader)
            }
        }
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), SubmissionError> {
        self.run_terms(cancel).await
    }

    async fn health_check(&self) -> Result<(), HealthError> {
        match self.state() {
            LockoutState::Leased if self.clock.is_valid() => Ok(()),
            state => Err(HealthError::Unhealthy(format!("lockout {state}"))),
        }
    }
}
