use std::{
    collections::BTreeMap,
    fmt::Debug,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use futures::future::join_all;
use keel_primitives::retries::Cancelled;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::NodeMetrics;

mod checks;
pub use checks::{
    BatcherCheck, DelayedBacklogCheck, FeedLagCheck, InboxSyncCheck, InitStage, L1Check,
    LivenessCheck, LogsProcessedCheck, MessagesSyncCheck, NodeInitialization,
};

mod server;
pub use server::{router, serve};

/// The interval between two readiness evaluations while waiting for the node to sync.
const SYNC_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Why a component is not healthy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HealthError {
    #[error("{0}")]
    Unhealthy(String),
    #[error("not evaluated yet")]
    Pending,
}

/// A single health condition.
#[async_trait]
pub trait HealthCheck: Debug + Send + Sync {
    /// The name the check is reported under.
    fn name(&self) -> &'static str;

    /// Evaluate the check.
    async fn check(&self) -> Result<(), HealthError>;
}

/// The last result of a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    /// Whether the check passed.
    pub healthy: bool,
    /// The reason it did not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Result<(), HealthError>> for CheckReport {
    fn from(result: Result<(), HealthError>) -> Self {
        match result {
            Ok(()) => Self { healthy: true, error: None },
            Err(e) => Self { healthy: false, error: Some(e.to_string()) },
        }
    }
}

/// The aggregated results of a [`HealthRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// `"ok"` if every check passed, `"unhealthy"` otherwise.
    pub status: &'static str,
    /// Per-check results.
    pub checks: BTreeMap<&'static str, CheckReport>,
}

impl HealthReport {
    fn new(checks: BTreeMap<&'static str, CheckReport>) -> Self {
        let status = if checks.values().all(|c| c.healthy) { "ok" } else { "unhealthy" };
        Self { status, checks }
    }

    /// Returns `true` if every check passed.
    pub fn is_healthy(&self) -> bool {
        self.status == "ok"
    }

    /// The names of the failing checks.
    pub fn failing(&self) -> Vec<&'static str> {
        self.checks.iter().filter(|(_, c)| !c.healthy).map(|(name, _)| *name).collect()
    }
}

/// A set of health checks, evaluated together and cached.
///
/// Checks can be registered at any time. A check reports [`HealthError::Pending`] until it
/// is evaluated for the first time.
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    name: &'static str,
    checks: Arc<RwLock<Vec<Arc<dyn HealthCheck>>>>,
    results: Arc<RwLock<BTreeMap<&'static str, CheckReport>>>,
}

impl HealthRegistry {
    /// Creates an empty registry.
    pub fn new(name: &'static str) -> Self {
        Self { name, checks: Arc::default(), results: Arc::default() }
    }

    /// The name of the registry.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Add a check to the registry.
    pub fn register(&self, check: Arc<dyn HealthCheck>) {
        debug!(registry = self.name, check = check.name(), "Registering health check");
        self.results
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(check.name(), Err(HealthError::Pending).into());
        self.checks.write().unwrap_or_else(PoisonError::into_inner).push(check);
    }

    /// Run every check once and cache the results.
    pub async fn evaluate(&self) -> HealthReport {
        let checks = self.checks.read().unwrap_or_else(PoisonError::into_inner).clone();
        let results = join_all(checks.iter().map(|check| async move {
            let result = check.check().await;
            (check.name(), CheckReport::from(result))
        }))
        .await;

        for (check, report) in &results {
            NodeMetrics::set_health_check(self.name, check, report.healthy);
        }

        let mut cache = self.results.write().unwrap_or_else(PoisonError::into_inner);
        cache.extend(results);
        HealthReport::new(cache.clone())
    }

    /// The cached results.
    pub fn report(&self) -> HealthReport {
        HealthReport::new(self.results.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    /// Returns `true` if every check passed on its last evaluation.
    pub fn is_healthy(&self) -> bool {
        self.report().is_healthy()
    }

    /// Evaluate the checks every `interval` until cancellation.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        let mut was_healthy = true;

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let report = self.evaluate().await;
                    if report.is_healthy() != was_healthy {
                        if report.is_healthy() {
                            info!(registry = self.name, "💚 Healthy again");
                        } else {
                            warn!(registry = self.name, failing = ?report.failing(), "Unhealthy");
                        }
                        was_healthy = report.is_healthy();
                    }
                }
            }
        }
    }
}

/// Wait until every readiness check passes, evaluating them every few seconds.
pub async fn wait_until_synced(
    readiness: &HealthRegistry,
    cancel: &CancellationToken,
) -> Result<(), Cancelled> {
    loop {
        let report = readiness.evaluate().await;
        if report.is_healthy() {
            info!("✅ Node synced");
            return Ok(());
        }

        info!(failing = ?report.failing(), "⏳ Waiting for the node to sync");
        tokio::select! {
            () = cancel.cancelled() => return Err(Cancelled),
            () = tokio::time::sleep(SYNC_POLL_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::time::Instant;

    use super::*;

    #[derive(Debug, Default)]
    pub(super) struct Toggle(pub(super) AtomicBool);

    #[async_trait]
    impl HealthCheck for Toggle {
        fn name(&self) -> &'static str {
            "toggle"
        }

        async fn check(&self) -> Result<(), HealthError> {
            if self.0.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(HealthError::Unhealthy("switched off".to_owned()))
            }
        }
    }

    #[tokio::test]
    async fn checks_are_pending_until_evaluated() {
        let registry = HealthRegistry::new("test");
        assert!(registry.is_healthy());

        let toggle = Arc::new(Toggle(AtomicBool::new(true)));
        registry.register(toggle.clone());
        let report = registry.report();
        assert!(!report.is_healthy());
        assert_eq!(report.checks["toggle"].error.as_deref(), Some("not evaluated yet"));

        assert!(registry.evaluate().await.is_healthy());

        toggle.0.store(false, Ordering::SeqCst);
        // Cached until the next evaluation.
        assert!(registry.is_healthy());
        let report = registry.evaluate().await;
        assert_eq!(report.failing(), vec!["toggle"]);
        assert_eq!(report.status, "unhealthy");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_synced_polls_readiness() {
        let registry = HealthRegistry::new("readiness");
        let toggle = Arc::new(Toggle::default());
        registry.register(toggle.clone());

        let switch = Arc::clone(&toggle);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            switch.0.store(true, Ordering::SeqCst);
        });

        let start = Instant::now();
        wait_until_synced(&registry, &CancellationToken::new()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_synced_stops_on_cancellation() {
        let registry = HealthRegistry::new("readiness");
        registry.register(Arc::new(Toggle::default()));

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(wait_until_synced(&registry, &cancel).await, Err(Cancelled));
    }
}
