use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

use crate::batcher::SubmissionGate;

/// The local view of the lease held in the lock service.
///
/// The lease is only considered valid until `last_renewed + ttl - margin`, where
/// `last_renewed` is the instant the last successful renewal *started*. A lease that was not
/// renewed in time closes the gate even if the renewal loop is stuck.
#[derive(Debug, Clone)]
pub struct LeaseClock {
    last_renewed: Arc<Mutex<Option<Instant>>>,
    ttl: Duration,
    margin: Duration,
}

impl LeaseClock {
    /// Creates a clock with no lease.
    pub fn new(ttl: Duration, margin: Duration) -> Self {
        Self { last_renewed: Arc::default(), ttl, margin }
    }

    /// Record a successful acquisition or renewal, requested at `started`.
    pub fn record_renewal(&self, started: Instant) {
        let mut last = self.last_renewed.lock().unwrap_or_else(PoisonError::into_inner);
        *last = Some(last.map_or(started, |prev| prev.max(started)));
    }

    /// Forget the lease. The gate stays closed until the next acquisition.
    pub fn invalidate(&self) {
        *self.last_renewed.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Returns `true` if the lease is still safely held.
    pub fn is_valid(&self) -> bool {
        let last = *self.last_renewed.lock().unwrap_or_else(PoisonError::into_inner);
        last.is_some_and(|renewed| Instant::now() < renewed + self.ttl.saturating_sub(self.margin))
    }
}

impl SubmissionGate for LeaseClock {
    fn is_open(&self) -> bool {
        self.is_valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn lease_expires_before_the_ttl() {
        let clock = LeaseClock::new(Duration::from_secs(10), Duration::from_secs(1));
        assert!(!clock.is_valid());

        clock.record_renewal(Instant::now());
        assert!(clock.is_valid());

        tokio::time::sleep(Duration::from_millis(8_999)).await;
        assert!(clock.is_valid());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!clock.is_valid());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_counts_from_its_start() {
        let clock = LeaseClock::new(Duration::from_secs(10), Duration::ZERO);
        let started = Instant::now();
        tokio::time::sleep(Duration::from_secs(4)).await;

        // A slow renewal does not extend the lease beyond what the lock service granted.
        clock.record_renewal(started);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!clock.is_valid());

        clock.record_renewal(Instant::now());
        clock.invalidate();
        assert!(!clock.is_valid());
    }
}
