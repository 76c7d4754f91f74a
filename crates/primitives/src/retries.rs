use std::{fmt::Display, time::Duration};

use alloy::transports::layers::RetryBackoffLayer;
use thiserror::Error;
use tokio_retry::{Retry, strategy::FixedInterval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The default retry layer for RPC clients: up to 10 retries on rate limits, starting
/// from a 500ms backoff.
pub const DEFAULT_RETRY_LAYER: RetryBackoffLayer = RetryBackoffLayer::new(10, 500, 100);

/// The delay between attempts of a startup step.
pub const STARTUP_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Returns `true` if the error is caused by the remote refusing the connection, e.g. because
/// it is restarting. The whole source chain of the error is inspected.
pub fn is_connection_refused(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if err.to_string().to_lowercase().contains("connection refused") {
            return true;
        }
        current = err.source();
    }
    false
}

/// Error returned when a retried operation is interrupted by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Retry `op` with a fixed `delay` between attempts, until it succeeds or `cancel` fires.
///
/// Every failed attempt is logged with the given `name`. Transient failures never abort the
/// caller: the only way out other than success is cancellation.
pub async fn retry_until_success<T, E, F, Fut>(
    cancel: &CancellationToken,
    delay: Duration,
    name: &str,
    mut op: F,
) -> Result<T, Cancelled>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempts = 0u64;
    let action = || {
        attempts += 1;
        let attempt = attempts;
        let fut = op();
        async move {
            fut.await.inspect_err(|e| {
                warn!(attempt, error = %e, "{name} failed, retrying in {}s", delay.as_secs());
            })
        }
    };

    let retry = Retry::spawn(FixedInterval::new(delay), action);

    tokio::select! {
        biased;

        () = cancel.cancelled() => {
            debug!("{name} cancelled");
            Err(Cancelled)
        }
        res = retry => match res {
            Ok(value) => Ok(value),
            // A fixed interval strategy never runs out of attempts.
            Err(_) => Err(Cancelled),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn retries_until_the_operation_succeeds() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let start = tokio::time::Instant::now();
        let counter = Arc::clone(&calls);
        let res = retry_until_success(&cancel, Duration::from_secs(5), "flaky step", || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 3 { Err(format!("attempt {n} failed")) } else { Ok(n) }
            }
        })
        .await;

        assert_eq!(res, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(start.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_retries() {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            child.cancel();
        });

        let res: Result<(), Cancelled> =
            retry_until_success(&cancel, Duration::from_secs(5), "never ready", || async {
                Err::<(), _>("unavailable")
            })
            .await;

        assert_eq!(res, Err(Cancelled));
    }

    #[test]
    fn connection_refused_is_detected() {
        let err = alloy::transports::TransportErrorKind::custom_str(
            "error sending request: Connection refused (os error 111)",
        );
        assert!(is_connection_refused(&err));
    }
}
