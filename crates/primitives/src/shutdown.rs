use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long a cancelled node is given to stop its workers and release its resources.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// The root shutdown signal of the process.
///
/// It fires either when the OS asks the process to terminate (SIGINT, SIGTERM) or when any
/// task holding a clone of its token cancels it.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    /// Creates a new [`ShutdownSignal`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the root cancellation token. Cancelling it triggers a shutdown.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Trigger the shutdown.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Wait until a shutdown is requested, either by the OS or by a task.
    pub async fn recv(&self) {
        tokio::select! {
            () = self.token.cancelled() => {}
            () = os_signal() => {
                info!("Received termination signal");
            }
        }
    }
}

#[cfg(unix)]
async fn os_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
        warn!("Failed to install SIGTERM handler, listening for Ctrl-C only");
        let _ = tokio::signal::ctrl_c().await;
        return;
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn os_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Run `fut` until it completes or a shutdown is requested.
///
/// On shutdown the signal's token is cancelled and `fut` is given a grace period to wind
/// down, so that workers observing the token can finish in-flight work and release shared
/// resources. `on_shutdown` runs right before returning in every case.
pub async fn run_until_shutdown<F, E>(
    fut: F,
    signal: ShutdownSignal,
    on_shutdown: impl FnOnce(),
) -> Result<(), E>
where
    F: Future<Output = Result<(), E>>,
{
    tokio::pin!(fut);

    let res = tokio::select! {
        res = &mut fut => res,
        () = signal.recv() => {
            signal.trigger();
            match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, &mut fut).await {
                Ok(res) => res,
                Err(_) => {
                    warn!(grace_secs = SHUTDOWN_GRACE_PERIOD.as_secs(), "Graceful shutdown timed out");
                    Ok(())
                }
            }
        }
    };

    on_shutdown();
    res
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;

    #[tokio::test]
    async fn future_observes_shutdown_and_finishes() {
        let signal = ShutdownSignal::new();
        let token = signal.token();
        let finished = Arc::new(AtomicBool::new(false));
        let called = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&finished);
        let fut = async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
            Ok::<(), String>(())
        };

        signal.trigger();
        let hook = Arc::clone(&called);
        let res = run_until_shutdown(fut, signal, || hook.store(true, Ordering::SeqCst)).await;

        assert!(res.is_ok());
        assert!(finished.load(Ordering::SeqCst));
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn errors_are_returned_to_the_caller() {
        let fut = async { Err::<(), _>("fatal") };
        let res = run_until_shutdown(fut, ShutdownSignal::new(), || {}).await;
        assert_eq!(res, Err("fatal"));
    }
}
