use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Long-running background services that support graceful shutdown.
pub trait Daemon: Send {
    fn shutdown_handle(&self) -> ShutdownHandle;

    fn start(self);
}

/// A type for background running services to detect cancellation requests made to them via
/// [`ShutdownHandle`], and for them to signal they've ended execution, either through such a
/// requested shutdown or voluntary exit.
#[derive(Debug, Default)]
pub struct FinishHandle {
    cancellation: CancellationToken,
    finish: CancellationToken,
}

/// A type for requesting cancellation of background running services and waiting for them to have
/// ended execution, either through such a requested shutdown or voluntary exit.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    cancellation: CancellationToken,
    finish: CancellationToken,
}

impl FinishHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            cancellation: self.cancellation.clone(),
            finish: self.finish.clone(),
        }
    }

    /// Creates an abort flag that trips whenever this service is asked to shut down, but which can
    /// also be tripped on its own without affecting the service or its other children.
    pub fn child_token(&self) -> CancellationToken {
        self.cancellation.child_token()
    }

    /// Signals that the service has finish executing.
    pub fn finish(&self) {
        self.finish.cancel();
    }

    /// Checks whether any shutdown request has been made via [`ShutdownHandle::shutdown`].
    pub fn is_shutdown_requested(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Waits asynchronously for a shutdown request to be made via [`ShutdownHandle::shutdown`].
    pub async fn shutdown_requested(&self) {
        self.cancellation.cancelled().await
    }
}

impl ShutdownHandle {
    /// Request a shutdown without waiting for the process to finish.
    ///
    /// Call [`finished`](Self::finished) to wait for the process to finish.
    pub fn shutdown(&self) {
        self.cancellation.cancel();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Waits asynchronously for the service to finish execution, either through a requested
    /// shutdown or voluntary exit.
    pub async fn finished(&self) {
        self.finish.cancelled().await
    }
}

/// Sleeps for `duration` unless `abort` trips first.
///
/// Returns `false` when the sleep was cut short, so loops can bail out at their next check point.
pub async fn sleep_unless_aborted(abort: &CancellationToken, duration: Duration) -> bool {
    if duration.is_zero() {
        return !abort.is_cancelled();
    }

    tokio::select! {
        _ = abort.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
