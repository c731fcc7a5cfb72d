//! Shutdown signaling shared by the processor worker and the async loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Shutdown signal for graceful termination
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    /// Flag to indicate shutdown requested
    shutdown: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake every sleeping loop
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Check if shutdown was requested
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Sleep for `period` or until shutdown is requested, whichever is first.
    /// Returns true if the loop should stop.
    pub async fn sleep(&self, period: Duration) -> bool {
        let notified = self.notify.notified();
        if self.is_shutdown_requested() {
            return true;
        }
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(period) => {}
        }
        self.is_shutdown_requested()
    }
}
