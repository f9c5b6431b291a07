//! Module to control shutdown in carbonator.
//!
//! Every loop that may block for longer than one iteration, the reconnect
//! backoff and the buffer drains, consults the same process-wide flag held by
//! [`Running`]. Shutdown flips that flag first and only then tears timers and
//! clients down, so an in-flight loop observes it within one iteration.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone)]
/// The process-wide running flag.
///
/// The flag is `true` from construction until [`Running::stop`] is called,
/// after which it stays `false` forever. Clones share the same flag.
pub struct Running {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for Running {
    fn default() -> Self {
        Self::new()
    }
}

impl Running {
    /// Create a new flag in the running state. All other handles should be
    /// derived from this one by cloning.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(true);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Whether shutdown has not yet been requested. Never blocks.
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.sender.borrow()
    }

    /// Request shutdown. Returns `true` if this call made the transition,
    /// `false` if the flag was already down.
    pub fn stop(&self) -> bool {
        self.sender.send_replace(false)
    }

    /// Resolve once shutdown has been requested. Returns immediately if it
    /// already has been.
    pub async fn stopped(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, the wait cannot fail.
        let _ = receiver.wait_for(|running| !*running).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn stop_is_idempotent_and_shared() {
        let running = Running::new();
        let clone = running.clone();
        assert!(clone.is_running());

        assert!(running.stop());
        assert!(!running.stop());
        assert!(!clone.is_running());
    }

    #[tokio::test]
    async fn stopped_wakes_waiters() {
        let running = Running::new();
        let waiter = {
            let running = running.clone();
            tokio::spawn(async move { running.stopped().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        running.stop();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter was not woken")
            .expect("waiter panicked");
        // Already stopped, returns at once.
        running.stopped().await;
    }
}
