//! Cooperative cancellation.
//!
//! A [`CancelSignal`] is cloned into every long-running operation of a run.
//! Firing it makes every pending [`CancelSignal::cancelled`] future resolve;
//! the pipeline reacts by closing the server session, which terminates the
//! subprocess.

use std::sync::Arc;

use tokio::sync::watch;

/// A cloneable, one-way cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    state: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    /// Creates a signal that has not fired.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Fires the signal. Idempotent.
    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    /// Returns `true` once the signal has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves when the signal fires.
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        if rx.wait_for(|fired| *fired).await.is_err() {
            // The sender lives as long as `self`, so this cannot happen.
            std::future::pending::<()>().await;
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn clones_observe_cancel() {
        let signal = CancelSignal::new();
        let observer = signal.clone();
        let waiter = tokio::spawn(async move { observer.cancelled().await });

        assert!(!signal.is_cancelled());
        signal.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .unwrap();
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn already_cancelled_resolves_immediately() {
        let signal = CancelSignal::new();
        signal.cancel();
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("should not block");
    }

    #[test]
    fn waiter_is_woken_on_cancel() {
        let signal = CancelSignal::new();
        let mut waiter = tokio_test::task::spawn(signal.cancelled());
        tokio_test::assert_pending!(waiter.poll());

        signal.cancel();
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }
}
