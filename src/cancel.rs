//! Cooperative stop signal shared between the scan worker and its owner.
//!
//! Backed by a `tokio::sync::watch` channel so that loops can both poll the
//! flag at their head and `await` it alongside a sleep, which lets a waiting
//! loop exit the moment the signal is raised instead of at its next poll.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable cancellation token. All clones observe the same flag.
#[derive(Clone, Debug)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    /// A lowered signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal. Idempotent.
    pub fn raise(&self) {
        self.tx.send_replace(true);
    }

    /// Lower the signal so the token can be reused for the next run.
    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    /// Whether the signal is currently raised.
    pub fn is_raised(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal is raised (immediately if it already is).
    pub async fn raised(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|raised| *raised).await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_raise_and_clear() {
        let stop = StopSignal::new();
        let clone = stop.clone();
        assert!(!clone.is_raised());
        stop.raise();
        assert!(clone.is_raised());
        stop.clear();
        assert!(!clone.is_raised());
    }

    #[tokio::test]
    async fn test_raised_resolves_when_already_set() {
        let stop = StopSignal::new();
        stop.raise();
        tokio::time::timeout(Duration::from_millis(100), stop.raised())
            .await
            .expect("raised() should resolve immediately");
    }

    #[tokio::test(start_paused = true)]
    async fn test_raised_wakes_waiter() {
        let stop = StopSignal::new();
        let waiter = stop.clone();
        let handle = tokio::spawn(async move { waiter.raised().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.raise();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
