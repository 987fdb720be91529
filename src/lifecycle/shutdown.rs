//! Shutdown coordination for the messenger.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that all long-running tasks can subscribe
/// to. The trigger is latched, so [`Shutdown::wait`] returns immediately
/// once shutdown has begun.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    triggered: AtomicBool,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            triggered: AtomicBool::new(false),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal. Later calls are no-ops.
    pub fn trigger(&self) {
        if !self.triggered.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(());
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Wait until [`Shutdown::trigger`] has been called.
    pub async fn wait(&self) {
        // subscribe before checking the flag so a concurrent trigger is seen
        let mut rx = self.tx.subscribe();
        if self.is_triggered() {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Number of tasks still subscribed.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_after_trigger_returns() {
        let s = Shutdown::new();
        s.trigger();
        s.trigger();
        assert!(s.is_triggered());
        tokio::time::timeout(Duration::from_millis(100), s.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn waiters_and_subscribers_see_trigger() {
        let s = Arc::new(Shutdown::new());
        let mut rx = s.subscribe();
        let waiter = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(s.receiver_count(), 2);
        s.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(rx.recv().await.is_ok());
    }
}
