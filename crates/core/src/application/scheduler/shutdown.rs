// Scheduler shutdown token

use tokio::sync::watch;

/// Shutdown signal shared by the poll loop, batch tasks and processors
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    /// Check if shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested (immediately if it already was)
    pub async fn wait(&mut self) {
        // Sender dropped counts as shutdown
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

/// Shutdown sender
#[derive(Debug)]
pub struct ShutdownSender {
    tx: watch::Sender<bool>,
}

impl ShutdownSender {
    /// Signal shutdown to every token
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Create a shutdown channel
pub fn shutdown_channel() -> (ShutdownSender, ShutdownToken) {
    let (tx, rx) = watch::channel(false);
    (ShutdownSender { tx }, ShutdownToken { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_after_signal_returns_immediately() {
        let (tx, mut token) = shutdown_channel();
        tx.shutdown();
        assert!(token.is_shutdown());
        tokio::time::timeout(Duration::from_millis(100), token.wait())
            .await
            .expect("already-signalled token must not block");
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_signal() {
        let (tx, _token) = shutdown_channel();
        tx.shutdown();
        assert!(tx.token().is_shutdown());
    }

    #[tokio::test]
    async fn test_dropped_sender_releases_waiters() {
        let (tx, mut token) = shutdown_channel();
        drop(tx);
        tokio::time::timeout(Duration::from_millis(100), token.wait())
            .await
            .expect("dropped sender must release waiters");
    }
}
