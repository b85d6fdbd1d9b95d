// Worker Shutdown Token
// Lets code outside the worker loop (signal handlers, supervisors) ask for a voluntary exit.

use tokio::sync::watch;

/// Shutdown signal for graceful termination
#[derive(Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    /// Check if shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is requested or the sender is dropped
    pub async fn wait(&mut self) {
        while !self.is_shutdown() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Shutdown sender
pub struct ShutdownSender {
    tx: watch::Sender<bool>,
}

impl ShutdownSender {
    /// Ask every worker holding a token to shut down
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
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

    #[tokio::test]
    async fn test_wait_returns_after_shutdown() {
        let (sender, mut token) = shutdown_channel();
        assert!(!token.is_shutdown());

        sender.shutdown();
        token.wait().await;
        assert!(token.is_shutdown());
    }

    #[test]
    fn test_pending_wait_is_woken_by_shutdown() {
        let (sender, mut token) = shutdown_channel();
        let mut wait = tokio_test::task::spawn(token.wait());
        tokio_test::assert_pending!(wait.poll());

        sender.shutdown();
        assert!(wait.is_woken());
        tokio_test::assert_ready!(wait.poll());
    }

    #[tokio::test]
    async fn test_wait_returns_when_sender_dropped() {
        let (sender, mut token) = shutdown_channel();
        drop(sender);
        token.wait().await;
        assert!(!token.is_shutdown());
    }
}
