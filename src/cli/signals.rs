//! Signal handling for the record and play runners

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Shutdown signal raised by SIGINT or SIGTERM
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    /// Create a new shutdown signal handler
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled once a shutdown signal arrives
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Check if shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown was requested
    pub async fn wait(&self) {
        self.token.cancelled().await
    }

    /// Install the SIGINT and SIGTERM handlers
    pub async fn setup(&self) -> Result<(), std::io::Error> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let token = self.token.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => debug!("Received SIGINT"),
                _ = sigterm.recv() => debug!("Received SIGTERM"),
                _ = token.cancelled() => return,
            }
            token.cancel();
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_signal_default_is_false() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutdown());
    }

    #[tokio::test]
    async fn cancelled_token_wakes_waiters() {
        let signal = ShutdownSignal::new();
        signal.setup().await.unwrap();
        signal.token().cancel();
        signal.wait().await;
        assert!(signal.is_shutdown());
    }
}
