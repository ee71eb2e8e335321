//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! The scheduler subscribes to the coordinator; on a signal it stops polling
//! and gives an in-flight snapshot its grace period before cancelling it.

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx }
    }

    /// Get a shutdown receiver
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Broadcast shutdown to every subscriber
    pub fn trigger(&self) {
        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to broadcast shutdown signal: {}", e);
        }
    }

    /// Wait for SIGTERM or SIGINT, then broadcast shutdown.
    pub async fn wait_for_signal(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            tokio::select! {
                result = signal::ctrl_c() => {
                    result?;
                    info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }

        self.trigger();
        Ok(())
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_coordinator() {
        let coordinator = ShutdownCoordinator::new();
        let mut first = coordinator.subscribe();
        let mut second = coordinator.subscribe();

        let handle = tokio::spawn(async move {
            first.recv().await.ok();
        });

        coordinator.trigger();

        handle.await.unwrap();
        assert!(second.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_trigger_without_subscribers_is_harmless() {
        ShutdownCoordinator::default().trigger();
    }
}
