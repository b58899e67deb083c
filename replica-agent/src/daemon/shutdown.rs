//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! In-flight replication rounds are cancelled; a round that already started
//! committing runs to completion before the process exits.

use crate::replication::replicator::ReplicaNode;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled once a shutdown signal arrived
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for SIGTERM or SIGINT (or an earlier call to `trigger`)
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT (Ctrl+C), initiating graceful shutdown..."),
            _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
            _ = self.token.cancelled() => {}
        }

        self.token.cancel();
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Cancel running rounds and wait up to `grace` for them to wind down
    pub async fn shutdown(&self, node: &ReplicaNode, grace: Duration) {
        info!("Graceful shutdown initiated");

        let cancelled = node.cancel_all();
        if cancelled > 0 {
            info!(rounds = cancelled, "Cancelled in-flight replication rounds");
        }

        let waited = tokio::time::timeout(grace, async {
            while node.running_count() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        if waited.is_err() {
            warn!(running = node.running_count(), "Replication rounds still running at shutdown");
        }

        info!("Graceful shutdown complete");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
