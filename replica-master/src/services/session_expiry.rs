use replica_agent::replication::MasterRegistry;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Every `sweep`, release sessions that have been idle for longer than `ttl`.
pub fn start_session_expiry(
    registry: MasterRegistry,
    ttl: Duration,
    sweep: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let expired = registry.expire_inactive(ttl);
                    if !expired.is_empty() {
                        tracing::info!(
                            expired = expired.len(),
                            active = registry.active_sessions(),
                            "Expired idle replication sessions"
                        );
                    }
                }
            }
        }
        tracing::info!("Session expiry service stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_idle_sessions_are_expired() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("books/data")).unwrap();
        std::fs::write(dir.path().join("books/data/seg1"), b"segment").unwrap();

        let registry = MasterRegistry::discover(dir.path()).unwrap();
        registry.master("books").unwrap().new_session().unwrap();
        assert_eq!(registry.active_sessions(), 1);

        let cancel = CancellationToken::new();
        let handle = start_session_expiry(
            registry.clone(),
            Duration::from_millis(1),
            Duration::from_millis(10),
            cancel.clone(),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.active_sessions() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_active_sessions_survive() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("books/data")).unwrap();

        let registry = MasterRegistry::discover(dir.path()).unwrap();
        registry.master("books").unwrap().new_session().unwrap();

        let cancel = CancellationToken::new();
        let handle = start_session_expiry(
            registry.clone(),
            Duration::from_secs(600),
            Duration::from_millis(10),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.active_sessions(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
