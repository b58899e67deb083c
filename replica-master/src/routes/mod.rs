pub mod replication;

use crate::state::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/replication", replication::router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "indexes": state.registry.indexes().collect::<Vec<_>>(),
        "active_sessions": state.registry.active_sessions(),
        "session_ttl_secs": state.config.session_ttl.as_secs(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use futures_util::TryStreamExt;
    use replica_agent::replication::replicator::RoundState;
    use replica_agent::replication::{
        IndexLayout, IndexReplicator, MasterRegistry, ProcessOptions, Source, Strategy,
    };
    use replica_agent::transfer::{HttpMasterClient, MasterClient};
    use replica_agent::ReplicationError;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn index_dir(dir: &TempDir) -> std::path::PathBuf {
        let indexes = dir.path().join("indexes");
        let root = indexes.join("books");
        std::fs::create_dir_all(root.join("data")).unwrap();
        std::fs::write(root.join("data/seg1"), vec![5u8; 64 * 1024]).unwrap();
        std::fs::write(root.join("data/segments_1"), b"gen1").unwrap();
        std::fs::create_dir_all(root.join("resources")).unwrap();
        std::fs::write(root.join("resources/stop words.txt"), b"a\nthe\n").unwrap();
        indexes
    }

    /// Serve the master on an ephemeral port, returning its base URL
    async fn serve(indexes_dir: &Path) -> (String, MasterRegistry) {
        let registry = MasterRegistry::discover(indexes_dir).unwrap();
        let config = AppConfig {
            port: 0,
            indexes_dir: indexes_dir.to_path_buf(),
            session_ttl: Duration::from_secs(600),
            session_sweep: Duration::from_secs(60),
            log_level: "info".into(),
        };
        let app = create_router(Arc::new(AppState::new(config, registry.clone())));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        (format!("http://{}", addr), registry)
    }

    async fn fetch(
        client: &HttpMasterClient,
        session_uuid: &str,
        source: Source,
        name: &str,
    ) -> Vec<u8> {
        let chunks: Vec<_> = client
            .get_file(session_uuid, source, name)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn test_http_client_against_master() {
        let dir = TempDir::new().unwrap();
        let (base_url, registry) = serve(&index_dir(&dir)).await;
        let master_uuid = registry.master("books").unwrap().master_uuid().to_string();

        for compression in [false, true] {
            let client = HttpMasterClient::new(&base_url, compression).unwrap();

            let session = client.new_session("books").await.unwrap();
            assert_eq!(session.master_uuid(), master_uuid);
            assert_eq!(session.file_count(), 3);
            assert_eq!(session.size(), 64 * 1024 + 4 + 6);

            let uuid = session.session_uuid();
            let seg1 = fetch(&client, uuid, Source::Index, "seg1").await;
            assert_eq!(seg1, vec![5u8; 64 * 1024]);
            let stop_words = fetch(&client, uuid, Source::Resources, "stop words.txt").await;
            assert_eq!(stop_words, b"a\nthe\n");

            client.release_session(uuid).await.unwrap();
            client.release_session(uuid).await.unwrap();
            assert_eq!(registry.active_sessions(), 0);
        }
    }

    #[tokio::test]
    async fn test_http_client_maps_error_codes() {
        let dir = TempDir::new().unwrap();
        let (base_url, _registry) = serve(&index_dir(&dir)).await;
        let client = HttpMasterClient::new(&base_url, true).unwrap();

        let err = client.new_session("films").await.unwrap_err();
        assert!(matches!(err, ReplicationError::UnknownIndex(ref index) if index == "films"));

        let err = client.get_file("nope", Source::Index, "seg1").await.err().unwrap();
        assert!(matches!(err, ReplicationError::UnknownSession(_)));

        let session = client.new_session("books").await.unwrap();
        let err = client
            .get_file(session.session_uuid(), Source::Index, "seg9")
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ReplicationError::UnknownFile { src: Source::Index, ref name } if name == "seg9"
        ));

        client.release_session(session.session_uuid()).await.unwrap();
        let err = client
            .get_file(session.session_uuid(), Source::Index, "seg1")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ReplicationError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn test_replication_round_over_http() {
        let dir = TempDir::new().unwrap();
        let (base_url, registry) = serve(&index_dir(&dir)).await;
        let slave_root = dir.path().join("slave/books");

        let client = Arc::new(HttpMasterClient::new(&base_url, true).unwrap());
        let replicator = IndexReplicator::new(
            "books",
            IndexLayout::new(&slave_root),
            client,
            ProcessOptions::default(),
        );

        let status = replicator.replicate().await.unwrap();
        assert_eq!(status.state, RoundState::Done, "{:?}", status.error);
        assert_eq!(status.strategy, Some(Strategy::Full));
        assert_eq!(status.files_downloaded, 3);
        let seg1 = std::fs::read(slave_root.join("data/seg1")).unwrap();
        assert_eq!(seg1, vec![5u8; 64 * 1024]);
        let stop_words = std::fs::read(slave_root.join("resources/stop words.txt")).unwrap();
        assert_eq!(stop_words, b"a\nthe\n");
        assert_eq!(registry.active_sessions(), 0);

        let status = replicator.replicate().await.unwrap();
        assert_eq!(status.strategy, Some(Strategy::Incremental));
        assert_eq!(status.files_downloaded, 0);
        assert_eq!(status.files_unchanged, 3);
    }
}
