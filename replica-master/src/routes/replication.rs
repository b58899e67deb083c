use crate::error::AppError;
use crate::state::AppState;
use async_compression::tokio::bufread::ZstdEncoder;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use replica_agent::replication::{ReplicationSession, Source};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio_util::io::ReaderStream;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/{index}/sessions", post(new_session))
        .route("/sessions/{session}", delete(release_session))
        .route("/sessions/{session}/files/{source}/{name}", get(get_file))
}

/// POST /api/replication/{index}/sessions
async fn new_session(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
) -> Result<Json<ReplicationSession>, AppError> {
    let master = state.registry.master(&index)?.clone();

    let session = tokio::task::spawn_blocking(move || master.new_session())
        .await
        .map_err(|e| anyhow::anyhow!(e))??;

    Ok(Json(session.as_ref().clone()))
}

/// GET /api/replication/sessions/{session}/files/{source}/{name}
async fn get_file(
    State(state): State<Arc<AppState>>,
    Path((session, source, name)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let source: Source = source.parse().map_err(AppError::BadRequest)?;
    let path = state.registry.open_file(&session, source, &name)?;

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", path.display(), e))?;

    let wants_zstd = headers
        .get(ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|enc| enc.trim() == "zstd"))
        .unwrap_or(false);

    tracing::debug!(
        session = %session,
        source = %source,
        file = %name,
        zstd = wants_zstd,
        "Serving file"
    );

    if wants_zstd {
        let encoder = ZstdEncoder::new(BufReader::new(file));
        let body = Body::from_stream(ReaderStream::new(encoder));
        Ok((
            [(CONTENT_TYPE, "application/octet-stream"), (CONTENT_ENCODING, "zstd")],
            body,
        )
            .into_response())
    } else {
        let length = file
            .metadata()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to stat {}: {}", path.display(), e))?
            .len();
        let body = Body::from_stream(ReaderStream::new(file));
        Ok((
            [
                (CONTENT_TYPE, "application/octet-stream".to_string()),
                (CONTENT_LENGTH, length.to_string()),
            ],
            body,
        )
            .into_response())
    }
}

/// DELETE /api/replication/sessions/{session}
async fn release_session(
    State(state): State<Arc<AppState>>,
    Path(session): Path<String>,
) -> Json<serde_json::Value> {
    let released = state.registry.release_session(&session);
    Json(serde_json::json!({ "session_uuid": session, "released": released }))
}
