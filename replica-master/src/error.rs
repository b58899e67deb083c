use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use replica_agent::{ErrorClass, ReplicationError};
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg, code) = match &self {
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone(), Some("bad_request")),
            AppError::Replication(
                e @ (ReplicationError::UnknownSession(_)
                | ReplicationError::UnknownFile { .. }
                | ReplicationError::UnknownIndex(_)),
            ) => (StatusCode::NOT_FOUND, e.to_string(), Some(e.code())),
            AppError::Replication(e) if e.class() == ErrorClass::Programming => {
                (StatusCode::BAD_REQUEST, e.to_string(), Some(e.code()))
            }
            AppError::Replication(e) => {
                tracing::error!("Replication error: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into(), None)
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into(), None)
            }
        };

        let body = match code {
            Some(code) => json!({ "error": msg, "code": code }),
            None => json!({ "error": msg }),
        };
        (status, Json(body)).into_response()
    }
}
