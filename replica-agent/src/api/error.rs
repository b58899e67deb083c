//! Error responses of the control API.

use crate::utils::errors::{ErrorClass, ReplicationError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub struct ApiError(pub ReplicationError);

impl From<ReplicationError> for ApiError {
    fn from(err: ReplicationError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ReplicationError::UnknownIndex(_) => StatusCode::NOT_FOUND,
            ReplicationError::AlreadyRunning(_) => StatusCode::CONFLICT,
            err if err.class() == ErrorClass::Programming => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Internal error: {}", self.0);
        }

        let body = json!({ "error": self.0.to_string(), "code": self.0.code() });
        (status, Json(body)).into_response()
    }
}
