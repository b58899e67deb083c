//! Health check endpoints.

use super::AppState;
use axum::extract::State;
use axum::{response::IntoResponse, Json};
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

static START_TIME: std::sync::OnceLock<u64> = std::sync::OnceLock::new();

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub fn init_start_time() {
    START_TIME.get_or_init(now_secs);
}

/// GET /health - Health check endpoint
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = now_secs().saturating_sub(*START_TIME.get().unwrap_or(&0));

    Json(json!({
        "status": "ok",
        "node_id": state.node_id,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime,
        "indexes": state.node.indexes().count(),
        "running_rounds": state.node.running_count(),
    }))
}

/// GET /version - Version information endpoint
pub async fn version() -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "build": "dev",
        "features": ["zstd"],
    }))
}
