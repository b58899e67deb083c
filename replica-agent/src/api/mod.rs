//! HTTP control API of the replica agent.

pub mod error;
pub mod health;
pub mod replication;

use crate::replication::replicator::ReplicaNode;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub node_id: String,
    pub node: ReplicaNode,
}

impl AppState {
    pub fn new(node_id: impl Into<String>, node: ReplicaNode) -> Self {
        Self {
            node_id: node_id.into(),
            node,
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        // Replication endpoints
        .route("/replication/{index}/status", get(replication::status))
        .route("/replication/{index}/start", post(replication::start))
        .route("/replication/{index}/cancel", post(replication::cancel))
        .route("/replication/{index}/reset", post(replication::reset))
        .route("/replication/{index}/events", get(replication::events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
