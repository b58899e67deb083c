//! Replication control endpoints.

use super::error::ApiError;
use super::AppState;
use crate::replication::replicator::{ReplicationEvent, ReplicationStatus};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::Stream;
use serde::Serialize;
use std::convert::Infallible;
use tokio::sync::broadcast;

#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub master_uuid: String,
    pub session_uuid: String,
    pub files: usize,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct IndexStatusResponse {
    pub index: String,
    pub running: bool,
    pub current_session: Option<SessionSummary>,
    pub last_round: Option<ReplicationStatus>,
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub index: String,
    pub status: String,
}

/// GET /replication/{index}/status
pub async fn status(
    State(state): State<AppState>,
    Path(index): Path<String>,
) -> Result<Json<IndexStatusResponse>, ApiError> {
    let replicator = state.node.replicator(&index)?;

    let current_session = replicator.current_session()?.map(|session| SessionSummary {
        master_uuid: session.master_uuid().to_string(),
        session_uuid: session.session_uuid().to_string(),
        files: session.file_count(),
        size: session.size(),
    });

    Ok(Json(IndexStatusResponse {
        index,
        running: replicator.is_running(),
        current_session,
        last_round: replicator.last_status().await,
    }))
}

/// POST /replication/{index}/start - Start a round in the background
pub async fn start(
    State(state): State<AppState>,
    Path(index): Path<String>,
) -> Result<(StatusCode, Json<ControlResponse>), ApiError> {
    // The round slot is claimed before answering; the handle is detached
    let _round = state.node.replicator(&index)?.start()?;
    tracing::info!(index = %index, "Started replication round on request");

    Ok((
        StatusCode::ACCEPTED,
        Json(ControlResponse {
            index,
            status: "started".to_string(),
        }),
    ))
}

/// POST /replication/{index}/reset - Forget the committed session
pub async fn reset(
    State(state): State<AppState>,
    Path(index): Path<String>,
) -> Result<Json<ControlResponse>, ApiError> {
    state.node.replicator(&index)?.reset_session()?;

    Ok(Json(ControlResponse {
        index,
        status: "reset".to_string(),
    }))
}

/// POST /replication/{index}/cancel
pub async fn cancel(
    State(state): State<AppState>,
    Path(index): Path<String>,
) -> Result<Json<ControlResponse>, ApiError> {
    let cancelled = state.node.replicator(&index)?.cancel();

    Ok(Json(ControlResponse {
        index,
        status: if cancelled { "cancelling" } else { "idle" }.to_string(),
    }))
}

/// GET /replication/{index}/events - Server-sent replication events
pub async fn events(
    State(state): State<AppState>,
    Path(index): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let receiver = state.node.replicator(&index)?.subscribe();

    let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => return Some((Ok(to_sse(&event)), receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event subscriber lagging");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse(event: &ReplicationEvent) -> Event {
    let name = match event {
        ReplicationEvent::RoundStarted { .. } => "round_started",
        ReplicationEvent::Progress { .. } => "progress",
        ReplicationEvent::Completed(_) => "completed",
        ReplicationEvent::Failed(_) => "failed",
    };
    Event::default()
        .event(name)
        .json_data(event)
        .unwrap_or_else(|_| Event::default().event(name))
}
