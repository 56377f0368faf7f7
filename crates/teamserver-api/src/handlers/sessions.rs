//! /sessions handlers: session inspection.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use teamserver_services::{SessionInfo, StoredResult};

use super::ApiState;

// ── /sessions ─────────────────────────────────────────────────────────────────

pub async fn handle_sessions(State(state): State<ApiState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.snapshot())
}

// ── /sessions/{id} ────────────────────────────────────────────────────────────

pub async fn handle_session_inspect(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, (StatusCode, String)> {
    state
        .sessions
        .get(&session_id)
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "session not found".to_string()))
}

// ── /sessions/{id}/results ────────────────────────────────────────────────────

pub async fn handle_session_results(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<StoredResult>>, (StatusCode, String)> {
    if state.sessions.get(&session_id).is_none() {
        return Err((StatusCode::NOT_FOUND, "session not found".to_string()));
    }
    Ok(Json(state.task_results.for_session(&session_id)))
}
