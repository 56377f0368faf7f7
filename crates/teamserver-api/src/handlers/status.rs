use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::ApiState;

// ── /health ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub active_sessions: usize,
    pub connects: u64,
    pub disconnects: u64,
}

pub async fn handle_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: state.status.is_healthy(),
        active_sessions: state.sessions.len(),
        connects: state.status.connects(),
        disconnects: state.status.disconnects(),
    })
}
