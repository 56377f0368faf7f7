//! Read-only HTTP status surface, merged into the connection engine's
//! router so agents and operators share one listener.

pub mod handlers;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::{ApiState, ServerStatus};

/// Routes under `/api`.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(handlers::status::handle_health))
        .route("/sessions", get(handlers::sessions::handle_sessions))
        .route("/sessions/{id}", get(handlers::sessions::handle_session_inspect))
        .route("/sessions/{id}/results", get(handlers::sessions::handle_session_results))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}
