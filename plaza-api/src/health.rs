//! Health check endpoints

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness_check))
}

/// Always OK while the process is serving
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ready",
        "relay": state.issuer.is_some(),
        "topics": state.hub.topic_count(),
    }))
}
