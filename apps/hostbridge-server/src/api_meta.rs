//! Meta endpoints: health.

use crate::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[utoipa::path(
    get,
    path = "/health",
    tag = "Meta",
    responses((status = 200, description = "Service healthy", body = serde_json::Value))
)]
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": VERSION,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}
