//! Health and status endpoints

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde_json::json;

use crate::api::server::AppState;
use crate::error::Result;
use crate::models::HealthStatus;

/// Liveness check
pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "proxynest"
        })),
    )
}

/// Pool status summary
pub async fn status(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let now = Utc::now();
    let proxies = state.store.list().await?;

    let total = proxies.len();
    let leased = proxies.iter().filter(|p| p.is_leased(now)).count();
    let healthy = proxies
        .iter()
        .filter(|p| p.health_status == HealthStatus::Healthy)
        .count();
    let unreachable = proxies
        .iter()
        .filter(|p| p.health_status == HealthStatus::Unreachable)
        .count();

    Ok(Json(json!({
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "proxies": {
            "total": total,
            "leased": leased,
            "available": total - leased,
            "healthy": healthy,
            "unreachable": unreachable,
        }
    })))
}
