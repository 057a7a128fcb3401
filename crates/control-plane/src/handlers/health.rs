//! Health check endpoint.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::db::health_check as db_health_check;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// "ok" or "unhealthy"
    pub status: String,

    /// Database connectivity, absent for the in-memory store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    pub uptime_seconds: u64,

    pub version: String,
}

/// `GET /health`
///
/// Returns `503 Service Unavailable` when the database cannot be reached.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db_healthy = match &state.db {
        Some(pool) => Some(db_health_check(pool).await),
        None => None,
    };
    let healthy = db_healthy.unwrap_or(true);

    let response = HealthResponse {
        status: if healthy { "ok" } else { "unhealthy" }.to_string(),
        database: db_healthy.map(|ok| if ok { "connected" } else { "disconnected" }.to_string()),
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(response))
}
