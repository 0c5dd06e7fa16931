//! Health check endpoint

use crate::AppState;
use axum::{extract::State, Json};
use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_seconds: i64,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "bvm-server",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: (Utc::now() - state.startup_time).num_seconds(),
    })
}
