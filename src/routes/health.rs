// src/routes/health.rs
//! Liveness endpoint for the ingestion service.
//!
//! Used by process supervisors to verify the service is running. The status
//! turns `degraded` while ticks keep failing (store or event log
//! unavailable), without touching the database itself.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use super::ApiState;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    consecutive_failures: u64,
    committed_offset: u64,
}

/// Handle `GET /health`.
async fn health(State((_, counters)): State<ApiState>) -> Json<HealthResponse> {
    // ---
    let snapshot = counters.borrow().clone();
    let status = if snapshot.consecutive_failures == 0 {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        consecutive_failures: snapshot.consecutive_failures,
        committed_offset: snapshot.committed_offset,
    })
}

pub fn router() -> Router<ApiState> {
    Router::new().route("/health", get(health))
}
