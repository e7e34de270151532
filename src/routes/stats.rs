//! `GET /stats`: cumulative ingestion counters, as last published by the
//! scheduler after a tick.

use axum::{extract::State, routing::get, Json, Router};

use super::ApiState;
use crate::scheduler::IngestCounters;

async fn stats(State((_, counters)): State<ApiState>) -> Json<IngestCounters> {
    Json(counters.borrow().clone())
}

pub fn router() -> Router<ApiState> {
    Router::new().route("/stats", get(stats))
}
