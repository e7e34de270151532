use axum::{
    extract::Query, extract::State, http::StatusCode, response::IntoResponse, routing::get, Json,
    Router,
};
use serde_json::json;
use tracing::{debug, error};

use super::ApiState;
use crate::store::RecordFilter;

// ---

pub fn router() -> Router<ApiState> {
    // ---
    Router::new().route("/records", get(handler))
}

/// `GET /records` - stored records matching the query-string filter, e.g.
/// `/records?flagged_only=true&newest_first=true&limit=20` or
/// `/records?error_flags_set=true`.
async fn handler(
    Query(filter): Query<RecordFilter>,
    State((store, _)): State<ApiState>,
) -> impl IntoResponse {
    // ---
    debug!("GET /records - {:?}", filter);

    match store.query(&filter).await {
        Ok(records) => {
            debug!("GET /records - returning {} records", records.len());
            (StatusCode::OK, Json(records)).into_response()
        }
        Err(e) => {
            error!("Failed to query records: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to query records" })),
            )
                .into_response()
        }
    }
}
