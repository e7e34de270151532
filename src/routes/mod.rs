//! Read-only HTTP gateway for the monitoring collaborator.
//!
//! Each sibling module exports a subrouter; this gateway merges them and
//! attaches the shared state, so `main.rs` never needs to know about
//! individual endpoints. Nothing here writes to the store or steers the
//! pipeline.

use axum::Router;
use tokio::sync::watch;

use crate::scheduler::IngestCounters;
use crate::store::Store;

mod health;
mod records;
mod stats;

/// State shared by every route.
pub type ApiState = (Store, watch::Receiver<IngestCounters>);

// ---

pub fn router(store: Store, counters: watch::Receiver<IngestCounters>) -> Router {
    // ---
    Router::new()
        .merge(records::router())
        .merge(stats::router())
        .merge(health::router())
        .with_state((store, counters))
}
