//! Process metrics endpoint.
//!
//! Prometheus text format, unauthenticated — scrapers are not platform
//! principals. Counter state lives in [`crate::metrics::Metrics`]; queue
//! and spool depth are sampled live.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use crate::repository::downlinks;
use crate::state::AppState;

/// Build the metrics router (public).
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/metrics", get(render))
}

/// `GET /metrics`
async fn render(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut body = state.metrics.render();

    if let Ok(depth) = downlinks::pending_depth(&state.pool).await {
        body.push_str("# TYPE parklane_downlink_queue_depth gauge\n");
        body.push_str(&format!("parklane_downlink_queue_depth {depth}\n"));
    }
    if let Ok(depth) = state.spool.pending_count().await {
        body.push_str("# TYPE parklane_spool_depth gauge\n");
        body.push_str(&format!("parklane_spool_depth {depth}\n"));
    }

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
