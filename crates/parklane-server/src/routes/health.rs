//! Liveness and readiness probes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Build the health router (public).
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
}

/// `GET /health/live` — the process answers.
async fn live() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Serialize)]
struct ReadyResponse {
    database: bool,
    coordination: bool,
    spool_pending: Option<usize>,
}

/// `GET /health/ready` — dependencies answer.
async fn ready(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadyResponse>) {
    let database = sqlx::query("SELECT 1")
        .execute(&state.pool)
        .await
        .is_ok();
    let coordination = state.coord.ping().await.is_ok();
    let spool_pending = state.spool.pending_count().await.ok();

    let status = if database && coordination {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            database,
            coordination,
            spool_pending,
        }),
    )
}
