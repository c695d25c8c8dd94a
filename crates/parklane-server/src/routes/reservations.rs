//! Reservation routes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use uuid::Uuid;

use parklane_core::auth::Principal;

use crate::audit::{self, RequestMeta};
use crate::auth::require_tenant;
use crate::error::ApiError;
use crate::evaluator;
use crate::metrics::Metrics;
use crate::models::Reservation;
use crate::repository::{reservations, spaces};
use crate::state::AppState;

/// Longest bookable interval.
const MAX_DURATION_HOURS: i64 = 24;

/// Build the reservations router (authenticated).
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/reservations", post(create))
        .route("/reservations/{id}", get(get_one).delete(cancel))
}

#[derive(Debug, Deserialize)]
struct CreateRequest {
    space_id: Uuid,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    requester: String,
    request_id: Option<String>,
}

/// `POST /reservations` — book a space.
///
/// Overlap is decided by the database exclusion constraint; a matching
/// `request_id` returns the original reservation unchanged.
async fn create(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Extension(meta): Extension<RequestMeta>,
    Json(body): Json<CreateRequest>,
) -> Result<(StatusCode, Json<Reservation>), ApiError> {
    principal.require_scope("reservations:write")?;
    let tenant_id = require_tenant(&principal)?;

    if body.ends_at <= body.starts_at {
        return Err(ApiError::Validation("ends_at must be after starts_at".to_owned()));
    }
    if body.ends_at - body.starts_at > TimeDelta::hours(MAX_DURATION_HOURS) {
        return Err(ApiError::Validation(format!(
            "reservation exceeds {MAX_DURATION_HOURS}h"
        )));
    }
    if body.requester.trim().is_empty() {
        return Err(ApiError::Validation("requester is required".to_owned()));
    }

    // Idempotent retry: same (tenant, request_id) returns the original.
    if let Some(request_id) = &body.request_id {
        if let Some(existing) =
            reservations::find_by_request_id(&state.pool, tenant_id, request_id).await?
        {
            return Ok((StatusCode::OK, Json(existing)));
        }
    }

    // Creation throttle per tenant.
    let limits = state.config.rate_limits;
    let decision = state
        .coord
        .bucket_take(
            &format!("rl:reservations:{tenant_id}"),
            limits.reservations_per_tenant,
            limits.reservations_per_tenant_burst,
            1.0,
        )
        .await?;
    if !decision.allowed {
        return Err(ApiError::RateLimited {
            retry_after_secs: decision.retry_after_secs(),
        });
    }

    // The space must exist in this tenant; foreign ids are not found.
    spaces::get(&state.pool, tenant_id, body.space_id).await?;

    let created = reservations::insert(
        &state.pool,
        tenant_id,
        body.space_id,
        body.starts_at,
        body.ends_at,
        body.requester.trim(),
        body.request_id.as_deref(),
    )
    .await
    .inspect_err(|e| {
        if matches!(e, ApiError::Conflict { .. }) {
            Metrics::bump(&state.metrics.reservations_conflicts);
        }
    })?;
    Metrics::bump(&state.metrics.reservations_created);

    audit::record(
        &state,
        &principal,
        "reservation.create",
        "reservation",
        Some(created.id.to_string()),
        None,
        serde_json::to_value(&created).ok(),
        &meta,
    )
    .await?;

    let now = Utc::now();
    if created.starts_at <= now && now < created.ends_at {
        if let Err(e) = evaluator::evaluate_space(&state, tenant_id, created.space_id).await {
            tracing::warn!(space_id = %created.space_id, error = %e, "re-evaluation after booking failed");
        }
    }

    Ok((StatusCode::CREATED, Json(created)))
}

/// `GET /reservations/{id}`
async fn get_one(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<Reservation>, ApiError> {
    principal.require_scope("reservations:read")?;
    let tenant_id = require_tenant(&principal)?;
    Ok(Json(
        reservations::get(&state.pool, tenant_id, reservation_id).await?,
    ))
}

/// `DELETE /reservations/{id}` — cancel a live reservation.
async fn cancel(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Extension(meta): Extension<RequestMeta>,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<Reservation>, ApiError> {
    principal.require_scope("reservations:write")?;
    let tenant_id = require_tenant(&principal)?;

    let before = reservations::get(&state.pool, tenant_id, reservation_id).await?;
    let cancelled = reservations::cancel(&state.pool, tenant_id, reservation_id).await?;

    audit::record(
        &state,
        &principal,
        "reservation.cancel",
        "reservation",
        Some(reservation_id.to_string()),
        serde_json::to_value(&before).ok(),
        serde_json::to_value(&cancelled).ok(),
        &meta,
    )
    .await?;

    if let Err(e) = evaluator::evaluate_space(&state, tenant_id, cancelled.space_id).await {
        tracing::warn!(space_id = %cancelled.space_id, error = %e, "re-evaluation after cancel failed");
    }

    Ok(Json(cancelled))
}
