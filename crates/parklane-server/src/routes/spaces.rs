//! Space routes: read surface, actuation, device assignment, overrides,
//! and availability.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use parklane_core::auth::{Principal, Role};
use parklane_core::encode::{content_hash, display_frame, PORT_DISPLAY};
use parklane_core::statemachine::SpaceState;
use parklane_core::Eui;

use crate::audit::{self, RequestMeta};
use crate::auth::require_tenant;
use crate::error::ApiError;
use crate::evaluator;
use crate::models::{Reservation, Space};
use crate::repository::{devices, downlinks, policy, reservations, spaces};
use crate::state::AppState;

/// Build the spaces router (authenticated).
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/spaces", get(list_spaces))
        .route("/spaces/{id}", get(get_space))
        .route("/spaces/{id}/actuate", post(actuate))
        .route("/spaces/{id}/availability", get(availability))
        .route(
            "/spaces/{id}/sensor",
            post(assign_sensor).delete(unassign_sensor),
        )
        .route(
            "/spaces/{id}/display",
            post(assign_display).delete(unassign_display),
        )
        .route(
            "/spaces/{id}/override",
            post(set_override).delete(clear_override),
        )
}

/// `GET /spaces` — list the tenant's spaces.
async fn list_spaces(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<Space>>, ApiError> {
    principal.require_scope("spaces:read")?;
    let tenant_id = require_tenant(&principal)?;
    Ok(Json(spaces::list(&state.pool, tenant_id).await?))
}

/// `GET /spaces/{id}` — one space, within the caller's tenant only.
async fn get_space(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(space_id): Path<Uuid>,
) -> Result<Json<Space>, ApiError> {
    principal.require_scope("spaces:read")?;
    let tenant_id = require_tenant(&principal)?;
    Ok(Json(spaces::get(&state.pool, tenant_id, space_id).await?))
}

#[derive(Debug, Deserialize)]
struct ActuateRequest {
    /// Force a specific state's frame instead of the computed target.
    force_state: Option<String>,
}

/// `POST /spaces/{id}/actuate` — push the current (or forced) target to
/// the display. Returns 202: delivery is the dispatcher's business.
async fn actuate(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Extension(meta): Extension<RequestMeta>,
    Path(space_id): Path<Uuid>,
    Json(body): Json<ActuateRequest>,
) -> Result<StatusCode, ApiError> {
    principal.require_scope("spaces:write")?;
    let tenant_id = require_tenant(&principal)?;
    let space = spaces::get(&state.pool, tenant_id, space_id).await?;

    match &body.force_state {
        None => {
            // Drop the cached display state so the evaluator re-enqueues
            // even when it believes the display is already correct.
            if let Some(display) =
                devices::display_for_space(&state.pool, tenant_id, space_id).await?
            {
                state
                    .coord
                    .delete(&evaluator::display_cache_key(&display.eui))
                    .await?;
            }
            evaluator::evaluate_space(&state, tenant_id, space_id).await?;
        }
        Some(forced) => {
            let target_state: SpaceState = serde_json::from_value(serde_json::json!(forced))
                .map_err(|_| ApiError::Validation(format!("unknown state: {forced}")))?;
            let (display_policy, _) = policy::get(&state.pool, tenant_id).await?;
            let color = match target_state {
                SpaceState::Free => display_policy.free,
                SpaceState::Occupied => display_policy.occupied,
                SpaceState::Reserved => display_policy.reserved,
                SpaceState::Maintenance => display_policy.out_of_service,
            };
            let display = devices::display_for_space(&state.pool, tenant_id, space_id)
                .await?
                .ok_or_else(|| ApiError::Validation("space has no display device".to_owned()))?;
            let eui = Eui::from_str(&display.eui)
                .map_err(|e| ApiError::Internal(format!("stored display EUI invalid: {e}")))?;
            let payload = display_frame(color, None);
            let hash = content_hash(eui, PORT_DISPLAY, &payload);
            downlinks::enqueue(
                &state.pool,
                tenant_id,
                &display.eui,
                None,
                i32::from(PORT_DISPLAY),
                &payload,
                false,
                &hash,
            )
            .await?;
        }
    }

    audit::record(
        &state,
        &principal,
        "space.actuate",
        "space",
        Some(space.id.to_string()),
        None,
        Some(serde_json::json!({ "force_state": body.force_state })),
        &meta,
    )
    .await?;

    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct AvailabilityQuery {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct AvailabilityResponse {
    available: bool,
    overlapping: Vec<Reservation>,
}

/// `GET /spaces/{id}/availability?from=…&to=…`
async fn availability(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(space_id): Path<Uuid>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<AvailabilityResponse>, ApiError> {
    principal.require_scope("reservations:read")?;
    let tenant_id = require_tenant(&principal)?;
    if query.to <= query.from {
        return Err(ApiError::Validation("to must be after from".to_owned()));
    }
    spaces::get(&state.pool, tenant_id, space_id).await?;

    let overlapping =
        reservations::overlapping(&state.pool, tenant_id, space_id, query.from, query.to).await?;
    Ok(Json(AvailabilityResponse {
        available: overlapping.is_empty(),
        overlapping,
    }))
}

#[derive(Debug, Deserialize)]
struct AssignDeviceRequest {
    device_id: Uuid,
}

async fn assign_sensor(
    state: State<Arc<AppState>>,
    principal: Extension<Principal>,
    meta: Extension<RequestMeta>,
    path: Path<Uuid>,
    body: Json<AssignDeviceRequest>,
) -> Result<Json<Space>, ApiError> {
    assign_device(state, principal, meta, path, body, "sensor").await
}

async fn assign_display(
    state: State<Arc<AppState>>,
    principal: Extension<Principal>,
    meta: Extension<RequestMeta>,
    path: Path<Uuid>,
    body: Json<AssignDeviceRequest>,
) -> Result<Json<Space>, ApiError> {
    assign_device(state, principal, meta, path, body, "display").await
}

/// `POST /spaces/{id}/sensor` / `…/display` — attach a device.
///
/// Tenant alignment is structural: both lookups are scoped to the
/// caller's tenant, so a foreign device or space is simply not found.
async fn assign_device(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Extension(meta): Extension<RequestMeta>,
    Path(space_id): Path<Uuid>,
    Json(body): Json<AssignDeviceRequest>,
    role: &'static str,
) -> Result<Json<Space>, ApiError> {
    principal.require_scope("spaces:write")?;
    let tenant_id = require_tenant(&principal)?;

    let device = devices::get(&state.pool, tenant_id, body.device_id).await?;
    if device.role != role {
        return Err(ApiError::Validation(format!(
            "device is a {} record, expected {role}",
            device.role
        )));
    }
    if device.space_id.is_some_and(|s| s != space_id) {
        return Err(ApiError::Conflict {
            code: "device-assigned",
            message: "device is already assigned to another space".to_owned(),
        });
    }

    let space =
        spaces::assign_device(&state.pool, tenant_id, space_id, body.device_id, role).await?;

    audit::record(
        &state,
        &principal,
        &format!("space.assign_{role}"),
        "space",
        Some(space_id.to_string()),
        None,
        Some(serde_json::json!({ "device_id": body.device_id })),
        &meta,
    )
    .await?;

    evaluate_quietly(&state, tenant_id, space_id).await;
    Ok(Json(space))
}

async fn unassign_sensor(
    state: State<Arc<AppState>>,
    principal: Extension<Principal>,
    meta: Extension<RequestMeta>,
    path: Path<Uuid>,
) -> Result<Json<Space>, ApiError> {
    unassign_device(state, principal, meta, path, "sensor").await
}

async fn unassign_display(
    state: State<Arc<AppState>>,
    principal: Extension<Principal>,
    meta: Extension<RequestMeta>,
    path: Path<Uuid>,
) -> Result<Json<Space>, ApiError> {
    unassign_device(state, principal, meta, path, "display").await
}

/// `DELETE /spaces/{id}/sensor` / `…/display` — detach a device.
async fn unassign_device(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Extension(meta): Extension<RequestMeta>,
    Path(space_id): Path<Uuid>,
    role: &'static str,
) -> Result<Json<Space>, ApiError> {
    principal.require_scope("spaces:write")?;
    let tenant_id = require_tenant(&principal)?;

    let space = spaces::unassign_device(&state.pool, tenant_id, space_id, role).await?;

    audit::record(
        &state,
        &principal,
        &format!("space.unassign_{role}"),
        "space",
        Some(space_id.to_string()),
        None,
        None,
        &meta,
    )
    .await?;

    Ok(Json(space))
}

#[derive(Debug, Deserialize)]
struct OverrideRequest {
    /// `blocked` or `out_of_service`.
    kind: String,
    ends_at: Option<DateTime<Utc>>,
}

/// `POST /spaces/{id}/override` — force MAINTENANCE.
async fn set_override(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Extension(meta): Extension<RequestMeta>,
    Path(space_id): Path<Uuid>,
    Json(body): Json<OverrideRequest>,
) -> Result<Json<crate::models::AdminOverride>, ApiError> {
    principal.require_role(Role::Admin)?;
    let tenant_id = require_tenant(&principal)?;

    if body.kind != "blocked" && body.kind != "out_of_service" {
        return Err(ApiError::Validation(format!(
            "unknown override kind: {}",
            body.kind
        )));
    }
    if body.ends_at.is_some_and(|end| end <= Utc::now()) {
        return Err(ApiError::Validation("ends_at is in the past".to_owned()));
    }
    spaces::get(&state.pool, tenant_id, space_id).await?;

    let created_by = match &principal {
        Principal::UserSession { user_id, .. } => Some(*user_id),
        _ => None,
    };
    let row = policy::set_override(
        &state.pool,
        tenant_id,
        space_id,
        &body.kind,
        body.ends_at,
        created_by,
    )
    .await?;

    audit::record(
        &state,
        &principal,
        "space.override_set",
        "space",
        Some(space_id.to_string()),
        None,
        Some(serde_json::json!({ "kind": body.kind, "ends_at": body.ends_at })),
        &meta,
    )
    .await?;

    evaluate_quietly(&state, tenant_id, space_id).await;
    Ok(Json(row))
}

/// `DELETE /spaces/{id}/override` — lift the override.
async fn clear_override(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Extension(meta): Extension<RequestMeta>,
    Path(space_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    principal.require_role(Role::Admin)?;
    let tenant_id = require_tenant(&principal)?;
    spaces::get(&state.pool, tenant_id, space_id).await?;

    let cleared = policy::clear_override(&state.pool, tenant_id, space_id).await?;
    if cleared == 0 {
        return Err(ApiError::NotFound("no active override".to_owned()));
    }

    audit::record(
        &state,
        &principal,
        "space.override_clear",
        "space",
        Some(space_id.to_string()),
        None,
        None,
        &meta,
    )
    .await?;

    evaluate_quietly(&state, tenant_id, space_id).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Trigger a re-evaluation without failing the request — the sweep heals
/// anything missed.
async fn evaluate_quietly(state: &AppState, tenant_id: Uuid, space_id: Uuid) {
    if let Err(e) = evaluator::evaluate_space(state, tenant_id, space_id).await {
        tracing::warn!(%space_id, error = %e, "post-mutation re-evaluation failed");
    }
}
