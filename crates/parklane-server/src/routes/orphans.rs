//! Orphan device routes.
//!
//! Orphans are platform-wide observations (an EUI with no owner), so the
//! listing requires an admin; claiming one registers it under the
//! caller's tenant.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use parklane_core::auth::{Principal, Role};
use parklane_core::Eui;

use crate::audit::{self, RequestMeta};
use crate::auth::require_tenant;
use crate::error::ApiError;
use crate::evaluator;
use crate::models::{Device, OrphanDevice, OrphanDeviceType};
use crate::repository::{devices, orphans, spaces, tenants};
use crate::state::AppState;

/// Build the orphans router (authenticated).
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orphan-devices", get(list))
        .route("/orphan-devices/{eui}/assign", post(assign))
        .route("/orphan-device-types", get(list_types))
}

/// `GET /orphan-devices`
async fn list(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<OrphanDevice>>, ApiError> {
    principal.require_role(Role::Admin)?;
    Ok(Json(orphans::list(&state.pool, 200).await?))
}

/// `GET /orphan-device-types` — payload types awaiting confirmation.
async fn list_types(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<OrphanDeviceType>>, ApiError> {
    principal.require_role(Role::Admin)?;
    Ok(Json(orphans::list_orphan_types(&state.pool).await?))
}

#[derive(Debug, Deserialize)]
struct AssignRequest {
    /// `sensor` or `display`.
    role: String,
    device_type: String,
    /// Optionally bind the new device to a space immediately.
    space_id: Option<Uuid>,
}

/// `POST /orphan-devices/{eui}/assign` — register the EUI under the
/// caller's tenant and drop the orphan record.
async fn assign(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Extension(meta): Extension<RequestMeta>,
    Path(eui): Path<String>,
    Json(body): Json<AssignRequest>,
) -> Result<Json<Device>, ApiError> {
    principal.require_role(Role::Admin)?;
    let tenant_id = require_tenant(&principal)?;

    if body.role != "sensor" && body.role != "display" {
        return Err(ApiError::Validation(format!(
            "unknown device role: {}",
            body.role
        )));
    }
    let eui = Eui::from_str(&eui)
        .map_err(|e| ApiError::Validation(e.to_string()))?
        .to_string();

    orphans::get(&state.pool, &eui)
        .await?
        .ok_or_else(|| ApiError::NotFound("orphan device not found".to_owned()))?;

    let tenant = tenants::get(&state.pool, tenant_id).await?;
    tenants::check_device_quota(&state.pool, &tenant).await?;

    let device =
        devices::register(&state.pool, tenant_id, &eui, &body.role, &body.device_type).await?;

    if let Some(space_id) = body.space_id {
        spaces::get(&state.pool, tenant_id, space_id).await?;
        spaces::assign_device(&state.pool, tenant_id, space_id, device.id, &body.role).await?;
        if let Err(e) = evaluator::evaluate_space(&state, tenant_id, space_id).await {
            tracing::warn!(%space_id, error = %e, "re-evaluation after claim failed");
        }
    }

    orphans::remove(&state.pool, &eui).await?;

    audit::record(
        &state,
        &principal,
        "device.claim_orphan",
        "device",
        Some(device.id.to_string()),
        None,
        serde_json::to_value(&device).ok(),
        &meta,
    )
    .await?;

    Ok(Json(device))
}
