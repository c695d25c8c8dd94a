//! Display policy routes.
//!
//! A policy replaces the previous one atomically and bumps the
//! policy-version coordination key; every space with a display is then
//! re-evaluated so color changes roll out without a deployment.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::Serialize;

use parklane_core::auth::{Principal, Role};
use parklane_core::policy::DisplayPolicy;

use crate::audit::{self, RequestMeta};
use crate::auth::require_tenant;
use crate::error::ApiError;
use crate::evaluator;
use crate::repository::{devices, policy};
use crate::state::AppState;

/// Build the policy router (authenticated).
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/policy", get(get_policy).put(put_policy))
}

#[derive(Debug, Serialize)]
struct PolicyResponse {
    policy: DisplayPolicy,
    version: i32,
}

/// `GET /policy` — the tenant's active policy (or the default).
async fn get_policy(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<PolicyResponse>, ApiError> {
    principal.require_scope("policy:read")?;
    let tenant_id = require_tenant(&principal)?;
    let (policy, version) = policy::get(&state.pool, tenant_id).await?;
    Ok(Json(PolicyResponse { policy, version }))
}

/// `PUT /policy` — replace the tenant's policy.
async fn put_policy(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Extension(meta): Extension<RequestMeta>,
    Json(body): Json<DisplayPolicy>,
) -> Result<Json<PolicyResponse>, ApiError> {
    principal.require_role(Role::Admin)?;
    let tenant_id = require_tenant(&principal)?;

    if body.debounce_window_sec <= 0 || body.unknown_timeout_sec <= 0 || body.reserved_soon_sec < 0
    {
        return Err(ApiError::Validation(
            "policy thresholds must be positive".to_owned(),
        ));
    }

    let (before, _) = policy::get(&state.pool, tenant_id).await?;
    let row = policy::put(&state.pool, tenant_id, &body).await?;

    // Dispatchers watch this key to refresh their cached policy.
    state
        .coord
        .put(
            &format!("policy-version:{tenant_id}"),
            row.version.to_string().as_bytes(),
            None,
        )
        .await?;

    audit::record(
        &state,
        &principal,
        "policy.update",
        "display_policy",
        Some(row.id.to_string()),
        serde_json::to_value(&before).ok(),
        serde_json::to_value(&body).ok(),
        &meta,
    )
    .await?;

    // Roll the new colors out.
    for (space_tenant, space_id) in devices::spaces_with_displays(&state.pool).await? {
        if space_tenant != tenant_id {
            continue;
        }
        if let Err(e) = evaluator::evaluate_space(&state, tenant_id, space_id).await {
            tracing::warn!(%space_id, error = %e, "re-evaluation after policy update failed");
        }
    }

    Ok(Json(PolicyResponse {
        policy: body,
        version: row.version,
    }))
}
