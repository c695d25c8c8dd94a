//! Service key routes.
//!
//! Keys are shown in plaintext exactly once at creation; after that only
//! the hash and a display prefix exist.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use parklane_core::auth::{
    generate_opaque, hash_opaque, opaque_prefix, Principal, Role, SERVICE_KEY_PREFIX,
};

use crate::audit::{self, RequestMeta};
use crate::auth::require_tenant;
use crate::error::ApiError;
use crate::models::ServiceKey;
use crate::repository::service_keys;
use crate::state::AppState;

/// Scopes a key may carry.
const VALID_SCOPES: &[&str] = &[
    "spaces:read",
    "spaces:write",
    "reservations:read",
    "reservations:write",
    "policy:read",
    "policy:write",
    "webhook:ingest",
    "admin:*",
];

/// Build the service keys router (authenticated).
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/service-keys", post(create).get(list))
        .route("/service-keys/{id}/revoke", post(revoke))
}

#[derive(Debug, Deserialize)]
struct CreateRequest {
    name: String,
    scopes: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CreateResponse {
    key: ServiceKey,
    /// Shown exactly once. Store it securely.
    plaintext_key: String,
}

/// `POST /service-keys` — mint a key for the caller's tenant.
async fn create(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Extension(meta): Extension<RequestMeta>,
    Json(body): Json<CreateRequest>,
) -> Result<Json<CreateResponse>, ApiError> {
    principal.require_role(Role::Admin)?;
    let tenant_id = require_tenant(&principal)?;

    if body.name.trim().is_empty() {
        return Err(ApiError::Validation("name is required".to_owned()));
    }
    if body.scopes.is_empty() {
        return Err(ApiError::Validation("at least one scope is required".to_owned()));
    }
    for scope in &body.scopes {
        if !VALID_SCOPES.contains(&scope.as_str()) {
            return Err(ApiError::Validation(format!(
                "invalid scope '{scope}' — must be one of: {}",
                VALID_SCOPES.join(", ")
            )));
        }
    }

    let plaintext = generate_opaque(SERVICE_KEY_PREFIX);
    let created_by = match &principal {
        Principal::UserSession { user_id, .. } => Some(*user_id),
        _ => None,
    };
    let key = service_keys::create(
        &state.pool,
        tenant_id,
        body.name.trim(),
        &hash_opaque(&plaintext),
        &opaque_prefix(&plaintext),
        &body.scopes,
        created_by,
    )
    .await?;

    audit::record(
        &state,
        &principal,
        "service_key.create",
        "service_key",
        Some(key.id.to_string()),
        None,
        Some(serde_json::json!({ "name": key.name, "scopes": key.scopes })),
        &meta,
    )
    .await?;

    Ok(Json(CreateResponse {
        key,
        plaintext_key: plaintext,
    }))
}

/// `GET /service-keys`
async fn list(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<ServiceKey>>, ApiError> {
    principal.require_role(Role::Admin)?;
    let tenant_id = require_tenant(&principal)?;
    Ok(Json(service_keys::list(&state.pool, tenant_id).await?))
}

/// `POST /service-keys/{id}/revoke`
async fn revoke(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Extension(meta): Extension<RequestMeta>,
    Path(key_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    principal.require_role(Role::Admin)?;
    let tenant_id = require_tenant(&principal)?;

    service_keys::revoke(&state.pool, tenant_id, key_id).await?;

    audit::record(
        &state,
        &principal,
        "service_key.revoke",
        "service_key",
        Some(key_id.to_string()),
        None,
        None,
        &meta,
    )
    .await?;

    Ok(Json(serde_json::json!({ "ok": true })))
}
