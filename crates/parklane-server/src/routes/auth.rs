//! Authentication routes.
//!
//! Login and refresh are public; tenant switching and `/me` require an
//! authenticated principal. Login failures are uniform — the caller
//! cannot distinguish a wrong password from an unknown email.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use parklane_core::auth::{verify_password, Principal, Role};

use crate::audit::{self, RequestMeta};
use crate::auth::{self, TokenPair};
use crate::error::ApiError;
use crate::repository::{tenants, users};
use crate::state::AppState;

/// Public routes: login and refresh.
pub fn public_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
}

/// Authenticated routes: tenant switch and identity introspection.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/switch-tenant", post(switch_tenant))
        .route("/me", get(me))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
    /// Required when the user belongs to more than one tenant.
    tenant_slug: Option<String>,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    #[serde(flatten)]
    pair: TokenPair,
    tenant_id: uuid::Uuid,
    role: String,
}

/// `POST /auth/login` — email + password to a token pair.
async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let invalid = || ApiError::Unauthenticated("invalid credentials".to_owned());

    let user = users::get_by_email(&state.pool, &body.email)
        .await?
        .ok_or_else(invalid)?;
    if !verify_password(&body.password, &user.password_hash)? {
        return Err(invalid());
    }

    let memberships = users::memberships(&state.pool, user.id).await?;
    let tenant_id = match (&body.tenant_slug, memberships.as_slice()) {
        (Some(slug), _) => tenants::get_by_slug(&state.pool, slug).await?.id,
        (None, [only]) => only.tenant_id,
        (None, []) if user.is_platform_admin => {
            return Err(ApiError::Validation(
                "tenant_slug is required for platform admins".to_owned(),
            ));
        }
        (None, []) => return Err(invalid()),
        (None, _) => {
            return Err(ApiError::Validation(
                "tenant_slug is required when belonging to several tenants".to_owned(),
            ));
        }
    };

    let role = auth::resolve_role(&state, &user, tenant_id).await?;
    let pair = auth::issue_pair(&state, user.id, tenant_id, role, false, None).await?;

    let principal = Principal::UserSession {
        user_id: user.id,
        tenant_id,
        role,
        cross_tenant: false,
    };
    audit::record(
        &state,
        &principal,
        "session.login",
        "session",
        Some(user.id.to_string()),
        None,
        None,
        &RequestMeta::default(),
    )
    .await?;

    Ok(Json(LoginResponse {
        pair,
        tenant_id,
        role: role.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

/// `POST /auth/refresh` — rotate a refresh token.
///
/// Reusing an already-rotated token within the reuse window revokes the
/// whole family.
async fn refresh(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<TokenPair>, ApiError> {
    let pair = auth::rotate_refresh(&state, &body.refresh_token).await?;
    Ok(Json(pair))
}

#[derive(Debug, Deserialize)]
struct SwitchTenantRequest {
    tenant_slug: String,
}

/// `POST /auth/switch-tenant` — platform admins only. Issues a pair
/// scoped to the target tenant with the cross-tenant flag set.
async fn switch_tenant(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Extension(meta): Extension<RequestMeta>,
    Json(body): Json<SwitchTenantRequest>,
) -> Result<Json<TokenPair>, ApiError> {
    principal.require_role(Role::PlatformAdmin)?;
    let Principal::UserSession { user_id, .. } = &principal else {
        return Err(ApiError::Forbidden(
            "tenant switching requires a user session".to_owned(),
        ));
    };

    let target = tenants::get_by_slug(&state.pool, &body.tenant_slug).await?;
    let pair = auth::issue_pair(
        &state,
        *user_id,
        target.id,
        Role::PlatformAdmin,
        true,
        None,
    )
    .await?;

    audit::record(
        &state,
        &principal,
        "session.switch_tenant",
        "tenant",
        Some(target.id.to_string()),
        None,
        Some(serde_json::json!({ "target_slug": target.slug })),
        &meta,
    )
    .await?;

    Ok(Json(pair))
}

#[derive(Debug, Serialize)]
struct MeResponse {
    principal: String,
    tenant_id: Option<uuid::Uuid>,
    role: Option<String>,
    scopes: Option<Vec<String>>,
    cross_tenant: bool,
    quota_usage: Option<tenants::QuotaUsage>,
}

/// `GET /me` — who am I, where am I, what may I do.
async fn me(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<MeResponse>, ApiError> {
    let quota_usage = match principal.tenant_id() {
        Some(tenant_id) => Some(tenants::quota_usage(&state.pool, tenant_id).await?),
        None => None,
    };
    let (role, scopes, cross_tenant) = match &principal {
        Principal::UserSession {
            role, cross_tenant, ..
        } => (Some(role.to_string()), None, *cross_tenant),
        Principal::ServiceKey { scopes, .. } => (None, Some(scopes.clone()), false),
        Principal::Anonymous => (None, None, false),
    };

    Ok(Json(MeResponse {
        principal: principal.actor(),
        tenant_id: principal.tenant_id(),
        role,
        scopes,
        cross_tenant,
        quota_usage,
    }))
}
