//! Request authentication.
//!
//! Two credential paths reach the API:
//!
//! 1. **Access token**: `Authorization: Bearer <jwt>` from login or
//!    refresh. Claims carry (user, tenant, role, cross-tenant flag).
//! 2. **Service key**: `Authorization: Bearer plk_…`, looked up by its
//!    SHA-256 hash, bound to a single tenant with explicit scopes.
//!
//! The resolved [`Principal`] is injected into request extensions; every
//! handler reads its tenant scope from there and nowhere else.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{Duration, Utc};
use uuid::Uuid;

use parklane_core::auth::{
    self as core_auth, Principal, Role, REFRESH_TOKEN_PREFIX, SERVICE_KEY_PREFIX,
};

use crate::audit::RequestMeta;
use crate::error::ApiError;
use crate::repository::{service_keys, users};
use crate::state::AppState;

/// A freshly issued access/refresh pair.
#[derive(Debug, serde::Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in_secs: i64,
}

/// Issue a token pair for a user within a tenant, starting a new
/// refresh family (login, tenant switch) or continuing one (rotation).
pub async fn issue_pair(
    state: &AppState,
    user_id: Uuid,
    tenant_id: Uuid,
    role: Role,
    cross_tenant: bool,
    family_id: Option<Uuid>,
) -> Result<TokenPair, ApiError> {
    let now = Utc::now();
    let access_token = core_auth::issue_access_token(
        state.config.token_secret.as_bytes(),
        user_id,
        tenant_id,
        role,
        cross_tenant,
        now,
        Duration::seconds(state.config.access_token_ttl_secs),
    )?;

    let refresh_plain = core_auth::generate_opaque(REFRESH_TOKEN_PREFIX);
    let refresh_hash = core_auth::hash_opaque(&refresh_plain);
    let family = family_id.unwrap_or_else(Uuid::new_v4);
    let expires_at = now + Duration::days(state.config.refresh_token_ttl_days);

    users::insert_refresh_token(
        &state.pool,
        user_id,
        tenant_id,
        family,
        &refresh_hash,
        expires_at,
    )
    .await?;

    Ok(TokenPair {
        access_token,
        refresh_token: refresh_plain,
        expires_in_secs: state.config.access_token_ttl_secs,
    })
}

/// Rotate a refresh token, with reuse detection.
///
/// Presenting an already-rotated token within the reuse window is
/// treated as theft: the entire family is revoked and the caller gets a
/// generic unauthenticated error.
pub async fn rotate_refresh(state: &AppState, presented: &str) -> Result<TokenPair, ApiError> {
    if !presented.starts_with(REFRESH_TOKEN_PREFIX) {
        return Err(ApiError::Unauthenticated("invalid refresh token".to_owned()));
    }
    let hash = core_auth::hash_opaque(presented);
    let Some(row) = users::find_refresh_token(&state.pool, &hash).await? else {
        return Err(ApiError::Unauthenticated("invalid refresh token".to_owned()));
    };

    let now = Utc::now();

    if row.revoked_at.is_some() {
        return Err(ApiError::Unauthenticated("refresh token revoked".to_owned()));
    }

    if let Some(rotated_at) = row.rotated_at {
        let within_window =
            now.signed_duration_since(rotated_at).num_seconds() <= users::REUSE_WINDOW_SECS;
        if within_window {
            let revoked = users::revoke_family(&state.pool, row.family_id).await?;
            tracing::warn!(
                user_id = %row.user_id,
                family_id = %row.family_id,
                revoked,
                "refresh token reuse detected, family revoked"
            );
        }
        return Err(ApiError::Unauthenticated("invalid refresh token".to_owned()));
    }

    if row.expires_at <= now {
        return Err(ApiError::Unauthenticated("refresh token expired".to_owned()));
    }

    // Role may have changed since issue — re-resolve the membership.
    let user = users::get(&state.pool, row.user_id).await?;
    let role = resolve_role(state, &user, row.tenant_id).await?;

    users::mark_rotated(&state.pool, row.id).await?;
    issue_pair(
        state,
        row.user_id,
        row.tenant_id,
        role,
        user.is_platform_admin && role == Role::PlatformAdmin,
        Some(row.family_id),
    )
    .await
}

/// Effective role of a user within a tenant.
///
/// Platform admins act as `PlatformAdmin` everywhere; everyone else
/// needs a membership.
pub async fn resolve_role(
    state: &AppState,
    user: &crate::models::User,
    tenant_id: Uuid,
) -> Result<Role, ApiError> {
    if user.is_platform_admin {
        return Ok(Role::PlatformAdmin);
    }
    let membership = users::membership(&state.pool, user.id, tenant_id)
        .await?
        .ok_or_else(|| ApiError::Forbidden("no membership in this tenant".to_owned()))?;
    membership.role.parse().map_err(ApiError::from)
}

/// Extract audit metadata from request headers.
#[must_use]
pub fn request_meta(req: &Request) -> RequestMeta {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };
    RequestMeta {
        request_id: header("x-request-id"),
        ip: header("x-forwarded-for")
            .and_then(|v| v.split(',').next().map(str::trim).map(str::to_owned)),
    }
}

/// Axum middleware that authenticates API requests.
///
/// Injects [`Principal`] and [`RequestMeta`] into request extensions.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let Some(header) = header else {
        return Err(ApiError::Unauthenticated(
            "missing Authorization header".to_owned(),
        ));
    };

    let token = header.strip_prefix("Bearer ").ok_or_else(|| {
        ApiError::Unauthenticated("Authorization header must use Bearer scheme".to_owned())
    })?;

    let principal = authenticate(&state, token).await?;
    let meta = request_meta(&req);
    req.extensions_mut().insert(principal);
    req.extensions_mut().insert(meta);

    Ok(next.run(req).await)
}

/// Resolve a bearer credential into a [`Principal`].
pub async fn authenticate(state: &Arc<AppState>, token: &str) -> Result<Principal, ApiError> {
    if token.starts_with(SERVICE_KEY_PREFIX) {
        let hash = core_auth::hash_opaque(token);
        let Some(key) = service_keys::lookup(&state.pool, &hash).await? else {
            return Err(ApiError::Unauthenticated(
                "invalid or revoked service key".to_owned(),
            ));
        };

        // Update last_used_at off the request path.
        let pool = state.pool.clone();
        let key_id = key.id;
        tokio::spawn(async move {
            let _ = service_keys::touch(&pool, key_id).await;
        });

        Ok(Principal::ServiceKey {
            key_id: key.id,
            tenant_id: key.tenant_id,
            scopes: key.scopes,
        })
    } else {
        let claims =
            core_auth::decode_access_token(state.config.token_secret.as_bytes(), token)?;
        Ok(Principal::UserSession {
            user_id: claims.sub,
            tenant_id: claims.ten,
            role: claims.rol,
            cross_tenant: claims.xta,
        })
    }
}

/// The tenant a principal is bound to, or `Unauthenticated` for anonymous.
pub fn require_tenant(principal: &Principal) -> Result<Uuid, ApiError> {
    principal
        .tenant_id()
        .ok_or_else(|| ApiError::Unauthenticated("authentication required".to_owned()))
}
