//! Audit ledger read surface.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use parklane_core::auth::{Principal, Role};

use crate::auth::require_tenant;
use crate::error::ApiError;
use crate::models::AuditEntry;
use crate::repository::audit;
use crate::state::AppState;

/// Build the audit router (authenticated).
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/audit", get(list))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
    /// Platform admins may inspect another tenant's ledger.
    tenant: Option<Uuid>,
}

fn default_limit() -> i64 {
    100
}

/// `GET /audit` — tenant-scoped ledger, newest first.
async fn list(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    principal.require_role(Role::Admin)?;
    let own_tenant = require_tenant(&principal)?;

    let tenant_id = match query.tenant {
        Some(other) if other != own_tenant => {
            principal.require_role(Role::PlatformAdmin)?;
            other
        }
        _ => own_tenant,
    };

    let limit = query.limit.clamp(1, 1000);
    let offset = query.offset.max(0);
    Ok(Json(
        audit::list(&state.pool, tenant_id, limit, offset).await?,
    ))
}
