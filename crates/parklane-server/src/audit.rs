//! Audit writer.
//!
//! Thin wrapper that shapes a privileged mutation into an append-only
//! ledger entry. Actions are `resource.verb` strings; before/after
//! snapshots are JSON. Failures propagate — a mutation that cannot be
//! audited is reported, not silently unaudited.

use serde_json::Value;
use uuid::Uuid;

use parklane_core::auth::Principal;

use crate::error::ApiError;
use crate::repository::audit::{self, NewAuditEntry};
use crate::state::AppState;

/// Context captured from the request for audit correlation.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub request_id: Option<String>,
    pub ip: Option<String>,
}

/// Record a privileged mutation.
#[allow(clippy::too_many_arguments)]
pub async fn record(
    state: &AppState,
    principal: &Principal,
    action: &str,
    resource: &str,
    resource_id: Option<String>,
    before: Option<Value>,
    after: Option<Value>,
    meta: &RequestMeta,
) -> Result<(), ApiError> {
    let actor = principal.actor();
    let entry = NewAuditEntry {
        tenant_id: principal.tenant_id(),
        actor: &actor,
        action,
        resource,
        resource_id,
        before,
        after,
        request_id: meta.request_id.as_deref(),
        ip: meta.ip.as_deref(),
    };
    audit::write(&state.pool, &entry).await
}

/// Record a system-actor mutation (background jobs, webhook pipeline).
pub async fn record_system(
    state: &AppState,
    tenant_id: Option<Uuid>,
    action: &str,
    resource: &str,
    resource_id: Option<String>,
    after: Option<Value>,
) -> Result<(), ApiError> {
    let entry = NewAuditEntry {
        tenant_id,
        actor: "system",
        action,
        resource,
        resource_id,
        before: None,
        after,
        request_id: None,
        ip: None,
    };
    audit::write(&state.pool, &entry).await
}
