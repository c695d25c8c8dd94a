//! Audit ledger and state-change history queries.
//!
//! Both tables are append-only. The audit table additionally carries a
//! trigger that rejects UPDATE and DELETE; retention only removes rows
//! older than the window.

use sqlx::types::JsonValue;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{AuditEntry, StateChange};

use super::{system_tx, tenant_tx};

/// Fields of a new audit entry.
#[derive(Debug, Clone)]
pub struct NewAuditEntry<'a> {
    pub tenant_id: Option<Uuid>,
    pub actor: &'a str,
    /// `resource.verb`, e.g. `reservation.create`.
    pub action: &'a str,
    pub resource: &'a str,
    pub resource_id: Option<String>,
    pub before: Option<JsonValue>,
    pub after: Option<JsonValue>,
    pub request_id: Option<&'a str>,
    pub ip: Option<&'a str>,
}

/// Append an audit entry, scoped to the acting tenant when there is one.
pub async fn write(pool: &PgPool, entry: &NewAuditEntry<'_>) -> Result<(), ApiError> {
    let mut tx = match entry.tenant_id {
        Some(tenant_id) => tenant_tx(pool, tenant_id).await?,
        None => system_tx(pool).await?,
    };
    sqlx::query(
        r"INSERT INTO audit_log (tenant_id, actor, action, resource, resource_id, before, after, request_id, ip)
          VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(entry.tenant_id)
    .bind(entry.actor)
    .bind(entry.action)
    .bind(entry.resource)
    .bind(entry.resource_id.as_deref())
    .bind(entry.before.as_ref())
    .bind(entry.after.as_ref())
    .bind(entry.request_id)
    .bind(entry.ip)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// List audit entries for a tenant, newest first.
pub async fn list(
    pool: &PgPool,
    tenant_id: Uuid,
    limit: i64,
    offset: i64,
) -> Result<Vec<AuditEntry>, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let rows = sqlx::query_as::<_, AuditEntry>(
        r"SELECT * FROM audit_log
          WHERE tenant_id = $1
          ORDER BY created_at DESC
          LIMIT $2 OFFSET $3",
    )
    .bind(tenant_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(rows)
}

/// Delete audit rows older than the retention window. Never updates.
///
/// The immutability trigger only admits deletes from a transaction that
/// sets `parklane.allow_purge`.
pub async fn purge_older_than(pool: &PgPool, days: i64) -> Result<u64, ApiError> {
    let mut tx = system_tx(pool).await?;
    sqlx::query("SET LOCAL parklane.allow_purge = 'on'")
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query(
        "DELETE FROM audit_log WHERE created_at < now() - make_interval(days => $1::int)",
    )
    .bind(days)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(result.rows_affected())
}

// ── State changes ────────────────────────────────────────────────────

/// Append a space state transition.
pub async fn record_state_change(
    pool: &PgPool,
    tenant_id: Uuid,
    space_id: Uuid,
    prev_state: &str,
    next_state: &str,
    reason: &str,
    priority: i16,
) -> Result<(), ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    sqlx::query(
        r"INSERT INTO space_state_changes (tenant_id, space_id, prev_state, next_state, reason, priority)
          VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(tenant_id)
    .bind(space_id)
    .bind(prev_state)
    .bind(next_state)
    .bind(reason)
    .bind(priority)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Recent transitions for a space.
pub async fn state_changes(
    pool: &PgPool,
    tenant_id: Uuid,
    space_id: Uuid,
    limit: i64,
) -> Result<Vec<StateChange>, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let rows = sqlx::query_as::<_, StateChange>(
        r"SELECT * FROM space_state_changes
          WHERE tenant_id = $1 AND space_id = $2
          ORDER BY created_at DESC
          LIMIT $3",
    )
    .bind(tenant_id)
    .bind(space_id)
    .bind(limit)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(rows)
}

/// Delete state changes older than the retention window.
pub async fn purge_state_changes(pool: &PgPool, days: i64) -> Result<u64, ApiError> {
    let mut tx = system_tx(pool).await?;
    let result = sqlx::query(
        "DELETE FROM space_state_changes WHERE created_at < now() - make_interval(days => $1::int)",
    )
    .bind(days)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(result.rows_affected())
}
