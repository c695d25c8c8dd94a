//! Display policy and admin override queries.

use sqlx::PgPool;
use uuid::Uuid;

use parklane_core::policy::DisplayPolicy;
use parklane_core::statemachine::OverrideKind;

use crate::error::ApiError;
use crate::models::{AdminOverride, DisplayPolicyRow};

use super::tenant_tx;

/// The active policy for a tenant, or the built-in default.
pub async fn get(pool: &PgPool, tenant_id: Uuid) -> Result<(DisplayPolicy, i32), ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let row = sqlx::query_as::<_, DisplayPolicyRow>(
        "SELECT * FROM display_policies WHERE tenant_id = $1",
    )
    .bind(tenant_id)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;

    match row {
        Some(row) => {
            let policy: DisplayPolicy = serde_json::from_value(row.policy)
                .map_err(|e| ApiError::Internal(format!("stored policy corrupt: {e}")))?;
            Ok((policy, row.version))
        }
        None => Ok((DisplayPolicy::default(), 0)),
    }
}

/// Replace the tenant's policy atomically, bumping the version.
pub async fn put(
    pool: &PgPool,
    tenant_id: Uuid,
    policy: &DisplayPolicy,
) -> Result<DisplayPolicyRow, ApiError> {
    let value = serde_json::to_value(policy)
        .map_err(|e| ApiError::Internal(format!("policy encode: {e}")))?;
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let row = sqlx::query_as::<_, DisplayPolicyRow>(
        r"INSERT INTO display_policies (tenant_id, policy, version)
          VALUES ($1, $2, 1)
          ON CONFLICT (tenant_id) DO UPDATE SET
              policy = EXCLUDED.policy,
              version = display_policies.version + 1,
              updated_at = now()
          RETURNING *",
    )
    .bind(tenant_id)
    .bind(value)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(row)
}

// ── Admin overrides ──────────────────────────────────────────────────

/// The active override for a space, strongest kind first.
pub async fn active_override(
    pool: &PgPool,
    tenant_id: Uuid,
    space_id: Uuid,
) -> Result<Option<OverrideKind>, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let kind: Option<(String,)> = sqlx::query_as(
        r"SELECT kind FROM admin_overrides
          WHERE tenant_id = $1 AND space_id = $2
            AND cleared_at IS NULL
            AND starts_at <= now()
            AND (ends_at IS NULL OR ends_at > now())
          ORDER BY CASE kind WHEN 'out_of_service' THEN 0 ELSE 1 END
          LIMIT 1",
    )
    .bind(tenant_id)
    .bind(space_id)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(kind.and_then(|(k,)| match k.as_str() {
        "out_of_service" => Some(OverrideKind::OutOfService),
        "blocked" => Some(OverrideKind::Blocked),
        _ => None,
    }))
}

/// Create an override, replacing any live one on the space.
pub async fn set_override(
    pool: &PgPool,
    tenant_id: Uuid,
    space_id: Uuid,
    kind: &str,
    ends_at: Option<chrono::DateTime<chrono::Utc>>,
    created_by: Option<Uuid>,
) -> Result<AdminOverride, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;

    sqlx::query(
        r"UPDATE admin_overrides SET cleared_at = now()
          WHERE tenant_id = $1 AND space_id = $2 AND cleared_at IS NULL",
    )
    .bind(tenant_id)
    .bind(space_id)
    .execute(&mut *tx)
    .await?;

    let row = sqlx::query_as::<_, AdminOverride>(
        r"INSERT INTO admin_overrides (tenant_id, space_id, kind, starts_at, ends_at, created_by)
          VALUES ($1, $2, $3, now(), $4, $5)
          RETURNING *",
    )
    .bind(tenant_id)
    .bind(space_id)
    .bind(kind)
    .bind(ends_at)
    .bind(created_by)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(row)
}

/// Clear the live override on a space.
pub async fn clear_override(
    pool: &PgPool,
    tenant_id: Uuid,
    space_id: Uuid,
) -> Result<u64, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let result = sqlx::query(
        r"UPDATE admin_overrides SET cleared_at = now()
          WHERE tenant_id = $1 AND space_id = $2 AND cleared_at IS NULL",
    )
    .bind(tenant_id)
    .bind(space_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(result.rows_affected())
}
