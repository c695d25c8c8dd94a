//! Site and space queries.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{Site, Space};

use super::tenant_tx;

/// Get a space by id within a tenant.
pub async fn get(pool: &PgPool, tenant_id: Uuid, space_id: Uuid) -> Result<Space, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let row = sqlx::query_as::<_, Space>(
        "SELECT * FROM spaces WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL",
    )
    .bind(space_id)
    .bind(tenant_id)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    row.ok_or_else(|| ApiError::NotFound("space not found".to_owned()))
}

/// List spaces for a tenant.
pub async fn list(pool: &PgPool, tenant_id: Uuid) -> Result<Vec<Space>, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let rows = sqlx::query_as::<_, Space>(
        "SELECT * FROM spaces WHERE tenant_id = $1 AND deleted_at IS NULL ORDER BY code",
    )
    .bind(tenant_id)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(rows)
}

/// Get the site a space belongs to.
pub async fn get_site(pool: &PgPool, tenant_id: Uuid, site_id: Uuid) -> Result<Site, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let row = sqlx::query_as::<_, Site>(
        "SELECT * FROM sites WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL",
    )
    .bind(site_id)
    .bind(tenant_id)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    row.ok_or_else(|| ApiError::NotFound("site not found".to_owned()))
}

/// The space a sensor device currently serves, if any.
pub async fn for_sensor_device(
    pool: &PgPool,
    tenant_id: Uuid,
    device_id: Uuid,
) -> Result<Option<Space>, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let row = sqlx::query_as::<_, Space>(
        r"SELECT * FROM spaces
          WHERE sensor_device_id = $1 AND tenant_id = $2 AND deleted_at IS NULL",
    )
    .bind(device_id)
    .bind(tenant_id)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(row)
}

/// Set the space state, returning the previous state string.
///
/// No-op (returns `None`) when the state is unchanged, so callers can
/// skip the state-change record and downlink on convergence.
pub async fn set_state(
    pool: &PgPool,
    tenant_id: Uuid,
    space_id: Uuid,
    next_state: &str,
) -> Result<Option<String>, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let prev: Option<(String,)> = sqlx::query_as(
        r"UPDATE spaces SET state = $3, updated_at = now()
          WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL AND state <> $3
          RETURNING (SELECT state FROM spaces WHERE id = $1)",
    )
    .bind(space_id)
    .bind(tenant_id)
    .bind(next_state)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(prev.map(|(s,)| s))
}

/// Attach a device to a space in the given role column.
pub async fn assign_device(
    pool: &PgPool,
    tenant_id: Uuid,
    space_id: Uuid,
    device_id: Uuid,
    role: &str,
) -> Result<Space, ApiError> {
    let column = match role {
        "sensor" => "sensor_device_id",
        "display" => "display_device_id",
        other => {
            return Err(ApiError::Validation(format!(
                "unknown device role: {other}"
            )))
        }
    };
    let mut tx = tenant_tx(pool, tenant_id).await?;

    let space = sqlx::query_as::<_, Space>(&format!(
        r"UPDATE spaces SET {column} = $3, updated_at = now()
          WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL
          RETURNING *",
    ))
    .bind(space_id)
    .bind(tenant_id)
    .bind(device_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| ApiError::NotFound("space not found".to_owned()))?;

    let updated = sqlx::query(
        r"UPDATE devices SET space_id = $3, lifecycle = 'assigned'
          WHERE id = $1 AND tenant_id = $2 AND role = $4 AND deleted_at IS NULL",
    )
    .bind(device_id)
    .bind(tenant_id)
    .bind(space_id)
    .bind(role)
    .execute(&mut *tx)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(ApiError::NotFound("device not found".to_owned()));
    }

    tx.commit().await?;
    Ok(space)
}

/// Detach a device from a space in the given role column.
pub async fn unassign_device(
    pool: &PgPool,
    tenant_id: Uuid,
    space_id: Uuid,
    role: &str,
) -> Result<Space, ApiError> {
    let column = match role {
        "sensor" => "sensor_device_id",
        "display" => "display_device_id",
        other => {
            return Err(ApiError::Validation(format!(
                "unknown device role: {other}"
            )))
        }
    };
    let mut tx = tenant_tx(pool, tenant_id).await?;

    let space = sqlx::query_as::<_, Space>(&format!(
        r"UPDATE spaces SET {column} = NULL, updated_at = now()
          WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL
          RETURNING *",
    ))
    .bind(space_id)
    .bind(tenant_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| ApiError::NotFound("space not found".to_owned()))?;

    sqlx::query(
        r"UPDATE devices SET space_id = NULL, lifecycle = 'provisioned'
          WHERE space_id = $1 AND tenant_id = $2 AND role = $3 AND deleted_at IS NULL",
    )
    .bind(space_id)
    .bind(tenant_id)
    .bind(role)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(space)
}
