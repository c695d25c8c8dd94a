//! Service key queries.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::ServiceKey;

use super::{system_tx, tenant_tx};

/// Create a service key.
pub async fn create(
    pool: &PgPool,
    tenant_id: Uuid,
    name: &str,
    key_hash: &str,
    key_prefix: &str,
    scopes: &[String],
    created_by: Option<Uuid>,
) -> Result<ServiceKey, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let key = sqlx::query_as::<_, ServiceKey>(
        r"INSERT INTO service_keys (tenant_id, name, key_hash, key_prefix, scopes, created_by)
          VALUES ($1, $2, $3, $4, $5, $6)
          RETURNING *",
    )
    .bind(tenant_id)
    .bind(name)
    .bind(key_hash)
    .bind(key_prefix)
    .bind(scopes)
    .bind(created_by)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(key)
}

/// Look up a live service key by its SHA-256 hash.
///
/// Runs as the platform actor: this is the authentication step, the
/// key's tenant is not known until the row is found.
pub async fn lookup(pool: &PgPool, key_hash: &str) -> Result<Option<ServiceKey>, ApiError> {
    let mut tx = system_tx(pool).await?;
    let key = sqlx::query_as::<_, ServiceKey>(
        "SELECT * FROM service_keys WHERE key_hash = $1 AND revoked_at IS NULL",
    )
    .bind(key_hash)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(key)
}

/// Update `last_used_at` for a key.
pub async fn touch(pool: &PgPool, key_id: Uuid) -> Result<(), ApiError> {
    let mut tx = system_tx(pool).await?;
    sqlx::query("UPDATE service_keys SET last_used_at = now() WHERE id = $1")
        .bind(key_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// List keys for a tenant.
pub async fn list(pool: &PgPool, tenant_id: Uuid) -> Result<Vec<ServiceKey>, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let keys = sqlx::query_as::<_, ServiceKey>(
        "SELECT * FROM service_keys WHERE tenant_id = $1 ORDER BY created_at DESC",
    )
    .bind(tenant_id)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(keys)
}

/// Revoke a key within its tenant.
pub async fn revoke(pool: &PgPool, tenant_id: Uuid, key_id: Uuid) -> Result<(), ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let result = sqlx::query(
        "UPDATE service_keys SET revoked_at = now() WHERE id = $1 AND tenant_id = $2 AND revoked_at IS NULL",
    )
    .bind(key_id)
    .bind(tenant_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::NotFound("service key not found".to_owned()));
    }
    Ok(())
}
