//! Tenant queries.
//!
//! The tenants table itself is global (platform-owned, no `tenant_id`
//! column), so plain lookups run directly on the pool. Anything joining
//! into tenant-scoped tables goes through a scoped transaction.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::Tenant;

use super::{system_tx, tenant_tx};

/// Get an active tenant by id.
pub async fn get(pool: &PgPool, tenant_id: Uuid) -> Result<Tenant, ApiError> {
    sqlx::query_as::<_, Tenant>(
        "SELECT * FROM tenants WHERE id = $1 AND archived_at IS NULL",
    )
    .bind(tenant_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::NotFound("tenant not found".to_owned()))
}

/// Get an active tenant by slug.
pub async fn get_by_slug(pool: &PgPool, slug: &str) -> Result<Tenant, ApiError> {
    sqlx::query_as::<_, Tenant>(
        "SELECT * FROM tenants WHERE slug = $1 AND archived_at IS NULL",
    )
    .bind(slug)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::NotFound("tenant not found".to_owned()))
}

/// Resolve the tenant owning the sensor with this EUI, if registered.
///
/// Runs as a platform actor: ingest has no tenant context yet, that is
/// exactly what this lookup establishes.
pub async fn get_by_sensor_eui(pool: &PgPool, eui: &str) -> Result<Option<Tenant>, ApiError> {
    let mut tx = system_tx(pool).await?;
    let tenant = sqlx::query_as::<_, Tenant>(
        r"SELECT t.* FROM tenants t
          JOIN devices d ON d.tenant_id = t.id
          WHERE d.eui = $1 AND d.role = 'sensor' AND d.deleted_at IS NULL
            AND t.archived_at IS NULL",
    )
    .bind(eui)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(tenant)
}

/// Usage counts checked against quota limits at mutation time.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct QuotaUsage {
    pub spaces: i64,
    pub devices: i64,
    pub users: i64,
}

/// Current usage for a tenant.
pub async fn quota_usage(pool: &PgPool, tenant_id: Uuid) -> Result<QuotaUsage, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let (spaces, devices, users): (i64, i64, i64) = sqlx::query_as(
        r"SELECT
            (SELECT COUNT(*) FROM spaces WHERE tenant_id = $1 AND deleted_at IS NULL),
            (SELECT COUNT(*) FROM devices WHERE tenant_id = $1 AND deleted_at IS NULL),
            (SELECT COUNT(*) FROM memberships WHERE tenant_id = $1)",
    )
    .bind(tenant_id)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(QuotaUsage {
        spaces,
        devices,
        users,
    })
}

/// Enforce the device quota before registering a new device.
pub async fn check_device_quota(pool: &PgPool, tenant: &Tenant) -> Result<(), ApiError> {
    let usage = quota_usage(pool, tenant.id).await?;
    if usage.devices >= i64::from(tenant.quota_max_devices) {
        return Err(ApiError::Validation(format!(
            "device quota reached ({} of {})",
            usage.devices, tenant.quota_max_devices
        )));
    }
    Ok(())
}
