//! Device and gateway queries.
//!
//! Several of these serve platform actors — ingest resolution before a
//! tenant is known, the dispatcher, the sweeps — and run under the
//! bypass scope; everything keyed by an explicit tenant runs under that
//! tenant's scope.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{Device, Gateway};

use super::{system_tx, tenant_tx};

/// Get a live device by EUI and role, across tenants (ingest resolution).
pub async fn get_by_eui_role(
    pool: &PgPool,
    eui: &str,
    role: &str,
) -> Result<Option<Device>, ApiError> {
    let mut tx = system_tx(pool).await?;
    let device = sqlx::query_as::<_, Device>(
        "SELECT * FROM devices WHERE eui = $1 AND role = $2 AND deleted_at IS NULL",
    )
    .bind(eui)
    .bind(role)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(device)
}

/// Get a device by id within a tenant.
pub async fn get(pool: &PgPool, tenant_id: Uuid, device_id: Uuid) -> Result<Device, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let row = sqlx::query_as::<_, Device>(
        "SELECT * FROM devices WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL",
    )
    .bind(device_id)
    .bind(tenant_id)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    row.ok_or_else(|| ApiError::NotFound("device not found".to_owned()))
}

/// Register a device (orphan claim or provisioning).
pub async fn register(
    pool: &PgPool,
    tenant_id: Uuid,
    eui: &str,
    role: &str,
    device_type: &str,
) -> Result<Device, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let device = sqlx::query_as::<_, Device>(
        r"INSERT INTO devices (tenant_id, eui, role, device_type, lifecycle)
          VALUES ($1, $2, $3, $4, 'provisioned')
          RETURNING *",
    )
    .bind(tenant_id)
    .bind(eui)
    .bind(role)
    .bind(device_type)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(device)
}

/// Mark a device heard-from and active.
pub async fn touch_seen(pool: &PgPool, device_id: Uuid, at: DateTime<Utc>) -> Result<(), ApiError> {
    let mut tx = system_tx(pool).await?;
    sqlx::query(
        r"UPDATE devices SET last_seen_at = $2,
              lifecycle = CASE WHEN lifecycle IN ('provisioned', 'assigned') THEN 'active' ELSE lifecycle END
          WHERE id = $1",
    )
    .bind(device_id)
    .bind(at)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Display device for a space, if assigned.
pub async fn display_for_space(
    pool: &PgPool,
    tenant_id: Uuid,
    space_id: Uuid,
) -> Result<Option<Device>, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let device = sqlx::query_as::<_, Device>(
        r"SELECT d.* FROM devices d
          JOIN spaces s ON s.display_device_id = d.id
          WHERE s.id = $1 AND s.tenant_id = $2 AND d.deleted_at IS NULL",
    )
    .bind(space_id)
    .bind(tenant_id)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(device)
}

/// All spaces with an assigned display, for the reconciliation sweep.
pub async fn spaces_with_displays(pool: &PgPool) -> Result<Vec<(Uuid, Uuid)>, ApiError> {
    let mut tx = system_tx(pool).await?;
    let rows: Vec<(Uuid, Uuid)> = sqlx::query_as(
        r"SELECT s.tenant_id, s.id FROM spaces s
          WHERE s.display_device_id IS NOT NULL AND s.deleted_at IS NULL",
    )
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(rows)
}

/// Assigned display devices that have not uplinked within `silent_secs`,
/// candidates for a status poll.
pub async fn silent_displays(
    pool: &PgPool,
    silent_secs: i64,
) -> Result<Vec<Device>, ApiError> {
    let mut tx = system_tx(pool).await?;
    let rows = sqlx::query_as::<_, Device>(
        r"SELECT * FROM devices
          WHERE role = 'display' AND space_id IS NOT NULL AND deleted_at IS NULL
            AND (last_seen_at IS NULL OR last_seen_at < now() - make_interval(secs => $1::float8))",
    )
    .bind(silent_secs)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(rows)
}

// ── Gateways ─────────────────────────────────────────────────────────

/// Record a gateway sighting from an uplink, creating the row on first
/// contact.
///
/// Platform-scoped: gateway EUIs are globally unique, and the uplink
/// that carries the sighting may come from a different tenant than the
/// one that first registered the gateway.
pub async fn gateway_seen(
    pool: &PgPool,
    tenant_id: Uuid,
    eui: &str,
    at: DateTime<Utc>,
) -> Result<(), ApiError> {
    let mut tx = system_tx(pool).await?;
    sqlx::query(
        r"INSERT INTO gateways (tenant_id, eui, last_seen_at)
          VALUES ($1, $2, $3)
          ON CONFLICT (eui) DO UPDATE SET last_seen_at = GREATEST(gateways.last_seen_at, EXCLUDED.last_seen_at)",
    )
    .bind(tenant_id)
    .bind(eui)
    .bind(at)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Get a gateway by EUI (dispatcher pre-flight).
pub async fn gateway_by_eui(pool: &PgPool, eui: &str) -> Result<Option<Gateway>, ApiError> {
    let mut tx = system_tx(pool).await?;
    let gw = sqlx::query_as::<_, Gateway>("SELECT * FROM gateways WHERE eui = $1")
        .bind(eui)
        .fetch_optional(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(gw)
}

/// Gateways silent for at least `offline_secs`.
pub async fn offline_gateways(
    pool: &PgPool,
    offline_secs: i64,
) -> Result<Vec<Gateway>, ApiError> {
    let mut tx = system_tx(pool).await?;
    let rows = sqlx::query_as::<_, Gateway>(
        r"SELECT * FROM gateways
          WHERE last_seen_at IS NULL OR last_seen_at < now() - make_interval(secs => $1::float8)",
    )
    .bind(offline_secs)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(rows)
}

/// The most recent gateway that heard this device, with its last-seen
/// time. Used as the dispatch pre-flight check.
pub async fn last_gateway_for_device(
    pool: &PgPool,
    device_eui: &str,
) -> Result<Option<Gateway>, ApiError> {
    let mut tx = system_tx(pool).await?;
    let gw = sqlx::query_as::<_, Gateway>(
        r"SELECT g.* FROM gateways g
          JOIN sensor_readings r ON r.gateway_eui = g.eui
          WHERE r.device_eui = $1
          ORDER BY r.received_at DESC
          LIMIT 1",
    )
    .bind(device_eui)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(gw)
}
