//! Orphan device and orphan device-type queries.
//!
//! Orphans are platform-wide by definition — an EUI with no owner — so
//! these tables carry no `tenant_id` and sit outside row-level
//! security; queries run directly on the pool.

use sqlx::PgPool;

use crate::error::ApiError;
use crate::models::{OrphanDevice, OrphanDeviceType};

/// Fields observed in an unregistered device's uplink.
#[derive(Debug, Clone)]
pub struct OrphanSighting<'a> {
    pub eui: &'a str,
    pub fcnt: i64,
    pub port: i32,
    pub payload_hex: &'a str,
    pub rssi: Option<i32>,
    pub snr: Option<f32>,
}

/// Upsert an orphan sighting with conditional frame-counter advancement.
///
/// Returns `None` when `fcnt` does not advance past the recorded one —
/// the uplink is a duplicate. The conditional update runs inside the
/// upsert so concurrent sightings cannot lose counts.
pub async fn upsert_sighting(
    pool: &PgPool,
    sighting: &OrphanSighting<'_>,
) -> Result<Option<OrphanDevice>, ApiError> {
    let row = sqlx::query_as::<_, OrphanDevice>(
        r"INSERT INTO orphan_devices
              (eui, last_fcnt, uplink_count, last_port, last_payload_hex, last_rssi, last_snr, first_seen_at, last_seen_at)
          VALUES ($1, $2, 1, $3, $4, $5, $6, now(), now())
          ON CONFLICT (eui) DO UPDATE SET
              last_fcnt = EXCLUDED.last_fcnt,
              uplink_count = orphan_devices.uplink_count + 1,
              last_port = EXCLUDED.last_port,
              last_payload_hex = EXCLUDED.last_payload_hex,
              last_rssi = EXCLUDED.last_rssi,
              last_snr = EXCLUDED.last_snr,
              last_seen_at = now()
          WHERE EXCLUDED.last_fcnt > orphan_devices.last_fcnt
          RETURNING *",
    )
    .bind(sighting.eui)
    .bind(sighting.fcnt)
    .bind(sighting.port)
    .bind(sighting.payload_hex)
    .bind(sighting.rssi)
    .bind(sighting.snr)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Get an orphan by EUI.
pub async fn get(pool: &PgPool, eui: &str) -> Result<Option<OrphanDevice>, ApiError> {
    let row = sqlx::query_as::<_, OrphanDevice>("SELECT * FROM orphan_devices WHERE eui = $1")
        .bind(eui)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// List orphans, most recently heard first.
pub async fn list(pool: &PgPool, limit: i64) -> Result<Vec<OrphanDevice>, ApiError> {
    let rows = sqlx::query_as::<_, OrphanDevice>(
        "SELECT * FROM orphan_devices ORDER BY last_seen_at DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Remove an orphan row (after a claim).
pub async fn remove(pool: &PgPool, eui: &str) -> Result<(), ApiError> {
    sqlx::query("DELETE FROM orphan_devices WHERE eui = $1")
        .bind(eui)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete orphans not heard from within the retention window.
pub async fn purge_inactive(pool: &PgPool, days: i64) -> Result<u64, ApiError> {
    let result = sqlx::query(
        "DELETE FROM orphan_devices WHERE last_seen_at < now() - make_interval(days => $1::int)",
    )
    .bind(days)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

// ── Orphan device types ──────────────────────────────────────────────

/// Record an uplink from a device whose type has no registered decoder.
pub async fn record_orphan_type(
    pool: &PgPool,
    device_type: &str,
    port: i32,
    payload_hex: &str,
) -> Result<(), ApiError> {
    sqlx::query(
        r"INSERT INTO orphan_device_types (device_type, sample_port, sample_payload_hex, seen_count, first_seen_at, last_seen_at)
          VALUES ($1, $2, $3, 1, now(), now())
          ON CONFLICT (device_type) DO UPDATE SET
              seen_count = orphan_device_types.seen_count + 1,
              last_seen_at = now()",
    )
    .bind(device_type)
    .bind(port)
    .bind(payload_hex)
    .execute(pool)
    .await?;
    Ok(())
}

/// List unconfirmed device types.
pub async fn list_orphan_types(pool: &PgPool) -> Result<Vec<OrphanDeviceType>, ApiError> {
    let rows = sqlx::query_as::<_, OrphanDeviceType>(
        "SELECT * FROM orphan_device_types ORDER BY last_seen_at DESC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
