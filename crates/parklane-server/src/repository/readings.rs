//! Sensor reading queries.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::SensorReading;

use super::{system_tx, tenant_tx};

/// Fields of a new reading row.
#[derive(Debug, Clone)]
pub struct NewReading<'a> {
    pub tenant_id: Uuid,
    pub device_eui: &'a str,
    pub fcnt: i64,
    pub occupancy: &'a str,
    pub battery_pct: Option<i16>,
    pub temperature_c: Option<f32>,
    pub rssi: Option<i32>,
    pub snr: Option<f32>,
    pub gateway_eui: Option<&'a str>,
    pub received_at: DateTime<Utc>,
}

/// Idempotently insert a reading.
///
/// Returns `None` when `(tenant, device, fcnt)` already exists — the
/// caller counts a duplicate, not an error. Under two concurrent copies
/// exactly one insert wins the unique index.
pub async fn insert(pool: &PgPool, new: &NewReading<'_>) -> Result<Option<SensorReading>, ApiError> {
    let mut tx = tenant_tx(pool, new.tenant_id).await?;
    let row = sqlx::query_as::<_, SensorReading>(
        r"INSERT INTO sensor_readings
              (tenant_id, device_eui, fcnt, occupancy, battery_pct, temperature_c, rssi, snr, gateway_eui, received_at)
          VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
          ON CONFLICT (tenant_id, device_eui, fcnt) DO NOTHING
          RETURNING *",
    )
    .bind(new.tenant_id)
    .bind(new.device_eui)
    .bind(new.fcnt)
    .bind(new.occupancy)
    .bind(new.battery_pct)
    .bind(new.temperature_c)
    .bind(new.rssi)
    .bind(new.snr)
    .bind(new.gateway_eui)
    .bind(new.received_at)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(row)
}

/// Most recent reading for a device.
pub async fn latest_for_device(
    pool: &PgPool,
    tenant_id: Uuid,
    device_eui: &str,
) -> Result<Option<SensorReading>, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let row = sqlx::query_as::<_, SensorReading>(
        r"SELECT * FROM sensor_readings
          WHERE tenant_id = $1 AND device_eui = $2
          ORDER BY received_at DESC
          LIMIT 1",
    )
    .bind(tenant_id)
    .bind(device_eui)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(row)
}

/// Delete readings older than the retention window.
pub async fn purge_older_than(pool: &PgPool, days: i64) -> Result<u64, ApiError> {
    let mut tx = system_tx(pool).await?;
    let result = sqlx::query(
        "DELETE FROM sensor_readings WHERE received_at < now() - make_interval(days => $1::int)",
    )
    .bind(days)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(result.rows_affected())
}
