//! Reservation queries.
//!
//! Overlap is the database's job: the reservations table carries a
//! range-exclusion constraint over `(space_id, [starts_at, ends_at))`
//! restricted to live statuses. The engine performs no application-level
//! pre-check — two racing creates see exactly one success and one
//! conflict.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::Reservation;

use super::{system_tx, tenant_tx};

/// Find a prior reservation by idempotency key.
pub async fn find_by_request_id(
    pool: &PgPool,
    tenant_id: Uuid,
    request_id: &str,
) -> Result<Option<Reservation>, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let row = sqlx::query_as::<_, Reservation>(
        "SELECT * FROM reservations WHERE tenant_id = $1 AND request_id = $2",
    )
    .bind(tenant_id)
    .bind(request_id)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(row)
}

/// Insert a confirmed reservation.
///
/// An overlapping live reservation surfaces as the `reservation-overlap`
/// conflict via the exclusion constraint.
pub async fn insert(
    pool: &PgPool,
    tenant_id: Uuid,
    space_id: Uuid,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    requester: &str,
    request_id: Option<&str>,
) -> Result<Reservation, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let row = sqlx::query_as::<_, Reservation>(
        r"INSERT INTO reservations (tenant_id, space_id, starts_at, ends_at, status, request_id, requester)
          VALUES ($1, $2, $3, $4, 'confirmed', $5, $6)
          RETURNING *",
    )
    .bind(tenant_id)
    .bind(space_id)
    .bind(starts_at)
    .bind(ends_at)
    .bind(request_id)
    .bind(requester)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(row)
}

/// Get a reservation within a tenant.
pub async fn get(
    pool: &PgPool,
    tenant_id: Uuid,
    reservation_id: Uuid,
) -> Result<Reservation, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let row = sqlx::query_as::<_, Reservation>(
        "SELECT * FROM reservations WHERE id = $1 AND tenant_id = $2",
    )
    .bind(reservation_id)
    .bind(tenant_id)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    row.ok_or_else(|| ApiError::NotFound("reservation not found".to_owned()))
}

/// Cancel a live reservation.
pub async fn cancel(
    pool: &PgPool,
    tenant_id: Uuid,
    reservation_id: Uuid,
) -> Result<Reservation, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let row = sqlx::query_as::<_, Reservation>(
        r"UPDATE reservations SET status = 'cancelled', updated_at = now()
          WHERE id = $1 AND tenant_id = $2 AND status IN ('pending', 'confirmed')
          RETURNING *",
    )
    .bind(reservation_id)
    .bind(tenant_id)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    row.ok_or_else(|| ApiError::Conflict {
        code: "reservation-state",
        message: "reservation is not cancellable".to_owned(),
    })
}

/// Expire every live reservation whose end has passed.
///
/// Returns `(tenant, space)` pairs needing re-evaluation.
pub async fn expire_ended(pool: &PgPool) -> Result<Vec<(Uuid, Uuid)>, ApiError> {
    let mut tx = system_tx(pool).await?;
    let rows: Vec<(Uuid, Uuid)> = sqlx::query_as(
        r"UPDATE reservations SET status = 'expired', updated_at = now()
          WHERE status IN ('pending', 'confirmed') AND ends_at <= now()
          RETURNING tenant_id, space_id",
    )
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(rows)
}

/// Live reservations overlapping `[from, to)` on a space, sorted by start.
pub async fn overlapping(
    pool: &PgPool,
    tenant_id: Uuid,
    space_id: Uuid,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<Reservation>, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let rows = sqlx::query_as::<_, Reservation>(
        r"SELECT * FROM reservations
          WHERE tenant_id = $1 AND space_id = $2
            AND status IN ('pending', 'confirmed')
            AND starts_at < $4 AND ends_at > $3
          ORDER BY starts_at",
    )
    .bind(tenant_id)
    .bind(space_id)
    .bind(from)
    .bind(to)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(rows)
}

/// The live reservation covering `now`, if any.
pub async fn active_at(
    pool: &PgPool,
    tenant_id: Uuid,
    space_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<Reservation>, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let row = sqlx::query_as::<_, Reservation>(
        r"SELECT * FROM reservations
          WHERE tenant_id = $1 AND space_id = $2
            AND status IN ('pending', 'confirmed')
            AND starts_at <= $3 AND ends_at > $3
          LIMIT 1",
    )
    .bind(tenant_id)
    .bind(space_id)
    .bind(now)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(row)
}

/// Live reservations whose start falls within a horizon window, for the
/// boundary-timer job.
pub async fn starting_within(
    pool: &PgPool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Reservation>, ApiError> {
    let mut tx = system_tx(pool).await?;
    let rows = sqlx::query_as::<_, Reservation>(
        r"SELECT * FROM reservations
          WHERE status IN ('pending', 'confirmed')
            AND starts_at > $1 AND starts_at <= $2
          ORDER BY starts_at
          LIMIT $3",
    )
    .bind(from)
    .bind(to)
    .bind(limit)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(rows)
}

/// Start of the next live reservation strictly after `now`.
pub async fn next_start_after(
    pool: &PgPool,
    tenant_id: Uuid,
    space_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;
    let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
        r"SELECT MIN(starts_at) FROM reservations
          WHERE tenant_id = $1 AND space_id = $2
            AND status IN ('pending', 'confirmed')
            AND starts_at > $3
          HAVING MIN(starts_at) IS NOT NULL",
    )
    .bind(tenant_id)
    .bind(space_id)
    .bind(now)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(row.map(|(t,)| t))
}
