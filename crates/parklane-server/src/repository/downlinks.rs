//! Downlink queue queries.
//!
//! The queue is durable and coalescing: at most one `pending` envelope
//! per (device, content-hash), enforced by a partial unique index. A new
//! target for a device supersedes whatever was pending on the same port
//! — newest target wins. Acquisition locks with `SKIP LOCKED` so several
//! dispatcher workers cooperate, and a device never has more than one
//! `sending` envelope at a time.
//!
//! Enqueues run under the acting tenant's scope; everything the
//! dispatcher and the sweeps do is platform-scoped, since they walk the
//! queue across tenants.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::DownlinkEnvelope;

use super::{system_tx, tenant_tx};

/// Result of an enqueue call.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// A new envelope went in; `superseded` counts cancelled prior targets.
    Created {
        envelope: DownlinkEnvelope,
        superseded: u64,
    },
    /// An identical target was already pending.
    Coalesced(DownlinkEnvelope),
}

impl EnqueueOutcome {
    /// The envelope now representing the target.
    #[must_use]
    pub fn envelope(&self) -> &DownlinkEnvelope {
        match self {
            Self::Created { envelope, .. } | Self::Coalesced(envelope) => envelope,
        }
    }
}

/// Enqueue a display instruction with coalescing.
#[allow(clippy::too_many_arguments)]
pub async fn enqueue(
    pool: &PgPool,
    tenant_id: Uuid,
    device_eui: &str,
    gateway_eui: Option<&str>,
    port: i32,
    payload: &[u8],
    confirmed: bool,
    content_hash: &str,
) -> Result<EnqueueOutcome, ApiError> {
    let mut tx = tenant_tx(pool, tenant_id).await?;

    // Newest-target-wins is scoped per port: a status poll must not
    // cancel a pending display frame.
    let pending = sqlx::query_as::<_, DownlinkEnvelope>(
        r"SELECT * FROM downlink_envelopes
          WHERE device_eui = $1 AND port = $2 AND state = 'pending'
          FOR UPDATE",
    )
    .bind(device_eui)
    .bind(port)
    .fetch_all(&mut *tx)
    .await?;

    if let Some(existing) = pending.iter().find(|e| e.content_hash == content_hash) {
        tx.commit().await?;
        return Ok(EnqueueOutcome::Coalesced(existing.clone()));
    }

    let superseded = if pending.is_empty() {
        0
    } else {
        sqlx::query(
            r"UPDATE downlink_envelopes SET state = 'superseded', updated_at = now()
              WHERE device_eui = $1 AND port = $2 AND state = 'pending'",
        )
        .bind(device_eui)
        .bind(port)
        .execute(&mut *tx)
        .await?
        .rows_affected()
    };

    let inserted = sqlx::query_as::<_, DownlinkEnvelope>(
        r"INSERT INTO downlink_envelopes
              (tenant_id, device_eui, gateway_eui, port, payload, confirmed, content_hash, state, scheduled_at)
          VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', now())
          ON CONFLICT (device_eui, content_hash) WHERE state = 'pending' DO NOTHING
          RETURNING *",
    )
    .bind(tenant_id)
    .bind(device_eui)
    .bind(gateway_eui)
    .bind(port)
    .bind(payload)
    .bind(confirmed)
    .bind(content_hash)
    .fetch_optional(&mut *tx)
    .await?;

    tx.commit().await?;

    match inserted {
        Some(envelope) => Ok(EnqueueOutcome::Created {
            envelope,
            superseded,
        }),
        None => {
            // A concurrent enqueue won the unique index with the same target.
            let mut tx = tenant_tx(pool, tenant_id).await?;
            let existing = sqlx::query_as::<_, DownlinkEnvelope>(
                r"SELECT * FROM downlink_envelopes
                  WHERE device_eui = $1 AND content_hash = $2 AND state = 'pending'",
            )
            .bind(device_eui)
            .bind(content_hash)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(EnqueueOutcome::Coalesced(existing))
        }
    }
}

/// Claim the next due envelope, transitioning it to `sending`.
///
/// Skips devices that already have an envelope in flight and rows locked
/// by sibling workers.
pub async fn acquire_next(pool: &PgPool) -> Result<Option<DownlinkEnvelope>, ApiError> {
    let mut tx = system_tx(pool).await?;
    let row = sqlx::query_as::<_, DownlinkEnvelope>(
        r"UPDATE downlink_envelopes e
          SET state = 'sending', attempts = e.attempts + 1, updated_at = now()
          WHERE e.id = (
              SELECT d.id FROM downlink_envelopes d
              WHERE d.state = 'pending' AND d.scheduled_at <= now()
                AND NOT EXISTS (
                    SELECT 1 FROM downlink_envelopes s
                    WHERE s.device_eui = d.device_eui AND s.state = 'sending'
                )
              ORDER BY d.scheduled_at, d.created_at
              FOR UPDATE SKIP LOCKED
              LIMIT 1
          )
          RETURNING e.*",
    )
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(row)
}

/// Return a claimed envelope to `pending` with a future `scheduled_at`.
///
/// Used for gateway-offline deferral and rate-limit pushback. Deferrals
/// do not count against the terminal attempt budget.
pub async fn defer(
    pool: &PgPool,
    envelope_id: Uuid,
    until: DateTime<Utc>,
    reason: &str,
) -> Result<(), ApiError> {
    let mut tx = system_tx(pool).await?;
    sqlx::query(
        r"UPDATE downlink_envelopes
          SET state = 'pending', attempts = GREATEST(attempts - 1, 0),
              defer_count = defer_count + 1,
              scheduled_at = $2, last_error = $3, updated_at = now()
          WHERE id = $1",
    )
    .bind(envelope_id)
    .bind(until)
    .bind(reason)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Record a successful hand-off to the LNS.
pub async fn mark_sent(pool: &PgPool, envelope_id: Uuid, lns_fcnt: i64) -> Result<(), ApiError> {
    let mut tx = system_tx(pool).await?;
    sqlx::query(
        r"UPDATE downlink_envelopes
          SET lns_fcnt = $2, last_error = NULL, updated_at = now()
          WHERE id = $1 AND state = 'sending'",
    )
    .bind(envelope_id)
    .bind(lns_fcnt)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Requeue a send that failed transiently.
pub async fn requeue_after_error(
    pool: &PgPool,
    envelope_id: Uuid,
    until: DateTime<Utc>,
    error: &str,
) -> Result<(), ApiError> {
    let mut tx = system_tx(pool).await?;
    sqlx::query(
        r"UPDATE downlink_envelopes
          SET state = 'pending', scheduled_at = $2, last_error = $3, updated_at = now()
          WHERE id = $1",
    )
    .bind(envelope_id)
    .bind(until)
    .bind(error)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Mark an envelope terminally failed.
pub async fn fail(pool: &PgPool, envelope_id: Uuid, error: &str) -> Result<(), ApiError> {
    let mut tx = system_tx(pool).await?;
    sqlx::query(
        r"UPDATE downlink_envelopes
          SET state = 'failed', last_error = $2, updated_at = now()
          WHERE id = $1",
    )
    .bind(envelope_id)
    .bind(error)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Acknowledge in-flight envelopes whose payload sets the color a
/// dual-role device just reported.
pub async fn ack_by_reported_color(
    pool: &PgPool,
    device_eui: &str,
    rgb: [u8; 3],
) -> Result<u64, ApiError> {
    let mut tx = system_tx(pool).await?;
    let result = sqlx::query(
        r"UPDATE downlink_envelopes
          SET state = 'acknowledged', updated_at = now()
          WHERE device_eui = $1 AND state = 'sending'
            AND substring(payload from 1 for 3) = $2",
    )
    .bind(device_eui)
    .bind(rgb.to_vec())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(result.rows_affected())
}

/// Envelopes in `sending` whose last transition is older than the
/// monitor timeout — candidates for stuck handling.
pub async fn sending_older_than(
    pool: &PgPool,
    secs: i64,
) -> Result<Vec<DownlinkEnvelope>, ApiError> {
    let mut tx = system_tx(pool).await?;
    let rows = sqlx::query_as::<_, DownlinkEnvelope>(
        r"SELECT * FROM downlink_envelopes
          WHERE state = 'sending'
            AND updated_at < now() - make_interval(secs => $1::float8)",
    )
    .bind(secs)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(rows)
}

/// Bump the stuck counter, returning the new count.
pub async fn bump_stuck(pool: &PgPool, envelope_id: Uuid) -> Result<i32, ApiError> {
    let mut tx = system_tx(pool).await?;
    let (count,): (i32,) = sqlx::query_as(
        r"UPDATE downlink_envelopes
          SET stuck_cycles = stuck_cycles + 1, updated_at = now()
          WHERE id = $1
          RETURNING stuck_cycles",
    )
    .bind(envelope_id)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(count)
}

/// Reclaim `sending` envelopes stranded past the safety window (crashed
/// worker, lost LNS answer) back to `pending`.
pub async fn reclaim_stale_sending(pool: &PgPool, secs: i64) -> Result<u64, ApiError> {
    let mut tx = system_tx(pool).await?;
    let result = sqlx::query(
        r"UPDATE downlink_envelopes
          SET state = 'pending', scheduled_at = now(), updated_at = now()
          WHERE state = 'sending'
            AND updated_at < now() - make_interval(secs => $1::float8)",
    )
    .bind(secs)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(result.rows_affected())
}

/// Flush old pending envelopes routed toward an offline gateway.
///
/// Returns the `(tenant, device)` pairs flushed so the caller can
/// re-enqueue current targets after the LNS forgets the dead route.
pub async fn flush_stale_for_gateway(
    pool: &PgPool,
    gateway_eui: &str,
    older_than_secs: i64,
) -> Result<Vec<(Uuid, String)>, ApiError> {
    let mut tx = system_tx(pool).await?;
    let rows: Vec<(Uuid, String)> = sqlx::query_as(
        r"UPDATE downlink_envelopes
          SET state = 'superseded', last_error = 'flushed: gateway offline', updated_at = now()
          WHERE state = 'pending' AND gateway_eui = $1
            AND created_at < now() - make_interval(secs => $2::float8)
          RETURNING tenant_id, device_eui",
    )
    .bind(gateway_eui)
    .bind(older_than_secs)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(rows)
}

/// Append an actuation record for an attempt.
pub async fn record_actuation(
    pool: &PgPool,
    envelope: &DownlinkEnvelope,
    outcome: &str,
    error: Option<&str>,
) -> Result<(), ApiError> {
    let mut tx = system_tx(pool).await?;
    sqlx::query(
        r"INSERT INTO actuation_records (envelope_id, tenant_id, device_eui, attempt, outcome, error)
          VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(envelope.id)
    .bind(envelope.tenant_id)
    .bind(&envelope.device_eui)
    .bind(envelope.attempts)
    .bind(outcome)
    .bind(error)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Depth of the pending queue, for readiness and metrics.
pub async fn pending_depth(pool: &PgPool) -> Result<i64, ApiError> {
    let mut tx = system_tx(pool).await?;
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM downlink_envelopes WHERE state = 'pending'")
            .fetch_one(&mut *tx)
            .await?;
    tx.commit().await?;
    Ok(count)
}
