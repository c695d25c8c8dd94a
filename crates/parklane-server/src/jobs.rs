//! Background jobs.
//!
//! A small set of periodic workers, each leased through a Postgres
//! advisory lock so exactly one replica runs a given job at a time. All
//! workers share one shutdown signal and check it between items, so a
//! long sweep stops promptly.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::dispatch;
use crate::error::ApiError;
use crate::evaluator;
use crate::ingest;
use crate::repository::{audit, devices, downlinks, orphans, readings, reservations, users};
use crate::state::AppState;

/// Advisory lock ids, one per job.
mod lease {
    pub const SPOOL_DRAIN: i64 = 0x7061_726b_0001;
    pub const STUCK_MONITOR: i64 = 0x7061_726b_0002;
    pub const RECONCILE: i64 = 0x7061_726b_0003;
    pub const QUEUE_CLEANUP: i64 = 0x7061_726b_0004;
    pub const RESERVATION_EXPIRY: i64 = 0x7061_726b_0005;
    pub const RETENTION: i64 = 0x7061_726b_0006;
    pub const BOUNDARY_TIMERS: i64 = 0x7061_726b_0007;
}

/// Gateway silence that marks a route dead for queue cleanup.
const GATEWAY_DEAD_SECS: i64 = 600;
/// Age past which pending envelopes behind a dead gateway are flushed.
const STALE_ENVELOPE_SECS: i64 = 600;
/// Window after which `sending` envelopes are reclaimed.
const SENDING_RECLAIM_SECS: i64 = 60;
/// Spool envelopes replayed per drain tick.
const SPOOL_BATCH: usize = 32;

/// Spawn every periodic job. The returned handles finish after `shutdown`
/// flips.
pub fn spawn_all(
    state: &Arc<AppState>,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    handles.push(spawn_job(
        state,
        shutdown,
        "spool-drain",
        lease::SPOOL_DRAIN,
        Duration::from_secs(5),
        |state| Box::pin(drain_spool(state)),
    ));
    handles.push(spawn_job(
        state,
        shutdown,
        "stuck-monitor",
        lease::STUCK_MONITOR,
        Duration::from_secs(15),
        |state| Box::pin(async move { dispatch::monitor_stuck(&state).await }),
    ));
    handles.push(spawn_job(
        state,
        shutdown,
        "reconcile",
        lease::RECONCILE,
        Duration::from_secs(120),
        |state| Box::pin(reconcile(state)),
    ));
    handles.push(spawn_job(
        state,
        shutdown,
        "queue-cleanup",
        lease::QUEUE_CLEANUP,
        Duration::from_secs(300),
        |state| Box::pin(queue_cleanup(state)),
    ));
    handles.push(spawn_job(
        state,
        shutdown,
        "reservation-expiry",
        lease::RESERVATION_EXPIRY,
        Duration::from_secs(60),
        |state| Box::pin(expire_reservations(state)),
    ));
    handles.push(spawn_job(
        state,
        shutdown,
        "retention",
        lease::RETENTION,
        Duration::from_secs(3600),
        |state| Box::pin(apply_retention(state)),
    ));
    handles.push(spawn_job(
        state,
        shutdown,
        "boundary-timers",
        lease::BOUNDARY_TIMERS,
        Duration::from_secs(15),
        |state| Box::pin(fire_boundary_timers(state)),
    ));

    handles
}

type JobFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), ApiError>> + Send>>;

/// Run a job on an interval under its advisory-lock lease.
fn spawn_job(
    state: &Arc<AppState>,
    shutdown: &watch::Receiver<bool>,
    name: &'static str,
    lease_id: i64,
    every: Duration,
    run: fn(Arc<AppState>) -> JobFuture,
) -> JoinHandle<()> {
    let state = Arc::clone(state);
    let mut shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(job = name, every_secs = every.as_secs(), "job started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match run_leased(&state, lease_id, run).await {
                        Ok(true) => {}
                        Ok(false) => tracing::debug!(job = name, "lease held elsewhere, skipping tick"),
                        Err(e) => tracing::warn!(job = name, error = %e, "job tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!(job = name, "job shutting down");
                    return;
                }
            }
        }
    })
}

/// Execute one tick while holding the advisory lock on a dedicated
/// connection. Returns `Ok(false)` when another replica holds the lease.
async fn run_leased(
    state: &Arc<AppState>,
    lease_id: i64,
    run: fn(Arc<AppState>) -> JobFuture,
) -> Result<bool, ApiError> {
    let mut conn = state.pool.acquire().await?;
    let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
        .bind(lease_id)
        .fetch_one(&mut *conn)
        .await?;
    if !acquired {
        return Ok(false);
    }

    let result = run(Arc::clone(state)).await;

    let _: (bool,) = sqlx::query_as("SELECT pg_advisory_unlock($1)")
        .bind(lease_id)
        .fetch_one(&mut *conn)
        .await?;

    result.map(|()| true)
}

// ── Jobs ─────────────────────────────────────────────────────────────

/// Replay spooled webhooks against the durable store.
async fn drain_spool(state: Arc<AppState>) -> Result<(), ApiError> {
    let now = Utc::now();
    let claimed = state.spool.take_due(SPOOL_BATCH, now).await?;
    if claimed.is_empty() {
        return Ok(());
    }
    tracing::info!(count = claimed.len(), "draining spooled uplinks");

    for file in claimed {
        match ingest::replay(&state, &file.envelope).await {
            Ok(outcome) => {
                tracing::debug!(envelope_id = %file.envelope.id, ?outcome, "spooled uplink replayed");
                state.spool.complete(&file).await?;
            }
            Err(e) => {
                let envelope_id = file.envelope.id;
                let buried = state.spool.fail(file, now, &e.to_string()).await?;
                if buried {
                    tracing::error!(%envelope_id, error = %e, "spooled uplink moved to dead-letter");
                } else {
                    tracing::warn!(%envelope_id, error = %e, "spooled uplink replay failed, will retry");
                }
            }
        }
    }
    Ok(())
}

/// Reconciliation sweep: reclaim stranded sends, then converge every
/// space with a display toward its computed target. The evaluator skips
/// the enqueue when the cached device state already matches.
async fn reconcile(state: Arc<AppState>) -> Result<(), ApiError> {
    let reclaimed = downlinks::reclaim_stale_sending(&state.pool, SENDING_RECLAIM_SECS).await?;
    if reclaimed > 0 {
        tracing::info!(reclaimed, "reclaimed stranded sending envelopes");
    }

    let spaces = devices::spaces_with_displays(&state.pool).await?;
    for (tenant_id, space_id) in spaces {
        if let Err(e) = evaluator::evaluate_space(&state, tenant_id, space_id).await {
            tracing::warn!(%space_id, error = %e, "reconciliation evaluation failed");
        }
    }

    poll_silent_displays(&state).await
}

/// Display silence after which a status poll is enqueued.
const DISPLAY_SILENT_SECS: i64 = 3600;
/// Minimum spacing between polls to the same device.
const POLL_SPACING: Duration = Duration::from_secs(3600);

/// Ask long-silent displays to report what they are showing, so the
/// last-known cache stays honest without waiting for organic uplinks.
async fn poll_silent_displays(state: &Arc<AppState>) -> Result<(), ApiError> {
    use std::str::FromStr;

    use parklane_core::encode::{content_hash, status_poll_frame, PORT_STATUS_POLL};
    use parklane_core::Eui;

    for device in devices::silent_displays(&state.pool, DISPLAY_SILENT_SECS).await? {
        let poll_key = format!("poll:{}", device.eui);
        if !state.coord.set_nx(&poll_key, b"1", POLL_SPACING).await? {
            continue;
        }
        let Ok(eui) = Eui::from_str(&device.eui) else {
            continue;
        };
        let payload = status_poll_frame();
        let hash = content_hash(eui, PORT_STATUS_POLL, &payload);
        downlinks::enqueue(
            &state.pool,
            device.tenant_id,
            &device.eui,
            None,
            i32::from(PORT_STATUS_POLL),
            &payload,
            false,
            &hash,
        )
        .await?;
        tracing::debug!(device = %device.eui, "status poll enqueued for silent display");
    }
    Ok(())
}

/// Flush pending envelopes stuck behind gateways that have been offline
/// for a while, then re-enqueue current targets so the LNS can pick a
/// new route after the next uplink.
async fn queue_cleanup(state: Arc<AppState>) -> Result<(), ApiError> {
    let offline = devices::offline_gateways(&state.pool, GATEWAY_DEAD_SECS).await?;
    for gateway in offline {
        let flushed =
            downlinks::flush_stale_for_gateway(&state.pool, &gateway.eui, STALE_ENVELOPE_SECS)
                .await?;
        if flushed.is_empty() {
            continue;
        }
        tracing::info!(
            gateway = %gateway.eui,
            count = flushed.len(),
            "flushed stale envelopes behind offline gateway"
        );
        for (tenant_id, device_eui) in flushed {
            if let Some(space) =
                space_for_display_eui(&state, tenant_id, &device_eui).await?
            {
                if let Err(e) = evaluator::evaluate_space(&state, tenant_id, space).await {
                    tracing::warn!(space_id = %space, error = %e, "re-enqueue after flush failed");
                }
            }
        }
    }
    Ok(())
}

async fn space_for_display_eui(
    state: &AppState,
    tenant_id: uuid::Uuid,
    device_eui: &str,
) -> Result<Option<uuid::Uuid>, ApiError> {
    let mut tx = crate::repository::tenant_tx(&state.pool, tenant_id).await?;
    let row: Option<(uuid::Uuid,)> = sqlx::query_as(
        r"SELECT s.id FROM spaces s
          JOIN devices d ON s.display_device_id = d.id
          WHERE d.eui = $1 AND s.tenant_id = $2 AND s.deleted_at IS NULL AND d.deleted_at IS NULL",
    )
    .bind(device_eui)
    .bind(tenant_id)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(row.map(|(id,)| id))
}

/// Window checked for just-crossed boundaries. Slightly wider than the
/// tick so a slow tick cannot skip one; re-evaluation is idempotent.
const BOUNDARY_LOOKBACK_SECS: i64 = 20;

/// Fire the `reserved_soon` entry and reservation-start boundaries.
///
/// Finds live reservations starting inside the horizon, computes each
/// tenant's highlight lead, and re-evaluates spaces whose boundary
/// crossed since the previous tick. End boundaries belong to the expiry
/// job.
async fn fire_boundary_timers(state: Arc<AppState>) -> Result<(), ApiError> {
    use std::collections::HashMap;

    let now = Utc::now();
    let horizon = now + chrono::TimeDelta::hours(2);
    let lookback = now - chrono::TimeDelta::seconds(BOUNDARY_LOOKBACK_SECS);
    let upcoming = reservations::starting_within(
        &state.pool,
        lookback,
        horizon,
        500,
    )
    .await?;
    if upcoming.is_empty() {
        return Ok(());
    }

    let mut soon_by_tenant: HashMap<uuid::Uuid, i64> = HashMap::new();
    for reservation in upcoming {
        let soon_sec = match soon_by_tenant.get(&reservation.tenant_id) {
            Some(sec) => *sec,
            None => {
                let (policy, _) =
                    crate::repository::policy::get(&state.pool, reservation.tenant_id).await?;
                soon_by_tenant.insert(reservation.tenant_id, policy.reserved_soon_sec);
                policy.reserved_soon_sec
            }
        };

        let soon_entry = reservation.starts_at - chrono::TimeDelta::seconds(soon_sec);
        let crossed = |at: chrono::DateTime<Utc>| at > lookback && at <= now;
        if crossed(soon_entry) || crossed(reservation.starts_at) {
            if let Err(e) =
                evaluator::evaluate_space(&state, reservation.tenant_id, reservation.space_id)
                    .await
            {
                tracing::warn!(
                    space_id = %reservation.space_id,
                    error = %e,
                    "boundary re-evaluation failed"
                );
            }
        }
    }
    Ok(())
}

/// Expire reservations whose end has passed and re-evaluate their spaces.
async fn expire_reservations(state: Arc<AppState>) -> Result<(), ApiError> {
    let expired = reservations::expire_ended(&state.pool).await?;
    if expired.is_empty() {
        return Ok(());
    }
    tracing::info!(count = expired.len(), "expired reservations");
    for (tenant_id, space_id) in expired {
        if let Err(e) = evaluator::evaluate_space(&state, tenant_id, space_id).await {
            tracing::warn!(%space_id, error = %e, "re-evaluation after expiry failed");
        }
    }
    Ok(())
}

/// Purge data past its retention window. Deletes only — never updates.
async fn apply_retention(state: Arc<AppState>) -> Result<(), ApiError> {
    let retention = state.config.retention;
    let readings = readings::purge_older_than(&state.pool, retention.sensor_readings_days).await?;
    let changes = audit::purge_state_changes(&state.pool, retention.state_changes_days).await?;
    let orphaned = orphans::purge_inactive(&state.pool, retention.orphan_inactive_days).await?;
    let tokens =
        users::cleanup_refresh_tokens(&state.pool, retention.refresh_tokens_grace_days).await?;
    let audited = audit::purge_older_than(&state.pool, retention.audit_days).await?;
    if readings + changes + orphaned + tokens + audited > 0 {
        tracing::info!(readings, changes, orphaned, tokens, audited, "retention purge complete");
    }
    Ok(())
}
