//! Downlink dispatcher.
//!
//! Pulls due envelopes off the persistent queue one device at a time,
//! applies gateway and tenant token buckets, and hands payloads to the
//! LNS. Gateways that have gone quiet defer the envelope on a bounded
//! backoff schedule; transient LNS failures retry with their own backoff
//! until the terminal attempt budget is spent. A separate monitor pass
//! flags envelopes the LNS accepted but never transmitted, flushing the
//! device queue after two stuck cycles.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use chrono::{TimeDelta, Utc};
use tokio::sync::watch;

use parklane_core::Eui;

use crate::error::ApiError;
use crate::lns::LnsError;
use crate::metrics::Metrics;
use crate::models::DownlinkEnvelope;
use crate::repository::{devices, downlinks};
use crate::state::AppState;

/// Idle delay between queue polls when nothing is due.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Gateway silence after which dispatch defers instead of sending.
const GATEWAY_ONLINE_WINDOW_SECS: i64 = 300;

/// Stuck cycles tolerated before the device's LNS queue is flushed.
const STUCK_FLUSH_CYCLES: i32 = 2;

/// Run the dispatcher until shutdown.
pub async fn run(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    tracing::info!("downlink dispatcher started");
    loop {
        tokio::select! {
            () = tokio::time::sleep(POLL_INTERVAL) => {
                // Drain everything due, then go back to sleep.
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    match downlinks::acquire_next(&state.pool).await {
                        Ok(Some(envelope)) => {
                            if let Err(e) = dispatch_one(&state, &envelope).await {
                                tracing::warn!(
                                    envelope_id = %envelope.id,
                                    error = %e,
                                    "dispatch pass failed"
                                );
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "queue acquisition failed");
                            break;
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("downlink dispatcher shutting down");
                return;
            }
        }
    }
}

/// Handle one claimed envelope end to end.
async fn dispatch_one(state: &AppState, envelope: &DownlinkEnvelope) -> Result<(), ApiError> {
    let now = Utc::now();

    // Pre-flight: a gateway that stopped being heard cannot deliver a
    // Class-C unicast. Defer on the bounded schedule rather than burning
    // attempts into a dead route.
    if let Some(gateway_eui) = &envelope.gateway_eui {
        if let Some(gateway) = devices::gateway_by_eui(&state.pool, gateway_eui).await? {
            if !gateway.online(now) {
                let delay = state.config.downlink_backoff(envelope.defer_count);
                downlinks::defer(
                    &state.pool,
                    envelope.id,
                    now + TimeDelta::seconds(delay),
                    "gateway offline",
                )
                .await?;
                Metrics::bump(&state.metrics.downlinks_deferred);
                tracing::info!(
                    envelope_id = %envelope.id,
                    gateway = %gateway_eui,
                    delay_secs = delay,
                    "downlink deferred: gateway offline"
                );
                return Ok(());
            }
        }
    }

    // Token buckets: per gateway, then per tenant.
    let limits = state.config.rate_limits;
    if let Some(gateway_eui) = &envelope.gateway_eui {
        let decision = state
            .coord
            .bucket_take(
                &format!("rl:dispatch:gw:{gateway_eui}"),
                limits.dispatch_per_gateway,
                limits.dispatch_per_gateway,
                1.0,
            )
            .await?;
        if !decision.allowed {
            let wait = i64::try_from(decision.retry_after_secs()).unwrap_or(1);
            downlinks::defer(
                &state.pool,
                envelope.id,
                now + TimeDelta::seconds(wait.max(1)),
                "gateway rate limit",
            )
            .await?;
            return Ok(());
        }
    }
    let decision = state
        .coord
        .bucket_take(
            &format!("rl:dispatch:tenant:{}", envelope.tenant_id),
            limits.dispatch_per_tenant,
            limits.dispatch_per_tenant,
            1.0,
        )
        .await?;
    if !decision.allowed {
        let wait = i64::try_from(decision.retry_after_secs()).unwrap_or(1);
        downlinks::defer(
            &state.pool,
            envelope.id,
            now + TimeDelta::seconds(wait.max(1)),
            "tenant rate limit",
        )
        .await?;
        return Ok(());
    }

    let eui = Eui::from_str(&envelope.device_eui)
        .map_err(|e| ApiError::Internal(format!("stored device EUI invalid: {e}")))?;
    let port = u16::try_from(envelope.port).unwrap_or(15);

    match state
        .lns
        .enqueue_downlink(eui, port, &envelope.payload, envelope.confirmed)
        .await
    {
        Ok(lns_fcnt) => {
            downlinks::mark_sent(&state.pool, envelope.id, lns_fcnt).await?;
            downlinks::record_actuation(&state.pool, envelope, "sent", None).await?;
            // Optimistic last-known display cache; a status uplink will
            // correct it if the frame never reached the device.
            let _ = state
                .coord
                .put(
                    &crate::evaluator::display_cache_key(&envelope.device_eui),
                    &envelope.payload,
                    Some(Duration::from_secs(24 * 3600)),
                )
                .await;
            Metrics::bump(&state.metrics.downlinks_sent);
            Ok(())
        }
        Err(err) => {
            let transient = matches!(
                err,
                LnsError::Transport(_) | LnsError::Rejected { status: 500..=599 }
            );
            if transient && envelope.attempts < state.config.downlink_max_attempts {
                let backoff = 1i64
                    .checked_shl(u32::try_from(envelope.attempts).unwrap_or(0))
                    .unwrap_or(60)
                    .min(60);
                downlinks::requeue_after_error(
                    &state.pool,
                    envelope.id,
                    now + TimeDelta::seconds(backoff),
                    &err.to_string(),
                )
                .await?;
                downlinks::record_actuation(&state.pool, envelope, "retry", Some(&err.to_string()))
                    .await?;
                Ok(())
            } else {
                downlinks::fail(&state.pool, envelope.id, &err.to_string()).await?;
                downlinks::record_actuation(&state.pool, envelope, "failed", Some(&err.to_string()))
                    .await?;
                Metrics::bump(&state.metrics.downlinks_failed);
                tracing::error!(
                    envelope_id = %envelope.id,
                    device = %envelope.device_eui,
                    attempts = envelope.attempts,
                    error = %err,
                    "downlink terminally failed"
                );
                Ok(())
            }
        }
    }
}

/// Monitor pass: find envelopes the LNS accepted but has not transmitted
/// within the monitor timeout, and flush the device queue after repeated
/// stuck cycles so the next route attempt starts clean.
pub async fn monitor_stuck(state: &AppState) -> Result<(), ApiError> {
    let stale =
        downlinks::sending_older_than(&state.pool, state.config.downlink_monitor_timeout_secs)
            .await?;

    for envelope in stale {
        let eui = match Eui::from_str(&envelope.device_eui) {
            Ok(eui) => eui,
            Err(_) => continue,
        };
        let queue = match state.lns.list_queue(eui).await {
            Ok(queue) => queue,
            Err(e) => {
                tracing::warn!(device = %envelope.device_eui, error = %e, "LNS queue listing failed");
                continue;
            }
        };

        let encoded = base64::engine::general_purpose::STANDARD.encode(&envelope.payload);
        let still_queued = queue.iter().any(|item| item.payload == encoded);
        if !still_queued {
            // Transmitted (or flushed elsewhere); reconciliation settles it.
            continue;
        }

        let cycles = downlinks::bump_stuck(&state.pool, envelope.id).await?;
        Metrics::bump(&state.metrics.downlinks_stuck);
        tracing::warn!(
            envelope_id = %envelope.id,
            device = %envelope.device_eui,
            cycles,
            "downlink stuck in LNS queue"
        );

        if cycles >= STUCK_FLUSH_CYCLES {
            if let Err(e) = state.lns.flush_queue(eui).await {
                tracing::warn!(device = %envelope.device_eui, error = %e, "LNS queue flush failed");
                continue;
            }
            downlinks::requeue_after_error(
                &state.pool,
                envelope.id,
                Utc::now(),
                "flushed after stuck cycles",
            )
            .await?;
        }
    }
    Ok(())
}
