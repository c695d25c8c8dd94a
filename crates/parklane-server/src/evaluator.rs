//! Space re-evaluation.
//!
//! Gathers the inputs for one space, runs the pure state machine, and
//! acts on the outcome: persist the state transition and hand the target
//! to the coalescing downlink queue. Evaluations for a space are
//! serialized by a coordination-store lock; a skipped evaluation is
//! recovered by the next reconciliation sweep.

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use parklane_core::debounce::DebounceState;
use parklane_core::encode::{content_hash, display_frame, PORT_DISPLAY};
use parklane_core::statemachine::{evaluate, EvalInputs, Evaluation, TargetDisplay};
use parklane_core::Eui;

use crate::error::ApiError;
use crate::metrics::Metrics;
use crate::repository::{audit, devices, downlinks, policy, reservations, spaces};
use crate::state::AppState;

/// Lock TTL — generous for a handful of queries, short enough that a
/// crashed holder does not stall the space.
const LOCK_TTL: Duration = Duration::from_secs(10);
const LOCK_RETRIES: u32 = 20;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Coordination key for the debounce record of a space.
#[must_use]
pub fn debounce_key(tenant_id: Uuid, space_id: Uuid) -> String {
    format!("debounce:{tenant_id}:{space_id}")
}

/// Coordination key caching the payload a display is believed to show.
#[must_use]
pub fn display_cache_key(eui: &str) -> String {
    format!("display:{eui}")
}

/// Re-evaluate one space under its per-space lock.
///
/// Best-effort: if the lock cannot be acquired the evaluation is skipped
/// with a warning — the reconciliation sweep converges the space later.
pub async fn evaluate_space(
    state: &AppState,
    tenant_id: Uuid,
    space_id: Uuid,
) -> Result<(), ApiError> {
    let lock_key = format!("lock:space:{space_id}");
    let lock_token = Uuid::new_v4();
    let token_bytes = lock_token.as_bytes().to_vec();

    let mut acquired = false;
    for _ in 0..LOCK_RETRIES {
        if state
            .coord
            .set_nx(&lock_key, &token_bytes, LOCK_TTL)
            .await?
        {
            acquired = true;
            break;
        }
        tokio::time::sleep(LOCK_RETRY_DELAY).await;
    }
    if !acquired {
        tracing::warn!(%space_id, "space evaluation lock contended, deferring to reconciliation");
        return Ok(());
    }

    let result = evaluate_locked(state, tenant_id, space_id).await;
    let _ = state.coord.compare_delete(&lock_key, &token_bytes).await;
    result
}

async fn evaluate_locked(
    state: &AppState,
    tenant_id: Uuid,
    space_id: Uuid,
) -> Result<(), ApiError> {
    Metrics::bump(&state.metrics.evaluations);
    let now = Utc::now();

    let space = spaces::get(&state.pool, tenant_id, space_id).await?;
    let (display_policy, _version) = policy::get(&state.pool, tenant_id).await?;
    let override_kind = policy::active_override(&state.pool, tenant_id, space_id).await?;
    let reservation_active = reservations::active_at(&state.pool, tenant_id, space_id, now)
        .await?
        .is_some();
    let next_reservation_start =
        reservations::next_start_after(&state.pool, tenant_id, space_id, now).await?;

    let debounce = read_debounce(state, tenant_id, space_id).await;
    let sensor = debounce.signal(now, display_policy.unknown_timeout_sec);

    let inputs = EvalInputs {
        now,
        policy: &display_policy,
        override_kind,
        reservation_active,
        next_reservation_start,
        sensor,
    };

    match evaluate(&inputs) {
        Evaluation::Hold { .. } => Ok(()),
        Evaluation::Target(target) => {
            apply_target(state, tenant_id, &space, &target).await
        }
    }
}

async fn apply_target(
    state: &AppState,
    tenant_id: Uuid,
    space: &crate::models::Space,
    target: &TargetDisplay,
) -> Result<(), ApiError> {
    if let Some(prev) =
        spaces::set_state(&state.pool, tenant_id, space.id, target.state.as_str()).await?
    {
        audit::record_state_change(
            &state.pool,
            tenant_id,
            space.id,
            &prev,
            target.state.as_str(),
            target.reason.as_str(),
            i16::from(target.priority),
        )
        .await?;
        tracing::info!(
            space_id = %space.id,
            prev_state = %prev,
            next_state = target.state.as_str(),
            priority = target.priority,
            "space state changed"
        );
    }

    let Some(display) = devices::display_for_space(&state.pool, tenant_id, space.id).await? else {
        return Ok(());
    };

    let eui = Eui::from_str(&display.eui)
        .map_err(|e| ApiError::Internal(format!("stored display EUI invalid: {e}")))?;
    let payload = display_frame(target.color, target.blink);
    let hash = content_hash(eui, PORT_DISPLAY, &payload);

    // Skip the enqueue when the display already shows this frame.
    if let Ok(Some(cached)) = state.coord.get(&display_cache_key(&display.eui)).await {
        if cached == payload {
            return Ok(());
        }
    }

    let gateway_hint = devices::last_gateway_for_device(&state.pool, &display.eui)
        .await?
        .map(|g| g.eui);

    let outcome = downlinks::enqueue(
        &state.pool,
        tenant_id,
        &display.eui,
        gateway_hint.as_deref(),
        i32::from(PORT_DISPLAY),
        &payload,
        false,
        &hash,
    )
    .await?;

    match outcome {
        downlinks::EnqueueOutcome::Created { superseded, .. } => {
            Metrics::bump(&state.metrics.downlinks_enqueued);
            for _ in 0..superseded {
                Metrics::bump(&state.metrics.downlinks_superseded);
            }
        }
        downlinks::EnqueueOutcome::Coalesced(_) => {
            Metrics::bump(&state.metrics.downlinks_coalesced);
        }
    }
    Ok(())
}

/// Load the debounce record for a space, tolerating a cold cache.
pub async fn read_debounce(state: &AppState, tenant_id: Uuid, space_id: Uuid) -> DebounceState {
    match state.coord.get(&debounce_key(tenant_id, space_id)).await {
        Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_default(),
        _ => DebounceState::default(),
    }
}

/// Persist the debounce record for a space.
pub async fn write_debounce(
    state: &AppState,
    tenant_id: Uuid,
    space_id: Uuid,
    debounce: &DebounceState,
) -> Result<(), ApiError> {
    let bytes = serde_json::to_vec(debounce)
        .map_err(|e| ApiError::Internal(format!("debounce encode: {e}")))?;
    state
        .coord
        .put(
            &debounce_key(tenant_id, space_id),
            &bytes,
            Some(Duration::from_secs(24 * 3600)),
        )
        .await?;
    Ok(())
}
