//! Webhook ingest pipeline.
//!
//! Absorbs uplinks from the LNS without loss, duplication, or
//! cross-tenant contamination: signature and replay checks, idempotent
//! persistence on the `(tenant, device, fcnt)` unique index, orphan
//! tracking with flood protection, and a disk spool for the window when
//! the durable store is down. Recoverable outcomes (duplicate, orphan,
//! spooled) are return values, not errors.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;

use parklane_core::decode::{self, DeviceKind, Occupancy};
use parklane_core::signature::{self, HEADER_NONCE, HEADER_SIGNATURE, HEADER_TIMESTAMP};
use parklane_core::spool::SpoolEnvelope;
use parklane_core::{Eui, SignatureError};

use crate::error::ApiError;
use crate::evaluator;
use crate::metrics::Metrics;
use crate::models::{Device, Tenant};
use crate::repository::{devices, downlinks, orphans, readings, spaces, tenants};
use crate::state::AppState;

/// Nonce dedup TTL — matches the replay window.
const NONCE_TTL: Duration = Duration::from_secs(300);

/// How an uplink was absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new reading was persisted.
    Accepted,
    /// The frame was already known (fcnt replay).
    Duplicate,
    /// The EUI is not registered; tracked as an orphan.
    Orphan,
    /// The durable store is down; the envelope went to disk.
    Spooled,
}

/// A webhook as received, before any validation.
#[derive(Debug, Clone)]
pub struct RawWebhook {
    pub tenant_slug: Option<String>,
    /// Lowercased header map (only the signature-relevant ones needed).
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub remote_ip: Option<String>,
}

/// The LNS uplink body shape.
#[derive(Debug, Deserialize)]
struct UplinkBody {
    #[serde(alias = "devEUI", alias = "dev_eui")]
    deveui: String,
    #[serde(alias = "fCnt")]
    fcnt: i64,
    #[serde(alias = "fPort")]
    port: u16,
    /// Hex-encoded frame payload.
    #[serde(alias = "data")]
    payload: String,
    #[serde(default)]
    rssi: Option<i32>,
    #[serde(default)]
    snr: Option<f32>,
    #[serde(default)]
    gateways: Vec<GatewayHint>,
    #[serde(default)]
    time: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct GatewayHint {
    eui: String,
    #[serde(default)]
    #[allow(dead_code)]
    rssi: Option<i32>,
}

/// A parsed, normalized uplink.
#[derive(Debug, Clone)]
pub struct ParsedUplink {
    pub eui: Eui,
    pub fcnt: i64,
    pub port: u16,
    pub payload: Vec<u8>,
    pub rssi: Option<i32>,
    pub snr: Option<f32>,
    pub gateway_euis: Vec<String>,
    pub received_at: chrono::DateTime<Utc>,
}

/// Parse an uplink body. Malformed JSON, a bad EUI, or non-hex payload
/// all reject the frame.
pub fn parse_uplink(body: &[u8]) -> Result<ParsedUplink, ApiError> {
    let raw: UplinkBody = serde_json::from_slice(body)
        .map_err(|e| ApiError::Validation(format!("malformed uplink body: {e}")))?;
    let eui = Eui::from_str(&raw.deveui)
        .map_err(|e| ApiError::Validation(format!("malformed uplink body: {e}")))?;
    if raw.fcnt < 0 {
        return Err(ApiError::Validation("malformed uplink body: negative fcnt".to_owned()));
    }
    let payload = hex::decode(raw.payload.trim())
        .map_err(|_| ApiError::Validation("malformed uplink body: payload is not hex".to_owned()))?;
    let gateway_euis = raw
        .gateways
        .into_iter()
        .filter_map(|g| Eui::from_str(&g.eui).ok().map(|e| e.to_string()))
        .collect();
    Ok(ParsedUplink {
        eui,
        fcnt: raw.fcnt,
        port: raw.port,
        payload,
        rssi: raw.rssi,
        snr: raw.snr,
        gateway_euis,
        received_at: raw.time.unwrap_or_else(Utc::now),
    })
}

/// Absorb a live webhook, spooling on durable-store unavailability.
pub async fn ingest_or_spool(
    state: &AppState,
    raw: RawWebhook,
) -> Result<IngestOutcome, ApiError> {
    match ingest(state, &raw).await {
        Err(ApiError::Unavailable(cause)) => {
            tracing::warn!(%cause, "durable store unavailable, spooling uplink");
            let envelope = SpoolEnvelope::new(
                Utc::now(),
                raw.headers,
                String::from_utf8_lossy(&raw.body).into_owned(),
                raw.remote_ip,
            );
            state.spool.enqueue(&envelope).await?;
            Metrics::bump(&state.metrics.uplinks_spooled);
            Ok(IngestOutcome::Spooled)
        }
        other => other,
    }
}

/// The full live pipeline: rate limits, signature, replay, persistence.
pub async fn ingest(state: &AppState, raw: &RawWebhook) -> Result<IngestOutcome, ApiError> {
    // Source-IP throttle before any work.
    if let Some(ip) = &raw.remote_ip {
        let limits = state.config.rate_limits;
        let decision = state
            .coord
            .bucket_take(
                &format!("rl:ingest:ip:{ip}"),
                limits.ingest_per_ip,
                limits.ingest_per_ip_burst,
                1.0,
            )
            .await?;
        if !decision.allowed {
            Metrics::bump(&state.metrics.uplinks_rate_limited);
            return Err(ApiError::RateLimited {
                retry_after_secs: decision.retry_after_secs(),
            });
        }
    }

    let parsed = match parse_uplink(&raw.body) {
        Ok(parsed) => parsed,
        Err(e) => {
            Metrics::bump(&state.metrics.uplinks_malformed);
            return Err(e);
        }
    };

    // Tenant inference: explicit path slug first, then the sensor EUI.
    let device = devices::get_by_eui_role(&state.pool, &parsed.eui.to_string(), "sensor").await?;
    let slug_tenant = match &raw.tenant_slug {
        Some(slug) => Some(tenants::get_by_slug(&state.pool, slug).await?),
        None => None,
    };
    let signing_tenant = match (&slug_tenant, &device) {
        (Some(t), _) => Some(t.clone()),
        (None, Some(d)) => Some(tenants::get(&state.pool, d.tenant_id).await?),
        (None, None) => None,
    };

    if let Some(tenant) = &signing_tenant {
        verify_webhook(state, tenant, raw).await?;

        let limits = state.config.rate_limits;
        let decision = state
            .coord
            .bucket_take(
                &format!("rl:ingest:tenant:{}", tenant.id),
                limits.ingest_per_tenant,
                limits.ingest_per_tenant_burst,
                1.0,
            )
            .await?;
        if !decision.allowed {
            Metrics::bump(&state.metrics.uplinks_rate_limited);
            return Err(ApiError::RateLimited {
                retry_after_secs: decision.retry_after_secs(),
            });
        }
    }

    match device {
        Some(device) => {
            if let Some(slug_tenant) = &slug_tenant {
                if slug_tenant.id != device.tenant_id {
                    // The device exists under another tenant. Report orphan
                    // without recording anything — the caller must not learn
                    // that the EUI is registered elsewhere.
                    Metrics::bump(&state.metrics.uplinks_orphan);
                    return Ok(IngestOutcome::Orphan);
                }
            }
            let tenant = match signing_tenant {
                Some(t) => t,
                None => tenants::get(&state.pool, device.tenant_id).await?,
            };
            process_device_uplink(state, &tenant, &device, &parsed).await
        }
        None => orphan_uplink(state, raw, &parsed).await,
    }
}

/// Replay a spooled envelope. Signature and nonce were checked at first
/// receipt; only the persistence path runs again, idempotently.
pub async fn replay(state: &AppState, envelope: &SpoolEnvelope) -> Result<IngestOutcome, ApiError> {
    let parsed = parse_uplink(envelope.body.as_bytes())?;
    let device = devices::get_by_eui_role(&state.pool, &parsed.eui.to_string(), "sensor").await?;
    match device {
        Some(device) => {
            let tenant = tenants::get(&state.pool, device.tenant_id).await?;
            process_device_uplink(state, &tenant, &device, &parsed).await
        }
        None => {
            let raw = RawWebhook {
                tenant_slug: None,
                headers: envelope.headers.clone(),
                body: envelope.body.clone().into_bytes(),
                remote_ip: envelope.remote_addr.clone(),
            };
            orphan_uplink(state, &raw, &parsed).await
        }
    }
}

/// Signature, timestamp window, and nonce replay checks.
async fn verify_webhook(
    state: &AppState,
    tenant: &Tenant,
    raw: &RawWebhook,
) -> Result<(), ApiError> {
    let Some(secret) = &tenant.webhook_secret else {
        if tenant.flag("require_webhook_signature", true) {
            Metrics::bump(&state.metrics.uplinks_unauthorized);
            return Err(ApiError::Unauthenticated(
                "no webhook secret configured for tenant".to_owned(),
            ));
        }
        tracing::warn!(tenant = %tenant.slug, "webhook accepted without signature (signature not required)");
        return Ok(());
    };

    fn header<'a>(
        headers: &'a BTreeMap<String, String>,
        name: &'static str,
    ) -> Result<&'a str, SignatureError> {
        headers
            .get(name)
            .map(String::as_str)
            .ok_or(SignatureError::MissingHeader(name))
    }

    let result: Result<(), SignatureError> = (|| {
        let provided = header(&raw.headers, HEADER_SIGNATURE)?;
        let timestamp_raw = header(&raw.headers, HEADER_TIMESTAMP)?;
        let nonce = header(&raw.headers, HEADER_NONCE)?;
        let timestamp: i64 = timestamp_raw
            .parse()
            .map_err(|_| SignatureError::MalformedTimestamp(timestamp_raw.to_owned()))?;
        signature::verify(
            secret.as_bytes(),
            timestamp,
            nonce,
            &raw.body,
            provided,
            Utc::now().timestamp(),
            state.config.webhook_replay_window_secs,
        )
    })();

    if let Err(e) = result {
        Metrics::bump(&state.metrics.uplinks_unauthorized);
        return Err(e.into());
    }

    // Nonce must be fresh within the dedup window.
    let nonce = raw
        .headers
        .get(HEADER_NONCE)
        .map(String::as_str)
        .unwrap_or_default();
    let nonce_key = format!("nonce:{}:{nonce}", tenant.id);
    if !state.coord.set_nx(&nonce_key, b"1", NONCE_TTL).await? {
        return Err(ApiError::Conflict {
            code: "nonce-replay",
            message: "nonce already used".to_owned(),
        });
    }

    Ok(())
}

/// Persist a registered sensor's uplink and ripple the consequences.
async fn process_device_uplink(
    state: &AppState,
    tenant: &Tenant,
    device: &Device,
    parsed: &ParsedUplink,
) -> Result<IngestOutcome, ApiError> {
    let kind = DeviceKind::from_type_str(&device.device_type);
    let decoded = match decode::decode(&kind, parsed.port, &parsed.payload) {
        Ok(decoded) => decoded,
        Err(e) => {
            Metrics::bump(&state.metrics.uplinks_malformed);
            return Err(ApiError::Validation(e.to_string()));
        }
    };
    if matches!(kind, DeviceKind::Unknown(_)) {
        orphans::record_orphan_type(
            &state.pool,
            kind.as_type_str(),
            i32::from(parsed.port),
            &hex::encode(&parsed.payload),
        )
        .await?;
        tracing::warn!(device_type = %kind, eui = %parsed.eui, "uplink from unregistered device type");
    }

    let occupancy_str = match decoded.occupancy {
        Occupancy::Occupied => "occupied",
        Occupancy::Vacant => "vacant",
        Occupancy::Unknown => "unknown",
    };

    let inserted = readings::insert(
        &state.pool,
        &readings::NewReading {
            tenant_id: tenant.id,
            device_eui: &parsed.eui.to_string(),
            fcnt: parsed.fcnt,
            occupancy: occupancy_str,
            battery_pct: decoded.battery_pct.map(i16::from),
            temperature_c: decoded.temperature_c,
            rssi: parsed.rssi,
            snr: parsed.snr,
            gateway_eui: parsed.gateway_euis.first().map(String::as_str),
            received_at: parsed.received_at,
        },
    )
    .await?;

    if inserted.is_none() {
        Metrics::bump(&state.metrics.uplinks_duplicate);
        return Ok(IngestOutcome::Duplicate);
    }

    devices::touch_seen(&state.pool, device.id, parsed.received_at).await?;
    for gw in &parsed.gateway_euis {
        devices::gateway_seen(&state.pool, tenant.id, gw, parsed.received_at).await?;
    }

    // Dual-role status frames confirm what the display currently shows.
    if let Some(rgb) = decoded.reported_rgb {
        let acked =
            downlinks::ack_by_reported_color(&state.pool, &parsed.eui.to_string(), rgb.0).await?;
        if acked > 0 {
            Metrics::bump(&state.metrics.downlinks_sent);
        }
        let frame = parklane_core::encode::display_frame(rgb, None);
        let _ = state
            .coord
            .put(
                &evaluator::display_cache_key(&parsed.eui.to_string()),
                &frame,
                Some(Duration::from_secs(24 * 3600)),
            )
            .await;
    }

    // Fold into the debounce record and re-evaluate the space, if one is
    // bound to this sensor. Loss here is tolerated: reconciliation heals.
    if let Some(space) =
        spaces::for_sensor_device(&state.pool, tenant.id, device.id).await?
    {
        let (display_policy, _) = crate::repository::policy::get(&state.pool, tenant.id).await?;
        let mut debounce = evaluator::read_debounce(state, tenant.id, space.id).await;
        debounce.apply(
            parsed.received_at,
            decoded.occupancy,
            display_policy.debounce_window_sec,
        );
        evaluator::write_debounce(state, tenant.id, space.id, &debounce).await?;

        if let Err(e) = evaluator::evaluate_space(state, tenant.id, space.id).await {
            tracing::warn!(space_id = %space.id, error = %e, "re-evaluation after uplink failed");
        }
    }

    Metrics::bump(&state.metrics.uplinks_accepted);
    Ok(IngestOutcome::Accepted)
}

/// Track an unregistered EUI, with per-source flood protection.
async fn orphan_uplink(
    state: &AppState,
    raw: &RawWebhook,
    parsed: &ParsedUplink,
) -> Result<IngestOutcome, ApiError> {
    if let Some(ip) = &raw.remote_ip {
        let per_sec = state.config.rate_limits.orphan_euis_per_minute / 60.0;
        let burst = state.config.rate_limits.orphan_euis_per_minute;
        let decision = state
            .coord
            .bucket_take(&format!("rl:orphan:{ip}"), per_sec, burst, 1.0)
            .await?;
        if !decision.allowed {
            Metrics::bump(&state.metrics.uplinks_rate_limited);
            return Err(ApiError::RateLimited {
                retry_after_secs: decision.retry_after_secs(),
            });
        }
    }

    let eui = parsed.eui.to_string();
    let updated = orphans::upsert_sighting(
        &state.pool,
        &orphans::OrphanSighting {
            eui: &eui,
            fcnt: parsed.fcnt,
            port: i32::from(parsed.port),
            payload_hex: &hex::encode(&parsed.payload),
            rssi: parsed.rssi,
            snr: parsed.snr,
        },
    )
    .await?;

    if updated.is_none() {
        Metrics::bump(&state.metrics.uplinks_duplicate);
        return Ok(IngestOutcome::Duplicate);
    }

    Metrics::bump(&state.metrics.uplinks_orphan);
    Ok(IngestOutcome::Orphan)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_canonical_body() {
        let body = br#"{
            "deveui": "70b3d57ed0001234",
            "fcnt": 42,
            "port": 1,
            "payload": "015f",
            "rssi": -97,
            "snr": 7.5,
            "gateways": [{"eui": "AA55AA55AA55AA55", "rssi": -97}]
        }"#;
        let parsed = parse_uplink(body).unwrap();
        assert_eq!(parsed.eui.to_string(), "70B3D57ED0001234");
        assert_eq!(parsed.fcnt, 42);
        assert_eq!(parsed.port, 1);
        assert_eq!(parsed.payload, vec![0x01, 0x5F]);
        assert_eq!(parsed.gateway_euis, vec!["AA55AA55AA55AA55".to_owned()]);
    }

    #[test]
    fn parse_accepts_lns_aliases() {
        let body = br#"{"devEUI": "70B3D57ED0001234", "fCnt": 1, "fPort": 2, "data": "00ff0000"}"#;
        let parsed = parse_uplink(body).unwrap();
        assert_eq!(parsed.port, 2);
        assert_eq!(parsed.payload.len(), 4);
    }

    #[test]
    fn parse_rejects_bad_eui() {
        let body = br#"{"deveui": "xyz", "fcnt": 1, "port": 1, "payload": "00"}"#;
        assert!(matches!(
            parse_uplink(body),
            Err(ApiError::Validation(_))
        ));
    }

    #[test]
    fn parse_rejects_non_hex_payload() {
        let body = br#"{"deveui": "70B3D57ED0001234", "fcnt": 1, "port": 1, "payload": "zz"}"#;
        assert!(parse_uplink(body).is_err());
    }

    #[test]
    fn parse_rejects_negative_fcnt() {
        let body = br#"{"deveui": "70B3D57ED0001234", "fcnt": -1, "port": 1, "payload": "00"}"#;
        assert!(parse_uplink(body).is_err());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_uplink(b"not json").is_err());
    }
}
