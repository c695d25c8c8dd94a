//! Database models.
//!
//! Domain rows as stored in Postgres. Enum-like columns (role, lifecycle,
//! states) are kept as strings at this layer and parsed into core types
//! where decisions are made. Secret material (password hashes, key
//! hashes, webhook secrets) is never serialized.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::types::JsonValue;
use uuid::Uuid;

// ── Tenants ──────────────────────────────────────────────────────────

/// An organization on the platform.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Tenant {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub active: bool,
    pub tier: String,
    pub feature_flags: JsonValue,
    pub quota_max_spaces: i32,
    pub quota_max_devices: i32,
    pub quota_max_users: i32,
    #[serde(skip)]
    pub webhook_secret: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Tenant {
    /// Per-tenant boolean feature flag with a default.
    #[must_use]
    pub fn flag(&self, name: &str, default: bool) -> bool {
        self.feature_flags
            .get(name)
            .and_then(JsonValue::as_bool)
            .unwrap_or(default)
    }
}

// ── Users & memberships ──────────────────────────────────────────────

/// A platform user.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub is_platform_admin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Joins a user to a tenant with a role.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Membership {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

/// A refresh token row. The plaintext is never stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub family_id: Uuid,
    pub token_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// A service key bound to one tenant.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ServiceKey {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    #[serde(skip)]
    pub key_hash: String,
    pub key_prefix: String,
    pub scopes: Vec<String>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

// ── Sites, spaces, devices, gateways ─────────────────────────────────

/// A physical location within a tenant.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Site {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub timezone: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// The smallest managed unit of parking.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Space {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub code: String,
    pub state: String,
    pub sensor_device_id: Option<Uuid>,
    pub display_device_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A sensor or display record. Dual-role hardware appears as two rows
/// sharing an EUI.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Device {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub eui: String,
    /// `sensor` or `display`.
    pub role: String,
    pub device_type: String,
    pub lifecycle: String,
    pub space_id: Option<Uuid>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A LoRaWAN base station.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Gateway {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub eui: String,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Gateway {
    /// Online iff heard from within the last five minutes.
    #[must_use]
    pub fn online(&self, now: DateTime<Utc>) -> bool {
        self.last_seen_at
            .is_some_and(|seen| now.signed_duration_since(seen).num_seconds() < 300)
    }
}

// ── Readings & orphans ───────────────────────────────────────────────

/// An append-only sensor uplink event.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SensorReading {
    pub id: i64,
    pub tenant_id: Uuid,
    pub device_eui: String,
    pub fcnt: i64,
    pub occupancy: String,
    pub battery_pct: Option<i16>,
    pub temperature_c: Option<f32>,
    pub rssi: Option<i32>,
    pub snr: Option<f32>,
    pub gateway_eui: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// A first-seen EUI that is not registered to any tenant.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct OrphanDevice {
    pub eui: String,
    pub last_fcnt: i64,
    pub uplink_count: i64,
    pub last_port: Option<i32>,
    pub last_payload_hex: Option<String>,
    pub last_rssi: Option<i32>,
    pub last_snr: Option<f32>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// An unregistered device *type* seen in an uplink, kept for operator
/// confirmation with a sample payload.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct OrphanDeviceType {
    pub device_type: String,
    pub sample_port: i32,
    pub sample_payload_hex: String,
    pub seen_count: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

// ── Policy & overrides ───────────────────────────────────────────────

/// The per-tenant display policy row. The policy document itself is the
/// core `DisplayPolicy` serialized as JSON.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DisplayPolicyRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub policy: JsonValue,
    pub version: i32,
    pub updated_at: DateTime<Utc>,
}

/// A time-bounded admin override forcing MAINTENANCE.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AdminOverride {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub space_id: Uuid,
    /// `blocked` or `out_of_service`.
    pub kind: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub cleared_at: Option<DateTime<Utc>>,
}

// ── Reservations ─────────────────────────────────────────────────────

/// A booking on a space over a half-open interval.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Reservation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub space_id: Uuid,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    /// `pending`, `confirmed`, `expired`, or `cancelled`.
    pub status: String,
    pub request_id: Option<String>,
    pub requester: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Downlinks ────────────────────────────────────────────────────────

/// A pending or in-flight display instruction.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DownlinkEnvelope {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub device_eui: String,
    /// Advisory routing hint; the LNS owns actual gateway selection.
    pub gateway_eui: Option<String>,
    pub port: i32,
    pub payload: Vec<u8>,
    pub confirmed: bool,
    pub content_hash: String,
    /// `pending`, `sending`, `acknowledged`, or `failed`.
    pub state: String,
    pub attempts: i32,
    pub defer_count: i32,
    pub stuck_cycles: i32,
    pub lns_fcnt: Option<i64>,
    pub last_error: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit of one downlink attempt.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ActuationRecord {
    pub id: i64,
    pub envelope_id: Uuid,
    pub tenant_id: Uuid,
    pub device_eui: String,
    pub attempt: i32,
    pub outcome: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ── Audit & state changes ────────────────────────────────────────────

/// One entry in the append-only audit ledger.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub tenant_id: Option<Uuid>,
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub resource_id: Option<String>,
    pub before: Option<JsonValue>,
    pub after: Option<JsonValue>,
    pub request_id: Option<String>,
    pub ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A space state transition, kept for bounded history.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StateChange {
    pub id: i64,
    pub tenant_id: Uuid,
    pub space_id: Uuid,
    pub prev_state: String,
    pub next_state: String,
    pub reason: String,
    pub priority: i16,
    pub created_at: DateTime<Utc>,
}
