//! Per-device-type uplink decoders.
//!
//! Each registered device type decodes raw payload bytes into a normalized
//! occupancy signal. Types nobody has registered decode to
//! [`Occupancy::Unknown`] and are surfaced to operators as orphan types —
//! the reading is still stored, with the sample payload attached.

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::policy::Rgb;

/// Normalized occupancy signal from a sensor uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Occupancy {
    Occupied,
    Vacant,
    Unknown,
}

/// Registered device types.
///
/// Dual-role indicators carry both a sensor and a display behind one EUI;
/// their status uplinks report the color currently shown, which feeds the
/// last-known display cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    MotionSensor,
    DualRoleIndicator,
    /// A type string nobody has registered a decoder for.
    #[serde(untagged)]
    Unknown(String),
}

impl DeviceKind {
    /// Parse a stored type string.
    #[must_use]
    pub fn from_type_str(s: &str) -> Self {
        match s {
            "motion-sensor" => Self::MotionSensor,
            "dual-role-indicator" => Self::DualRoleIndicator,
            other => Self::Unknown(other.to_owned()),
        }
    }

    /// The stored type string.
    #[must_use]
    pub fn as_type_str(&self) -> &str {
        match self {
            Self::MotionSensor => "motion-sensor",
            Self::DualRoleIndicator => "dual-role-indicator",
            Self::Unknown(s) => s,
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_type_str())
    }
}

/// A decoded uplink.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecodedUplink {
    pub occupancy: Occupancy,
    pub battery_pct: Option<u8>,
    pub temperature_c: Option<f32>,
    /// For dual-role status uplinks: the color the display is showing now.
    pub reported_rgb: Option<Rgb>,
}

/// Uplink port carrying occupancy frames.
pub const PORT_OCCUPANCY: u16 = 1;
/// Uplink port carrying dual-role status frames.
pub const PORT_STATUS: u16 = 2;

/// Decode an uplink for a device type.
///
/// Unknown device types never fail — they produce an
/// [`Occupancy::Unknown`] reading so the raw payload is preserved for
/// operator inspection.
pub fn decode(kind: &DeviceKind, port: u16, payload: &[u8]) -> Result<DecodedUplink, DecodeError> {
    match kind {
        DeviceKind::MotionSensor => match port {
            PORT_OCCUPANCY => decode_occupancy_frame(payload),
            other => Err(DecodeError::UnexpectedPort {
                kind: kind.to_string(),
                port: other,
            }),
        },
        DeviceKind::DualRoleIndicator => match port {
            PORT_OCCUPANCY => decode_occupancy_frame(payload),
            PORT_STATUS => decode_status_frame(payload),
            other => Err(DecodeError::UnexpectedPort {
                kind: kind.to_string(),
                port: other,
            }),
        },
        DeviceKind::Unknown(_) => Ok(DecodedUplink {
            occupancy: Occupancy::Unknown,
            battery_pct: None,
            temperature_c: None,
            reported_rgb: None,
        }),
    }
}

/// Occupancy frame: byte 0 bit 0 = occupied, byte 1 = battery percent,
/// bytes 2–3 = temperature in tenths of a degree, signed big-endian.
fn decode_occupancy_frame(payload: &[u8]) -> Result<DecodedUplink, DecodeError> {
    let first = payload.first().ok_or(DecodeError::Truncated { need: 1, got: 0 })?;
    let occupancy = if first & 0x01 == 0x01 {
        Occupancy::Occupied
    } else {
        Occupancy::Vacant
    };
    let battery_pct = payload.get(1).map(|b| (*b).min(100));
    let temperature_c = match payload.get(2..4) {
        Some([hi, lo]) => {
            let raw = i16::from_be_bytes([*hi, *lo]);
            Some(f32::from(raw) / 10.0)
        }
        _ => None,
    };
    Ok(DecodedUplink {
        occupancy,
        battery_pct,
        temperature_c,
        reported_rgb: None,
    })
}

/// Status frame from a dual-role indicator: byte 0 bit 0 = occupied,
/// bytes 1–3 = the RGB currently displayed.
fn decode_status_frame(payload: &[u8]) -> Result<DecodedUplink, DecodeError> {
    if payload.len() < 4 {
        return Err(DecodeError::Truncated {
            need: 4,
            got: payload.len(),
        });
    }
    let occupancy = if payload[0] & 0x01 == 0x01 {
        Occupancy::Occupied
    } else {
        Occupancy::Vacant
    };
    Ok(DecodedUplink {
        occupancy,
        battery_pct: None,
        temperature_c: None,
        reported_rgb: Some(Rgb([payload[1], payload[2], payload[3]])),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn motion_sensor_occupied_with_battery_and_temp() {
        let decoded = decode(&DeviceKind::MotionSensor, 1, &[0x01, 0x5F, 0x00, 0xE6]).unwrap();
        assert_eq!(decoded.occupancy, Occupancy::Occupied);
        assert_eq!(decoded.battery_pct, Some(95));
        assert!((decoded.temperature_c.unwrap() - 23.0).abs() < f32::EPSILON);
    }

    #[test]
    fn motion_sensor_vacant_minimal_frame() {
        let decoded = decode(&DeviceKind::MotionSensor, 1, &[0x00]).unwrap();
        assert_eq!(decoded.occupancy, Occupancy::Vacant);
        assert_eq!(decoded.battery_pct, None);
        assert_eq!(decoded.temperature_c, None);
    }

    #[test]
    fn motion_sensor_negative_temperature() {
        // -5.5°C = -55 tenths = 0xFFC9
        let decoded = decode(&DeviceKind::MotionSensor, 1, &[0x01, 0x64, 0xFF, 0xC9]).unwrap();
        assert!((decoded.temperature_c.unwrap() + 5.5).abs() < f32::EPSILON);
    }

    #[test]
    fn motion_sensor_empty_payload_is_truncated() {
        assert!(matches!(
            decode(&DeviceKind::MotionSensor, 1, &[]),
            Err(DecodeError::Truncated { need: 1, got: 0 })
        ));
    }

    #[test]
    fn motion_sensor_wrong_port_rejected() {
        assert!(matches!(
            decode(&DeviceKind::MotionSensor, 2, &[0x01]),
            Err(DecodeError::UnexpectedPort { port: 2, .. })
        ));
    }

    #[test]
    fn dual_role_status_reports_rgb() {
        let decoded =
            decode(&DeviceKind::DualRoleIndicator, 2, &[0x01, 0xFF, 0x00, 0x00]).unwrap();
        assert_eq!(decoded.occupancy, Occupancy::Occupied);
        assert_eq!(decoded.reported_rgb, Some(Rgb([0xFF, 0x00, 0x00])));
    }

    #[test]
    fn dual_role_occupancy_port_decodes_like_motion() {
        let decoded = decode(&DeviceKind::DualRoleIndicator, 1, &[0x00, 0x42]).unwrap();
        assert_eq!(decoded.occupancy, Occupancy::Vacant);
        assert_eq!(decoded.battery_pct, Some(66));
    }

    #[test]
    fn unknown_type_decodes_to_unknown_occupancy() {
        let kind = DeviceKind::from_type_str("mystery-v2");
        let decoded = decode(&kind, 7, &[0xDE, 0xAD]).unwrap();
        assert_eq!(decoded.occupancy, Occupancy::Unknown);
    }

    #[test]
    fn type_str_roundtrip() {
        for s in ["motion-sensor", "dual-role-indicator", "mystery-v2"] {
            assert_eq!(DeviceKind::from_type_str(s).as_type_str(), s);
        }
    }

    #[test]
    fn battery_is_clamped_to_percent() {
        let decoded = decode(&DeviceKind::MotionSensor, 1, &[0x01, 0xFF]).unwrap();
        assert_eq!(decoded.battery_pct, Some(100));
    }
}
