//! Per-tenant display policy.
//!
//! A policy is the single record that maps space states to display colors
//! and carries the timing thresholds for debouncing, sensor-silence holds,
//! and the pre-reservation highlight window. Exactly one policy is active
//! per tenant; updates replace it atomically.

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// An RGB color, serialized as 6 uppercase hex digits (`"00FF00"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub [u8; 3]);

impl Rgb {
    /// Parse from 6 hex digits, with or without a leading `#`.
    pub fn parse(s: &str) -> Result<Self, PolicyError> {
        let digits = s.strip_prefix('#').unwrap_or(s);
        if digits.len() != 6 {
            return Err(PolicyError::InvalidColor(s.to_owned()));
        }
        let mut bytes = [0u8; 3];
        hex::decode_to_slice(digits.as_bytes(), &mut bytes)
            .map_err(|_| PolicyError::InvalidColor(s.to_owned()))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for Rgb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02X}{:02X}{:02X}", self.0[0], self.0[1], self.0[2])
    }
}

impl Serialize for Rgb {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Rgb {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Blink timing in display firmware units (tenths of a second on/off).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlinkPattern {
    pub on: u8,
    pub off: u8,
}

/// The active display policy for a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayPolicy {
    /// Color for a free space.
    pub free: Rgb,
    /// Color for an occupied space.
    pub occupied: Rgb,
    /// Color while a reservation is active.
    pub reserved: Rgb,
    /// Color while a reservation is about to start.
    pub reserved_soon: Rgb,
    /// Color for an admin `blocked` override.
    pub blocked: Rgb,
    /// Color for an admin `out_of_service` override.
    pub out_of_service: Rgb,
    /// Blink pattern for the `reserved_soon` window, `None` for solid.
    pub reserved_soon_blink: Option<BlinkPattern>,
    /// Seconds before a reservation start at which the highlight begins.
    pub reserved_soon_sec: i64,
    /// Sensor silence after which the stable reading is no longer trusted.
    pub unknown_timeout_sec: i64,
    /// Window within which a repeated reading confirms a state change.
    pub debounce_window_sec: i64,
}

impl Default for DisplayPolicy {
    fn default() -> Self {
        Self {
            free: Rgb([0x00, 0xFF, 0x00]),
            occupied: Rgb([0xFF, 0x00, 0x00]),
            reserved: Rgb([0xFF, 0xA5, 0x00]),
            reserved_soon: Rgb([0xFF, 0xA5, 0x00]),
            blocked: Rgb([0xFF, 0x00, 0xFF]),
            out_of_service: Rgb([0x00, 0x00, 0xFF]),
            reserved_soon_blink: Some(BlinkPattern { on: 5, off: 5 }),
            reserved_soon_sec: 900,
            unknown_timeout_sec: 60,
            debounce_window_sec: 10,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_hash_prefix_and_case() {
        assert_eq!(Rgb::parse("#00ff00").unwrap(), Rgb([0x00, 0xFF, 0x00]));
        assert_eq!(Rgb::parse("FFA500").unwrap(), Rgb([0xFF, 0xA5, 0x00]));
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(Rgb::parse("00FF0").is_err());
        assert!(Rgb::parse("00FF0G").is_err());
        assert!(Rgb::parse("#00FF000").is_err());
    }

    #[test]
    fn display_is_uppercase_hex() {
        assert_eq!(Rgb([0xFF, 0xA5, 0x00]).to_string(), "FFA500");
    }

    #[test]
    fn policy_json_roundtrip() {
        let policy = DisplayPolicy::default();
        let json = serde_json::to_string(&policy).unwrap();
        let back: DisplayPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }
}
