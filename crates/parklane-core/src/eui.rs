//! LoRaWAN device and gateway identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::EuiParseError;

/// A 64-bit LoRaWAN EUI.
///
/// Canonical form is 16 uppercase hex characters with no separators.
/// Parsing accepts lowercase and `:`/`-` separators and normalizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Eui([u8; 8]);

impl Eui {
    /// Construct from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// The raw 8 bytes, big-endian as transmitted.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for Eui {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl FromStr for Eui {
    type Err = EuiParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        if cleaned.len() != 16 {
            return Err(EuiParseError {
                input: s.to_owned(),
                reason: "expected 16 hex characters",
            });
        }
        let mut bytes = [0u8; 8];
        hex::decode_to_slice(cleaned.as_bytes(), &mut bytes).map_err(|_| EuiParseError {
            input: s.to_owned(),
            reason: "non-hex character",
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for Eui {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Eui {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_uppercase_hex() {
        let eui: Eui = "70B3D57ED0001234".parse().unwrap();
        assert_eq!(eui.to_string(), "70B3D57ED0001234");
    }

    #[test]
    fn normalizes_lowercase_and_separators() {
        let a: Eui = "70:b3:d5:7e:d0:00:12:34".parse().unwrap();
        let b: Eui = "70-b3-d5-7e-d0-00-12-34".parse().unwrap();
        let c: Eui = "70b3d57ed0001234".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(c.to_string(), "70B3D57ED0001234");
    }

    #[test]
    fn rejects_wrong_length() {
        assert!("70B3D57ED000123".parse::<Eui>().is_err());
        assert!("70B3D57ED00012345".parse::<Eui>().is_err());
        assert!("".parse::<Eui>().is_err());
    }

    #[test]
    fn rejects_non_hex() {
        assert!("70B3D57ED000123G".parse::<Eui>().is_err());
    }

    #[test]
    fn serde_roundtrip_is_canonical() {
        let eui: Eui = "70b3d57ed0001234".parse().unwrap();
        let json = serde_json::to_string(&eui).unwrap();
        assert_eq!(json, "\"70B3D57ED0001234\"");
        let back: Eui = serde_json::from_str(&json).unwrap();
        assert_eq!(back, eui);
    }
}
