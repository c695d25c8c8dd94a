//! Display payload encoding and downlink content hashing.
//!
//! Displays take a 5-byte frame `R G B on off` on a fixed port, where
//! `on`/`off` are duty-cycle tenths of a second. A solid color is
//! `on = 0x64, off = 0x00`. Re-sending the same frame is a no-op at the
//! device, which is what makes at-least-once dispatch safe.

use sha2::{Digest, Sha256};

use crate::eui::Eui;
use crate::policy::{BlinkPattern, Rgb};

/// Downlink port all display frames are sent on.
pub const PORT_DISPLAY: u16 = 15;

/// Downlink port asking a dual-role device for a status uplink.
pub const PORT_STATUS_POLL: u16 = 16;

/// The status-poll frame.
#[must_use]
pub fn status_poll_frame() -> Vec<u8> {
    vec![0x01]
}

/// Duty-cycle value for a solid (always on) color.
const DUTY_SOLID_ON: u8 = 0x64;

/// Encode a display frame.
#[must_use]
pub fn display_frame(color: Rgb, blink: Option<BlinkPattern>) -> Vec<u8> {
    let (on, off) = match blink {
        Some(pattern) => (pattern.on, pattern.off),
        None => (DUTY_SOLID_ON, 0x00),
    };
    vec![color.0[0], color.0[1], color.0[2], on, off]
}

/// Content hash for downlink coalescing: SHA-256 over (EUI, port, payload).
///
/// Two envelopes with equal hashes would set the device to the same state,
/// so at most one of them needs to be pending at a time.
#[must_use]
pub fn content_hash(eui: Eui, port: u16, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(eui.as_bytes());
    hasher.update(port.to_be_bytes());
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn solid_occupied_frame() {
        let frame = display_frame(Rgb([0xFF, 0x00, 0x00]), None);
        assert_eq!(frame, vec![0xFF, 0x00, 0x00, 0x64, 0x00]);
    }

    #[test]
    fn solid_reserved_frame() {
        let frame = display_frame(Rgb([0xFF, 0xA5, 0x00]), None);
        assert_eq!(frame, vec![0xFF, 0xA5, 0x00, 0x64, 0x00]);
    }

    #[test]
    fn blink_frame_uses_pattern_duty_cycle() {
        let frame = display_frame(Rgb([0x00, 0xFF, 0x00]), Some(BlinkPattern { on: 5, off: 5 }));
        assert_eq!(frame, vec![0x00, 0xFF, 0x00, 0x05, 0x05]);
    }

    #[test]
    fn content_hash_is_stable() {
        let eui: Eui = "70B3D57ED0001234".parse().unwrap();
        let a = content_hash(eui, PORT_DISPLAY, &[0xFF, 0x00, 0x00, 0x64, 0x00]);
        let b = content_hash(eui, PORT_DISPLAY, &[0xFF, 0x00, 0x00, 0x64, 0x00]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn content_hash_differs_by_payload_port_and_device() {
        let eui: Eui = "70B3D57ED0001234".parse().unwrap();
        let other: Eui = "70B3D57ED0005678".parse().unwrap();
        let base = content_hash(eui, PORT_DISPLAY, &[0xFF, 0x00, 0x00, 0x64, 0x00]);
        assert_ne!(
            base,
            content_hash(eui, PORT_DISPLAY, &[0x00, 0xFF, 0x00, 0x64, 0x00])
        );
        assert_ne!(base, content_hash(eui, 16, &[0xFF, 0x00, 0x00, 0x64, 0x00]));
        assert_ne!(
            base,
            content_hash(other, PORT_DISPLAY, &[0xFF, 0x00, 0x00, 0x64, 0x00])
        );
    }
}
