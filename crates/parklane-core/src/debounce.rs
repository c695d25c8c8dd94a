//! Sensor debouncing and silence handling.
//!
//! A raw reading becomes *stable* only when a second reading with the same
//! value arrives within the debounce window. A differing reading restarts
//! the window. Once a sensor has been silent longer than the unknown
//! timeout, its stable value is no longer trusted — the state machine then
//! holds whatever the display last showed until fresh data arrives.
//!
//! The state is kept per (tenant, space) in the coordination store and is
//! fully reconstructible from new readings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decode::Occupancy;

/// A candidate value waiting for confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReading {
    pub value: Occupancy,
    pub count: u32,
    pub since: DateTime<Utc>,
}

/// Debounce state for one space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebounceState {
    /// Candidate not yet confirmed.
    pub pending: Option<PendingReading>,
    /// Last confirmed value.
    pub stable: Option<Occupancy>,
    /// When `stable` was confirmed.
    pub stable_at: Option<DateTime<Utc>>,
    /// Timestamp of the last raw reading, regardless of value.
    pub last_raw_at: Option<DateTime<Utc>>,
}

/// What the state machine sees from the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorSignal {
    /// A confirmed value from a recently-heard sensor.
    Fresh(Occupancy),
    /// The sensor is silent or indeterminate — keep the current display.
    Hold,
    /// No usable data has ever arrived.
    None,
}

impl DebounceState {
    /// Fold a raw reading into the state.
    ///
    /// Returns the value that just became stable, if any. Indeterminate
    /// readings only refresh the liveness timestamp — they can neither
    /// confirm nor reset a candidate.
    pub fn apply(
        &mut self,
        now: DateTime<Utc>,
        raw: Occupancy,
        window_sec: i64,
    ) -> Option<Occupancy> {
        self.last_raw_at = Some(now);

        if raw == Occupancy::Unknown {
            return None;
        }

        match self.pending {
            Some(p) if p.value == raw => {
                let elapsed = now.signed_duration_since(p.since).num_seconds();
                if elapsed <= window_sec {
                    self.pending = None;
                    self.stable = Some(raw);
                    self.stable_at = Some(now);
                    Some(raw)
                } else {
                    // Window lapsed — this reading starts a new one.
                    self.pending = Some(PendingReading {
                        value: raw,
                        count: 1,
                        since: now,
                    });
                    None
                }
            }
            Some(_) => {
                self.pending = Some(PendingReading {
                    value: raw,
                    count: 1,
                    since: now,
                });
                None
            }
            None => {
                if self.stable == Some(raw) {
                    // Already stable at this value; nothing to confirm.
                    None
                } else {
                    self.pending = Some(PendingReading {
                        value: raw,
                        count: 1,
                        since: now,
                    });
                    None
                }
            }
        }
    }

    /// The signal as of `now`, applying the silence timeout.
    #[must_use]
    pub fn signal(&self, now: DateTime<Utc>, unknown_timeout_sec: i64) -> SensorSignal {
        let Some(last_raw) = self.last_raw_at else {
            return SensorSignal::None;
        };
        let silent_for = now.signed_duration_since(last_raw).num_seconds();
        if silent_for > unknown_timeout_sec {
            return SensorSignal::Hold;
        }
        match self.stable {
            Some(Occupancy::Unknown) | None => SensorSignal::None,
            Some(value) => SensorSignal::Fresh(value),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + TimeDelta::seconds(secs)
    }

    #[test]
    fn single_reading_is_not_stable() {
        let mut st = DebounceState::default();
        assert_eq!(st.apply(t0(), Occupancy::Occupied, 10), None);
        assert_eq!(st.signal(t0(), 60), SensorSignal::None);
    }

    #[test]
    fn second_matching_reading_confirms() {
        let mut st = DebounceState::default();
        st.apply(t0(), Occupancy::Occupied, 10);
        assert_eq!(st.apply(at(5), Occupancy::Occupied, 10), Some(Occupancy::Occupied));
        assert_eq!(st.signal(at(5), 60), SensorSignal::Fresh(Occupancy::Occupied));
    }

    #[test]
    fn differing_reading_resets_pending() {
        let mut st = DebounceState::default();
        st.apply(t0(), Occupancy::Occupied, 10);
        assert_eq!(st.apply(at(3), Occupancy::Vacant, 10), None);
        // The vacant candidate now needs its own confirmation.
        assert_eq!(st.apply(at(6), Occupancy::Vacant, 10), Some(Occupancy::Vacant));
    }

    #[test]
    fn confirmation_outside_window_restarts() {
        let mut st = DebounceState::default();
        st.apply(t0(), Occupancy::Occupied, 10);
        assert_eq!(st.apply(at(11), Occupancy::Occupied, 10), None);
        assert_eq!(st.apply(at(15), Occupancy::Occupied, 10), Some(Occupancy::Occupied));
    }

    #[test]
    fn stable_survives_opposing_single_reading() {
        let mut st = DebounceState::default();
        st.apply(t0(), Occupancy::Occupied, 10);
        st.apply(at(2), Occupancy::Occupied, 10);
        st.apply(at(20), Occupancy::Vacant, 10);
        // Still occupied until vacant is confirmed.
        assert_eq!(st.signal(at(20), 60), SensorSignal::Fresh(Occupancy::Occupied));
    }

    #[test]
    fn silence_turns_signal_into_hold() {
        let mut st = DebounceState::default();
        st.apply(t0(), Occupancy::Occupied, 10);
        st.apply(at(2), Occupancy::Occupied, 10);
        assert_eq!(st.signal(at(63), 60), SensorSignal::Hold);
        // Silence of exactly the timeout is still fresh.
        assert_eq!(st.signal(at(62), 60), SensorSignal::Fresh(Occupancy::Occupied));
    }

    #[test]
    fn matching_reading_after_silence_unfreezes() {
        let mut st = DebounceState::default();
        st.apply(t0(), Occupancy::Occupied, 10);
        st.apply(at(2), Occupancy::Occupied, 10);
        assert_eq!(st.signal(at(120), 60), SensorSignal::Hold);
        st.apply(at(120), Occupancy::Occupied, 10);
        assert_eq!(st.signal(at(120), 60), SensorSignal::Fresh(Occupancy::Occupied));
    }

    #[test]
    fn unknown_reading_refreshes_liveness_only() {
        let mut st = DebounceState::default();
        st.apply(t0(), Occupancy::Occupied, 10);
        st.apply(at(2), Occupancy::Occupied, 10);
        st.apply(at(50), Occupancy::Unknown, 10);
        assert_eq!(st.signal(at(100), 60), SensorSignal::Fresh(Occupancy::Occupied));
        // But it cannot confirm a pending candidate.
        let mut st2 = DebounceState::default();
        st2.apply(t0(), Occupancy::Vacant, 10);
        assert_eq!(st2.apply(at(1), Occupancy::Unknown, 10), None);
        assert_eq!(st2.apply(at(2), Occupancy::Vacant, 10), Some(Occupancy::Vacant));
    }

    #[test]
    fn json_roundtrip() {
        let mut st = DebounceState::default();
        st.apply(t0(), Occupancy::Occupied, 10);
        let json = serde_json::to_vec(&st).unwrap();
        let back: DebounceState = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, st);
    }
}
