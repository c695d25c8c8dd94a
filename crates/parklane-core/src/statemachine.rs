//! The display state machine.
//!
//! Computes the target display for a space from admin overrides,
//! reservations, and the debounced sensor signal, in strict priority
//! order. The function is pure: the server gathers the inputs, this module
//! decides, and the downlink queue acts on the decision. Out-of-order
//! re-evaluations therefore converge — the queue coalesces by content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::debounce::SensorSignal;
use crate::decode::Occupancy;
use crate::policy::{BlinkPattern, DisplayPolicy, Rgb};

/// Managed state of a parking space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpaceState {
    Free,
    Occupied,
    Reserved,
    Maintenance,
}

impl SpaceState {
    /// The stored state string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Occupied => "OCCUPIED",
            Self::Reserved => "RESERVED",
            Self::Maintenance => "MAINTENANCE",
        }
    }
}

/// Kinds of admin override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideKind {
    Blocked,
    OutOfService,
}

/// Why the evaluator chose an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    OverrideOutOfService,
    OverrideBlocked,
    ReservationActive,
    ReservationSoon,
    SensorOccupied,
    SensorVacant,
    SensorHold,
    NoData,
}

impl Reason {
    /// The stored reason string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OverrideOutOfService => "override_out_of_service",
            Self::OverrideBlocked => "override_blocked",
            Self::ReservationActive => "reservation_active",
            Self::ReservationSoon => "reservation_soon",
            Self::SensorOccupied => "sensor_occupied",
            Self::SensorVacant => "sensor_vacant",
            Self::SensorHold => "sensor_hold",
            Self::NoData => "no_data",
        }
    }
}

/// A concrete display target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDisplay {
    pub state: SpaceState,
    pub color: Rgb,
    pub blink: Option<BlinkPattern>,
    pub priority: u8,
    pub reason: Reason,
}

/// Evaluator output: either a concrete target or "keep what is shown".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    Target(TargetDisplay),
    /// The sensor is silent or indeterminate and nothing outranks it —
    /// hold the last stable display, enqueue nothing.
    Hold { reason: Reason },
}

/// Everything the evaluator looks at.
#[derive(Debug, Clone, Copy)]
pub struct EvalInputs<'a> {
    pub now: DateTime<Utc>,
    pub policy: &'a DisplayPolicy,
    /// Active admin override, if any.
    pub override_kind: Option<OverrideKind>,
    /// A pending/confirmed reservation covers `now`.
    pub reservation_active: bool,
    /// Start of the next reservation strictly after `now`, if any.
    pub next_reservation_start: Option<DateTime<Utc>>,
    /// Debounced sensor signal.
    pub sensor: SensorSignal,
}

/// Evaluate the target display for a space.
#[must_use]
pub fn evaluate(inputs: &EvalInputs<'_>) -> Evaluation {
    let policy = inputs.policy;

    if let Some(kind) = inputs.override_kind {
        return Evaluation::Target(match kind {
            OverrideKind::OutOfService => TargetDisplay {
                state: SpaceState::Maintenance,
                color: policy.out_of_service,
                blink: None,
                priority: 1,
                reason: Reason::OverrideOutOfService,
            },
            OverrideKind::Blocked => TargetDisplay {
                state: SpaceState::Maintenance,
                color: policy.blocked,
                blink: None,
                priority: 2,
                reason: Reason::OverrideBlocked,
            },
        });
    }

    if inputs.reservation_active {
        return Evaluation::Target(TargetDisplay {
            state: SpaceState::Reserved,
            color: policy.reserved,
            blink: None,
            priority: 3,
            reason: Reason::ReservationActive,
        });
    }

    if let Some(start) = inputs.next_reservation_start {
        let lead = start.signed_duration_since(inputs.now).num_seconds();
        if lead >= 0 && lead <= policy.reserved_soon_sec {
            return Evaluation::Target(TargetDisplay {
                state: SpaceState::Reserved,
                color: policy.reserved_soon,
                blink: policy.reserved_soon_blink,
                priority: 4,
                reason: Reason::ReservationSoon,
            });
        }
    }

    match inputs.sensor {
        SensorSignal::Fresh(Occupancy::Occupied) => Evaluation::Target(TargetDisplay {
            state: SpaceState::Occupied,
            color: policy.occupied,
            blink: None,
            priority: 5,
            reason: Reason::SensorOccupied,
        }),
        SensorSignal::Fresh(Occupancy::Vacant) => Evaluation::Target(TargetDisplay {
            state: SpaceState::Free,
            color: policy.free,
            blink: None,
            priority: 5,
            reason: Reason::SensorVacant,
        }),
        SensorSignal::Fresh(Occupancy::Unknown) | SensorSignal::Hold => Evaluation::Hold {
            reason: Reason::SensorHold,
        },
        SensorSignal::None => Evaluation::Target(TargetDisplay {
            state: SpaceState::Free,
            color: policy.free,
            blink: None,
            priority: 7,
            reason: Reason::NoData,
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn policy() -> DisplayPolicy {
        DisplayPolicy::default()
    }

    fn base<'a>(policy: &'a DisplayPolicy) -> EvalInputs<'a> {
        EvalInputs {
            now: now(),
            policy,
            override_kind: None,
            reservation_active: false,
            next_reservation_start: None,
            sensor: SensorSignal::None,
        }
    }

    fn target(eval: Evaluation) -> TargetDisplay {
        match eval {
            Evaluation::Target(t) => t,
            Evaluation::Hold { .. } => unreachable!("expected a concrete target"),
        }
    }

    #[test]
    fn out_of_service_beats_everything() {
        let p = policy();
        let mut inputs = base(&p);
        inputs.override_kind = Some(OverrideKind::OutOfService);
        inputs.reservation_active = true;
        inputs.sensor = SensorSignal::Fresh(Occupancy::Occupied);

        let t = target(evaluate(&inputs));
        assert_eq!(t.state, SpaceState::Maintenance);
        assert_eq!(t.color, p.out_of_service);
        assert_eq!(t.priority, 1);
    }

    #[test]
    fn blocked_beats_reservation() {
        let p = policy();
        let mut inputs = base(&p);
        inputs.override_kind = Some(OverrideKind::Blocked);
        inputs.reservation_active = true;

        let t = target(evaluate(&inputs));
        assert_eq!(t.state, SpaceState::Maintenance);
        assert_eq!(t.color, p.blocked);
        assert_eq!(t.priority, 2);
    }

    #[test]
    fn active_reservation_beats_sensor() {
        let p = policy();
        let mut inputs = base(&p);
        inputs.reservation_active = true;
        inputs.sensor = SensorSignal::Fresh(Occupancy::Occupied);

        let t = target(evaluate(&inputs));
        assert_eq!(t.state, SpaceState::Reserved);
        assert_eq!(t.color, p.reserved);
        assert_eq!(t.blink, None);
    }

    #[test]
    fn reserved_soon_window_activates_and_blinks() {
        let p = policy();
        let mut inputs = base(&p);
        inputs.next_reservation_start = Some(now() + TimeDelta::seconds(p.reserved_soon_sec));
        inputs.sensor = SensorSignal::Fresh(Occupancy::Vacant);

        let t = target(evaluate(&inputs));
        assert_eq!(t.state, SpaceState::Reserved);
        assert_eq!(t.color, p.reserved_soon);
        assert_eq!(t.blink, p.reserved_soon_blink);
        assert_eq!(t.priority, 4);
    }

    #[test]
    fn reservation_outside_soon_window_is_ignored() {
        let p = policy();
        let mut inputs = base(&p);
        inputs.next_reservation_start = Some(now() + TimeDelta::seconds(p.reserved_soon_sec + 1));
        inputs.sensor = SensorSignal::Fresh(Occupancy::Vacant);

        let t = target(evaluate(&inputs));
        assert_eq!(t.state, SpaceState::Free);
        assert_eq!(t.priority, 5);
    }

    #[test]
    fn occupied_and_vacant_map_to_policy_colors() {
        let p = policy();
        let mut inputs = base(&p);

        inputs.sensor = SensorSignal::Fresh(Occupancy::Occupied);
        let t = target(evaluate(&inputs));
        assert_eq!((t.state, t.color), (SpaceState::Occupied, p.occupied));

        inputs.sensor = SensorSignal::Fresh(Occupancy::Vacant);
        let t = target(evaluate(&inputs));
        assert_eq!((t.state, t.color), (SpaceState::Free, p.free));
    }

    #[test]
    fn silent_sensor_holds() {
        let p = policy();
        let mut inputs = base(&p);
        inputs.sensor = SensorSignal::Hold;
        assert!(matches!(evaluate(&inputs), Evaluation::Hold { .. }));
    }

    #[test]
    fn no_data_defaults_to_free() {
        let p = policy();
        let inputs = base(&p);
        let t = target(evaluate(&inputs));
        assert_eq!(t.state, SpaceState::Free);
        assert_eq!(t.priority, 7);
    }

    fn arb_sensor() -> impl Strategy<Value = SensorSignal> {
        prop_oneof![
            Just(SensorSignal::None),
            Just(SensorSignal::Hold),
            Just(SensorSignal::Fresh(Occupancy::Occupied)),
            Just(SensorSignal::Fresh(Occupancy::Vacant)),
            Just(SensorSignal::Fresh(Occupancy::Unknown)),
        ]
    }

    fn arb_override() -> impl Strategy<Value = Option<OverrideKind>> {
        prop_oneof![
            Just(None),
            Just(Some(OverrideKind::Blocked)),
            Just(Some(OverrideKind::OutOfService)),
        ]
    }

    proptest! {
        #[test]
        fn evaluation_is_deterministic(
            sensor in arb_sensor(),
            override_kind in arb_override(),
            reservation_active in any::<bool>(),
            lead in proptest::option::of(0i64..4000),
        ) {
            let p = policy();
            let inputs = EvalInputs {
                now: now(),
                policy: &p,
                override_kind,
                reservation_active,
                next_reservation_start: lead.map(|s| now() + TimeDelta::seconds(s)),
                sensor,
            };
            prop_assert_eq!(evaluate(&inputs), evaluate(&inputs));
        }

        #[test]
        fn override_always_wins(
            sensor in arb_sensor(),
            reservation_active in any::<bool>(),
        ) {
            let p = policy();
            let inputs = EvalInputs {
                now: now(),
                policy: &p,
                override_kind: Some(OverrideKind::Blocked),
                reservation_active,
                next_reservation_start: None,
                sensor,
            };
            let t = target(evaluate(&inputs));
            prop_assert_eq!(t.state, SpaceState::Maintenance);
        }

        #[test]
        fn sensor_never_outranks_active_reservation(sensor in arb_sensor()) {
            let p = policy();
            let inputs = EvalInputs {
                now: now(),
                policy: &p,
                override_kind: None,
                reservation_active: true,
                next_reservation_start: None,
                sensor,
            };
            let t = target(evaluate(&inputs));
            prop_assert_eq!(t.state, SpaceState::Reserved);
        }
    }
}
