//! Endpoint health state machine.
//!
//! ```text
//!            failures reach threshold
//!   enabled ─────────────────────────▶ disabled
//!      ▲                                  │
//!      └────────── operator enable ───────┘
//! ```
//!
//! Every recorded failure increments the counter, including failures of attempts that were
//! already in flight when the subscription was disabled. Any success resets the counter but
//! never re-enables a disabled subscription; only an operator does that.
//!
//! The stores apply [`transition`] atomically (under their lock, or as a single `UPDATE`), so
//! concurrent attempt results never lose a counter update.

use crate::db::models::webhooks::HealthState;

/// Consecutive failures that disable a subscription when the retry table is the default.
pub const DEFAULT_DISABLE_THRESHOLD: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSignal {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTransition {
    pub state: HealthState,
    pub consecutive_failures: i32,
    pub newly_disabled: bool,
}

pub fn transition(state: HealthState, consecutive_failures: i32, signal: HealthSignal, threshold: i32) -> HealthTransition {
    match signal {
        HealthSignal::Success => HealthTransition {
            state,
            consecutive_failures: 0,
            newly_disabled: false,
        },
        HealthSignal::Failure => {
            let failures = consecutive_failures.saturating_add(1);
            let trips = state == HealthState::Enabled && failures >= threshold;
            HealthTransition {
                state: if trips { HealthState::Disabled } else { state },
                consecutive_failures: failures,
                newly_disabled: trips,
            }
        }
    }
}

/// Operator re-enable: back to `enabled` with a clean counter.
pub fn operator_enable() -> HealthTransition {
    HealthTransition {
        state: HealthState::Enabled,
        consecutive_failures: 0,
        newly_disabled: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail(state: HealthState, failures: i32) -> HealthTransition {
        transition(state, failures, HealthSignal::Failure, DEFAULT_DISABLE_THRESHOLD)
    }

    #[test]
    fn test_disables_exactly_at_threshold() {
        let mut state = HealthState::Enabled;
        let mut failures = 0;
        for _ in 0..4 {
            let t = fail(state, failures);
            assert_eq!(t.state, HealthState::Enabled);
            assert!(!t.newly_disabled);
            state = t.state;
            failures = t.consecutive_failures;
        }
        let t = fail(state, failures);
        assert_eq!(t.state, HealthState::Disabled);
        assert_eq!(t.consecutive_failures, 5);
        assert!(t.newly_disabled);

        // Further failures keep counting but never disable again
        let t2 = fail(t.state, t.consecutive_failures);
        assert_eq!(t2.state, HealthState::Disabled);
        assert_eq!(t2.consecutive_failures, 6);
        assert!(!t2.newly_disabled);
    }

    #[test]
    fn test_success_resets_counter() {
        let t = fail(HealthState::Enabled, 3);
        assert_eq!(t.consecutive_failures, 4);
        let t = transition(t.state, t.consecutive_failures, HealthSignal::Success, DEFAULT_DISABLE_THRESHOLD);
        assert_eq!(t.consecutive_failures, 0);
        assert_eq!(t.state, HealthState::Enabled);

        // Intervening success means four more failures do not disable
        let mut failures = t.consecutive_failures;
        for _ in 0..4 {
            let next = fail(HealthState::Enabled, failures);
            assert!(!next.newly_disabled);
            failures = next.consecutive_failures;
        }
    }

    #[test]
    fn test_success_does_not_reenable() {
        let t = transition(HealthState::Disabled, 7, HealthSignal::Success, DEFAULT_DISABLE_THRESHOLD);
        assert_eq!(t.state, HealthState::Disabled);
        assert_eq!(t.consecutive_failures, 0);
    }

    #[test]
    fn test_operator_enable() {
        let t = operator_enable();
        assert_eq!(t.state, HealthState::Enabled);
        assert_eq!(t.consecutive_failures, 0);
    }
}
