//! Retry scheduling decision.
//!
//! Pure function of (outcome, attempt number): no clocks, no I/O. The coordinator turns a
//! [`RetryDecision`] into a job transition by adding the delay to its own `now`.

use chrono::{DateTime, TimeDelta, Utc};

use crate::db::models::webhooks::{AttemptOutcome, JobTransition};

/// Default delays in seconds before attempts 1 to 5: immediate, 1m, 5m, 1h, 24h.
pub const DEFAULT_RETRY_SCHEDULE_SECS: &[i64] = &[0, 60, 300, 3600, 86400];

/// Why a job stopped being retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustReason {
    PermanentFailure,
    AttemptsExhausted,
}

impl ExhaustReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermanentFailure => "permanent_failure",
            Self::AttemptsExhausted => "attempts_exhausted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Succeeded,
    Retry { next_attempt_number: i32, delay: TimeDelta },
    Exhausted { reason: ExhaustReason },
}

impl RetryDecision {
    pub fn into_transition(self, now: DateTime<Utc>) -> JobTransition {
        match self {
            Self::Succeeded => JobTransition::Succeeded,
            Self::Exhausted { .. } => JobTransition::Exhausted,
            Self::Retry {
                next_attempt_number,
                delay,
            } => JobTransition::Retry {
                next_attempt_number,
                next_attempt_at: now + delay,
            },
        }
    }
}

/// Delay table indexed by attempt number. Its length is the maximum number of attempts.
///
/// Entry 0 is the delay before attempt 1; it is 0 in every valid configuration, as jobs are
/// created due immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    delays_secs: Vec<i64>,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_SCHEDULE_SECS.to_vec())
    }
}

impl RetrySchedule {
    pub fn new(delays_secs: Vec<i64>) -> Self {
        Self { delays_secs }
    }

    pub fn max_attempts(&self) -> i32 {
        self.delays_secs.len() as i32
    }

    /// Delay before the given 1-based attempt, or `None` past the end of the table.
    pub fn delay_before(&self, attempt_number: i32) -> Option<TimeDelta> {
        let index = usize::try_from(attempt_number.checked_sub(1)?).ok()?;
        self.delays_secs.get(index).map(|secs| TimeDelta::seconds(*secs))
    }

    pub fn decide(&self, outcome: AttemptOutcome, attempt_number: i32) -> RetryDecision {
        match outcome {
            AttemptOutcome::Success => RetryDecision::Succeeded,
            AttemptOutcome::PermanentFailure => RetryDecision::Exhausted {
                reason: ExhaustReason::PermanentFailure,
            },
            AttemptOutcome::RetryableFailure => {
                let next_attempt_number = attempt_number + 1;
                match self.delay_before(next_attempt_number) {
                    Some(delay) if attempt_number < self.max_attempts() => RetryDecision::Retry {
                        next_attempt_number,
                        delay,
                    },
                    _ => RetryDecision::Exhausted {
                        reason: ExhaustReason::AttemptsExhausted,
                    },
                }
            }
        }
    }
}
