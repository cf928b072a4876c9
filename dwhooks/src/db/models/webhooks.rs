//! Store models for subscriptions, delivery jobs and the attempt log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

use crate::types::{AttemptId, EventId, JobId, SubscriptionId};

/// Returned when a persisted enum column holds a value this build does not know.
#[derive(Debug, thiserror::Error)]
#[error("Unknown {kind}: {value}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

/// Endpoint health. `Enabled` is the initial state and neither state is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Enabled,
    Disabled,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        }
    }
}

impl TryFrom<String> for HealthState {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "enabled" => Ok(Self::Enabled),
            "disabled" => Ok(Self::Disabled),
            _ => Err(UnknownVariant {
                kind: "health state",
                value,
            }),
        }
    }
}

/// A registered endpoint.
#[derive(Debug, Clone, FromRow)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub target_url: String,
    /// `whsec_` prefixed secret. Never serialized outside the create/rotate responses.
    pub signing_secret: String,
    pub event_types: Vec<String>,
    pub description: Option<String>,
    #[sqlx(try_from = "String")]
    pub health_state: HealthState,
    pub consecutive_failures: i32,
    pub disabled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Whether a newly published event of this type should produce a job for this subscription.
    pub fn accepts_event(&self, event_type: &str) -> bool {
        self.health_state == HealthState::Enabled && self.event_types.iter().any(|t| t == event_type)
    }
}

/// Delivery job status.
///
/// ```text
/// pending ──claim──▶ in_flight ──success──▶ succeeded
///    ▲                   │
///    └────retry──────────┤
///                        └──permanent / last attempt──▶ exhausted
/// pending ──subscription disabled──▶ exhausted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InFlight,
    Succeeded,
    Exhausted,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Succeeded => "succeeded",
            Self::Exhausted => "exhausted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Exhausted)
    }
}

impl TryFrom<String> for DeliveryStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "succeeded" => Ok(Self::Succeeded),
            "exhausted" => Ok(Self::Exhausted),
            _ => Err(UnknownVariant {
                kind: "delivery status",
                value,
            }),
        }
    }
}

/// One (event, subscription) pairing. Carries its own copy of the event payload so a
/// claimed job is a complete dispatch snapshot.
#[derive(Debug, Clone, FromRow)]
pub struct DeliveryJob {
    pub id: JobId,
    pub event_id: EventId,
    pub subscription_id: SubscriptionId,
    pub event_type: String,
    pub payload: Vec<u8>,
    /// 1-based number of the next (or, once terminal, the last) attempt.
    pub attempt_number: i32,
    pub next_attempt_at: DateTime<Utc>,
    #[sqlx(try_from = "String")]
    pub status: DeliveryStatus,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A job handed out by a claim, joined with the endpoint details needed to send it.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: DeliveryJob,
    pub target_url: String,
    pub signing_secret: String,
}

/// Classified result of one HTTP attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    RetryableFailure,
    PermanentFailure,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RetryableFailure => "retryable_failure",
            Self::PermanentFailure => "permanent_failure",
        }
    }
}

impl TryFrom<String> for AttemptOutcome {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "success" => Ok(Self::Success),
            "retryable_failure" => Ok(Self::RetryableFailure),
            "permanent_failure" => Ok(Self::PermanentFailure),
            _ => Err(UnknownVariant {
                kind: "attempt outcome",
                value,
            }),
        }
    }
}

/// Append-only audit record of a single HTTP attempt. Unique on `(job_id, attempt_number)`.
#[derive(Debug, Clone, FromRow)]
pub struct DeliveryAttemptRecord {
    pub id: AttemptId,
    pub job_id: JobId,
    pub event_id: EventId,
    pub subscription_id: SubscriptionId,
    pub attempt_number: i32,
    pub sent_at: DateTime<Utc>,
    pub http_status: Option<i32>,
    /// Transport error description when no response was received.
    pub error: Option<String>,
    #[sqlx(try_from = "String")]
    pub outcome: AttemptOutcome,
    pub latency_ms: i64,
}

/// Result of an atomic health counter update.
#[derive(Debug, Clone)]
pub struct HealthUpdate {
    pub subscription: Subscription,
    /// True only for the update that moved the subscription from enabled to disabled.
    pub newly_disabled: bool,
}

/// How a completed attempt moves its job out of `in_flight`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTransition {
    Succeeded,
    Exhausted,
    Retry {
        next_attempt_number: i32,
        next_attempt_at: DateTime<Utc>,
    },
}

/// Request to create a new subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionCreateDBRequest {
    pub target_url: String,
    pub signing_secret: String,
    pub event_types: Vec<String>,
    pub description: Option<String>,
}

/// Request to create a delivery job.
#[derive(Debug, Clone)]
pub struct DeliveryJobCreateDBRequest {
    pub event_id: EventId,
    pub subscription_id: SubscriptionId,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub next_attempt_at: DateTime<Utc>,
}

/// Request to append an attempt record.
#[derive(Debug, Clone)]
pub struct AttemptRecordCreateDBRequest {
    pub job_id: JobId,
    pub event_id: EventId,
    pub subscription_id: SubscriptionId,
    pub attempt_number: i32,
    pub sent_at: DateTime<Utc>,
    pub http_status: Option<i32>,
    pub error: Option<String>,
    pub outcome: AttemptOutcome,
    pub latency_ms: i64,
}

/// Job listing filter. `None` fields do not constrain the result.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub event_id: Option<EventId>,
    pub subscription_id: Option<SubscriptionId>,
    pub status: Option<DeliveryStatus>,
    pub limit: Option<i64>,
}

/// Attempt log query. Results are ordered newest first.
#[derive(Debug, Clone, Default)]
pub struct AttemptFilter {
    pub subscription_id: Option<SubscriptionId>,
    pub event_id: Option<EventId>,
    pub job_id: Option<JobId>,
    /// Inclusive lower bound on `sent_at`
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `sent_at`
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl AttemptFilter {
    pub fn matches(&self, record: &DeliveryAttemptRecord) -> bool {
        self.subscription_id.is_none_or(|id| record.subscription_id == id)
            && self.event_id.is_none_or(|id| record.event_id == id)
            && self.job_id.is_none_or(|id| record.job_id == id)
            && self.since.is_none_or(|t| record.sent_at >= t)
            && self.until.is_none_or(|t| record.sent_at < t)
    }
}

impl JobFilter {
    pub fn matches(&self, job: &DeliveryJob) -> bool {
        self.event_id.is_none_or(|id| job.event_id == id)
            && self.subscription_id.is_none_or(|id| job.subscription_id == id)
            && self.status.is_none_or(|s| job.status == s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn subscription(state: HealthState, types: &[&str]) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: Uuid::new_v4(),
            target_url: "https://example.com/hook".to_string(),
            signing_secret: "whsec_x".to_string(),
            event_types: types.iter().map(|s| s.to_string()).collect(),
            description: None,
            health_state: state,
            consecutive_failures: 0,
            disabled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_accepts_event() {
        let sub = subscription(HealthState::Enabled, &["order.completed", "order.refunded"]);
        assert!(sub.accepts_event("order.completed"));
        assert!(!sub.accepts_event("order.created"));

        let disabled = subscription(HealthState::Disabled, &["order.completed"]);
        assert!(!disabled.accepts_event("order.completed"));
    }

    #[test]
    fn test_status_string_mapping() {
        for status in [
            DeliveryStatus::Pending,
            DeliveryStatus::InFlight,
            DeliveryStatus::Succeeded,
            DeliveryStatus::Exhausted,
        ] {
            assert_eq!(DeliveryStatus::try_from(status.as_str().to_string()).unwrap(), status);
        }
        assert!(DeliveryStatus::try_from("delivered".to_string()).is_err());
        assert!(HealthState::try_from("paused".to_string()).is_err());
    }

    #[test]
    fn test_attempt_filter_time_range() {
        let now = Utc::now();
        let record = DeliveryAttemptRecord {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            attempt_number: 1,
            sent_at: now,
            http_status: Some(200),
            error: None,
            outcome: AttemptOutcome::Success,
            latency_ms: 3,
        };

        assert!(AttemptFilter::default().matches(&record));
        assert!(
            AttemptFilter {
                since: Some(now),
                ..Default::default()
            }
            .matches(&record)
        );
        assert!(
            !AttemptFilter {
                until: Some(now),
                ..Default::default()
            }
            .matches(&record)
        );
        assert!(
            !AttemptFilter {
                subscription_id: Some(Uuid::new_v4()),
                ..Default::default()
            }
            .matches(&record)
        );
    }
}
