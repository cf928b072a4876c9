//! API request and response models for registration, ingestion and audit endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::db::models::webhooks::{
    AttemptFilter, AttemptOutcome, DeliveryAttemptRecord, DeliveryJob, DeliveryStatus, HealthState, JobFilter, Subscription,
};
use crate::types::{AttemptId, EventId, JobId, SubscriptionId};

/// Request to register a new subscription.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SubscriptionCreate {
    /// HTTPS URL to receive events
    pub url: String,
    /// Event types to receive, e.g. `["order.completed"]`. At least one is required.
    pub events: Vec<String>,
    /// Optional description to identify this subscription
    #[serde(default)]
    pub description: Option<String>,
    /// Not accepted. Signing secrets are always generated by the server; a request carrying this
    /// field is rejected.
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub secret: Option<serde_json::Value>,
}

/// Subscription as shown to operators. The signing secret is never included.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubscriptionResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: SubscriptionId,
    pub url: String,
    pub events: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub health_state: HealthState,
    pub consecutive_failures: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Subscription> for SubscriptionResponse {
    fn from(subscription: Subscription) -> Self {
        Self {
            id: subscription.id,
            url: subscription.target_url,
            events: subscription.event_types,
            description: subscription.description,
            health_state: subscription.health_state,
            consecutive_failures: subscription.consecutive_failures,
            disabled_at: subscription.disabled_at,
            created_at: subscription.created_at,
            updated_at: subscription.updated_at,
        }
    }
}

/// Response for register/rotate that includes the secret (shown only once).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubscriptionWithSecretResponse {
    #[serde(flatten)]
    pub subscription: SubscriptionResponse,
    /// The `whsec_` signing secret. Store it now: it cannot be retrieved again.
    pub secret: String,
}

impl From<Subscription> for SubscriptionWithSecretResponse {
    fn from(subscription: Subscription) -> Self {
        let secret = subscription.signing_secret.clone();
        Self {
            subscription: subscription.into(),
            secret,
        }
    }
}

/// One subscription with its most recent failed attempt, for diagnosing disablement.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubscriptionDetailResponse {
    #[serde(flatten)]
    pub subscription: SubscriptionResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failed_attempt: Option<AttemptResponse>,
}

/// An event to deliver.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct EventCreate {
    /// Event id, sent as `X-Webhook-ID`. Generated when omitted; supply it to make publishing
    /// idempotent.
    #[serde(default)]
    #[schema(value_type = Option<String>, format = "uuid")]
    pub id: Option<EventId>,
    /// Event type, e.g. `order.completed`
    #[serde(rename = "type")]
    pub event_type: String,
    /// JSON payload. Its bytes are kept as received, whitespace and key order included, and
    /// sent as the request body.
    #[schema(value_type = Object)]
    pub payload: Box<RawValue>,
    /// When the event happened. Defaults to the time of ingestion.
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EventAcceptedResponse {
    #[schema(value_type = String, format = "uuid")]
    pub event_id: EventId,
    /// Enabled subscriptions accepting this event type
    pub matched_subscriptions: usize,
    /// Delivery jobs created by this request. Zero when the event was already published.
    pub jobs_created: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: JobId,
    #[schema(value_type = String, format = "uuid")]
    pub event_id: EventId,
    #[schema(value_type = String, format = "uuid")]
    pub subscription_id: SubscriptionId,
    pub event_type: String,
    pub status: DeliveryStatus,
    pub attempt_number: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DeliveryJob> for JobResponse {
    fn from(job: DeliveryJob) -> Self {
        Self {
            id: job.id,
            event_id: job.event_id,
            subscription_id: job.subscription_id,
            event_type: job.event_type,
            status: job.status,
            attempt_number: job.attempt_number,
            next_attempt_at: job.next_attempt_at,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AttemptResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: AttemptId,
    #[schema(value_type = String, format = "uuid")]
    pub job_id: JobId,
    #[schema(value_type = String, format = "uuid")]
    pub event_id: EventId,
    #[schema(value_type = String, format = "uuid")]
    pub subscription_id: SubscriptionId,
    pub attempt_number: i32,
    pub sent_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub outcome: AttemptOutcome,
    pub latency_ms: i64,
}

impl From<DeliveryAttemptRecord> for AttemptResponse {
    fn from(record: DeliveryAttemptRecord) -> Self {
        Self {
            id: record.id,
            job_id: record.job_id,
            event_id: record.event_id,
            subscription_id: record.subscription_id,
            attempt_number: record.attempt_number,
            sent_at: record.sent_at,
            http_status: record.http_status,
            error: record.error,
            outcome: record.outcome,
            latency_ms: record.latency_ms,
        }
    }
}

/// Query parameters for listing delivery jobs
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct ListJobsQuery {
    /// Only jobs of this event
    pub event_id: Option<Uuid>,
    /// Only jobs of this subscription
    pub subscription_id: Option<Uuid>,
    /// Only jobs in this status
    pub status: Option<DeliveryStatus>,
    /// Maximum number of jobs to return (default 100, max 1000)
    pub limit: Option<i64>,
}

impl From<ListJobsQuery> for JobFilter {
    fn from(query: ListJobsQuery) -> Self {
        Self {
            event_id: query.event_id,
            subscription_id: query.subscription_id,
            status: query.status,
            limit: query.limit,
        }
    }
}

/// Query parameters for the attempt audit log
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct ListAttemptsQuery {
    /// Only attempts for this subscription
    pub subscription_id: Option<Uuid>,
    /// Only attempts for this event
    pub event_id: Option<Uuid>,
    /// Only attempts of this job
    pub job_id: Option<Uuid>,
    /// Attempts sent at or after this time (RFC 3339)
    pub since: Option<DateTime<Utc>>,
    /// Attempts sent before this time (RFC 3339)
    pub until: Option<DateTime<Utc>>,
    /// Maximum number of records to return (default 100, max 1000)
    pub limit: Option<i64>,
}

impl From<ListAttemptsQuery> for AttemptFilter {
    fn from(query: ListAttemptsQuery) -> Self {
        Self {
            subscription_id: query.subscription_id,
            event_id: query.event_id,
            job_id: query.job_id,
            since: query.since,
            until: query.until,
            limit: query.limit,
        }
    }
}
