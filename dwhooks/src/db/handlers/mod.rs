//! Store interfaces and implementations.
//!
//! Every operation that must be atomic is a single trait method, so implementations can
//! choose their own mechanism (one mutex acquisition, one SQL statement or transaction):
//!
//! - claiming due jobs (`pending → in_flight`)
//! - completing a job, conditional on it still being `in_flight` at the expected attempt
//! - recording a success or failure against a subscription's health counter
//! - exhausting every pending job of a subscription
//!
//! # Available Stores
//!
//! - [`InMemoryStore`]: single-process store, used by default and in tests
//! - [`PostgresStore`]: durable store backed by `sqlx`

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::errors::Result;
use crate::db::models::webhooks::{
    AttemptFilter, AttemptRecordCreateDBRequest, ClaimedJob, DeliveryAttemptRecord, DeliveryJob, DeliveryJobCreateDBRequest, HealthUpdate,
    JobFilter, JobTransition, Subscription, SubscriptionCreateDBRequest,
};
use crate::types::{JobId, SubscriptionId};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Default page size for list queries without an explicit limit.
pub const DEFAULT_LIST_LIMIT: i64 = 100;

/// Upper bound on any list query.
pub const MAX_LIST_LIMIT: i64 = 1000;

pub(crate) fn effective_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

/// Endpoint registry.
#[async_trait]
pub trait Subscriptions: Send + Sync {
    async fn create_subscription(&self, request: &SubscriptionCreateDBRequest) -> Result<Subscription>;

    async fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>>;

    /// All subscriptions, oldest first.
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>>;

    /// Enabled subscriptions whose event types contain `event_type`.
    async fn enabled_subscriptions_for_event(&self, event_type: &str) -> Result<Vec<Subscription>>;

    /// Reset the failure counter. Does not change the health state.
    async fn record_success(&self, id: SubscriptionId, now: DateTime<Utc>) -> Result<Subscription>;

    /// Atomically increment the failure counter, disabling the subscription when it reaches
    /// `threshold` while enabled.
    async fn record_failure(&self, id: SubscriptionId, threshold: i32, now: DateTime<Utc>) -> Result<HealthUpdate>;

    /// Operator re-enable: `enabled`, counter 0, `disabled_at` cleared.
    async fn enable_subscription(&self, id: SubscriptionId, now: DateTime<Utc>) -> Result<Subscription>;

    /// Operator disable. `newly_disabled` is false when it was already disabled.
    async fn disable_subscription(&self, id: SubscriptionId, now: DateTime<Utc>) -> Result<HealthUpdate>;

    async fn rotate_secret(&self, id: SubscriptionId, new_secret: String) -> Result<Subscription>;
}

/// Delivery job bookkeeping.
#[async_trait]
pub trait DeliveryJobs: Send + Sync {
    /// Create jobs, skipping any (event, subscription) pair that already has one. Returns only
    /// the newly created jobs.
    async fn create_jobs(&self, requests: &[DeliveryJobCreateDBRequest]) -> Result<Vec<DeliveryJob>>;

    /// Move up to `limit` due pending jobs to `in_flight`, oldest `next_attempt_at` first.
    ///
    /// Due jobs whose subscription is disabled or missing are exhausted instead of claimed.
    async fn claim_due_jobs(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ClaimedJob>>;

    /// Apply the outcome of attempt `attempt_number`. Fails with [`DbError::Conflict`] when the
    /// job is no longer in flight at that attempt. A retry of a job whose subscription has been
    /// disabled meanwhile exhausts it instead.
    ///
    /// [`DbError::Conflict`]: crate::db::errors::DbError::Conflict
    async fn complete_job(&self, id: JobId, attempt_number: i32, transition: JobTransition, now: DateTime<Utc>) -> Result<DeliveryJob>;

    /// Exhaust every pending job of a subscription. Returns the number of jobs affected.
    async fn exhaust_pending_jobs(&self, subscription_id: SubscriptionId, now: DateTime<Utc>) -> Result<u64>;

    /// Return jobs stuck `in_flight` since before `claimed_before` to `pending`.
    ///
    /// A job whose current attempt was already recorded moves on to the next attempt (or is
    /// exhausted at `max_attempts`) so the attempt log never gets a duplicate key.
    async fn release_stale_claims(&self, claimed_before: DateTime<Utc>, max_attempts: i32, now: DateTime<Utc>) -> Result<u64>;

    async fn get_job(&self, id: JobId) -> Result<Option<DeliveryJob>>;

    /// Jobs matching `filter`, oldest first.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<DeliveryJob>>;
}

/// Append-only attempt log.
#[async_trait]
pub trait DeliveryLog: Send + Sync {
    /// Fails with [`DbError::UniqueViolation`] if `(job_id, attempt_number)` is already recorded.
    ///
    /// [`DbError::UniqueViolation`]: crate::db::errors::DbError::UniqueViolation
    async fn append_attempt(&self, request: &AttemptRecordCreateDBRequest) -> Result<DeliveryAttemptRecord>;

    /// Records matching `filter`, newest first.
    async fn query_attempts(&self, filter: &AttemptFilter) -> Result<Vec<DeliveryAttemptRecord>>;

    /// Most recent non-success attempt for a subscription.
    async fn last_failed_attempt(&self, subscription_id: SubscriptionId) -> Result<Option<DeliveryAttemptRecord>>;
}

/// Everything the engine needs from storage.
pub trait Store: Subscriptions + DeliveryJobs + DeliveryLog {}

impl<T: Subscriptions + DeliveryJobs + DeliveryLog> Store for T {}
