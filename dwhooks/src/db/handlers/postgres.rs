//! PostgreSQL store.
//!
//! Atomicity comes from the database rather than from the caller:
//!
//! - claims use `FOR UPDATE SKIP LOCKED`, so concurrent workers never claim the same job
//! - health counters are a single `UPDATE ... RETURNING` with the threshold check in a `CASE`
//! - job completion is conditional on `status = 'in_flight'` and the expected attempt number
//! - job creation relies on `ON CONFLICT (event_id, subscription_id) DO NOTHING`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, postgres::PgPoolOptions};
use tracing::instrument;
use uuid::Uuid;

use super::{DeliveryJobs, DeliveryLog, Subscriptions, effective_limit};
use crate::db::errors::{DbError, Result};
use crate::db::models::webhooks::{
    AttemptFilter, AttemptRecordCreateDBRequest, ClaimedJob, DeliveryAttemptRecord, DeliveryJob, DeliveryJobCreateDBRequest, DeliveryStatus,
    HealthUpdate, JobFilter, JobTransition, Subscription, SubscriptionCreateDBRequest,
};
use crate::types::{JobId, SubscriptionId, abbrev_uuid};

#[derive(FromRow)]
struct ClaimedRow {
    #[sqlx(flatten)]
    job: DeliveryJob,
    target_url: String,
    signing_secret: String,
}

#[derive(FromRow)]
struct HealthRow {
    #[sqlx(flatten)]
    subscription: Subscription,
    newly_disabled: bool,
}

impl From<HealthRow> for HealthUpdate {
    fn from(row: HealthRow) -> Self {
        Self {
            subscription: row.subscription,
            newly_disabled: row.newly_disabled,
        }
    }
}

/// Store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(max_connections).connect(url).await?;
        Ok(Self::new(pool))
    }

    /// Apply pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        crate::migrator().run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Distinguish a missing job from one in the wrong state after a conditional update
    /// matched no rows.
    async fn completion_conflict(&self, id: JobId, attempt_number: i32) -> DbError {
        match self.get_job(id).await {
            Ok(Some(job)) => DbError::Conflict {
                entity: "delivery job",
                id: id.to_string(),
                reason: format!(
                    "expected in_flight at attempt {}, found {} at attempt {}",
                    attempt_number,
                    job.status.as_str(),
                    job.attempt_number
                ),
            },
            Ok(None) => DbError::NotFound,
            Err(e) => e,
        }
    }
}

#[async_trait]
impl Subscriptions for PostgresStore {
    #[instrument(skip(self, request), err)]
    async fn create_subscription(&self, request: &SubscriptionCreateDBRequest) -> Result<Subscription> {
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions (id, target_url, signing_secret, event_types, description)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&request.target_url)
        .bind(&request.signing_secret)
        .bind(&request.event_types)
        .bind(&request.description)
        .fetch_one(&self.pool)
        .await?;

        Ok(subscription)
    }

    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&id)), err)]
    async fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(subscription)
    }

    #[instrument(skip(self), err)]
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;

        Ok(subscriptions)
    }

    #[instrument(skip(self), err)]
    async fn enabled_subscriptions_for_event(&self, event_type: &str) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE health_state = 'enabled'
              AND event_types @> ARRAY[$1]::text[]
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;

        Ok(subscriptions)
    }

    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&id)), err)]
    async fn record_success(&self, id: SubscriptionId, now: DateTime<Utc>) -> Result<Subscription> {
        sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET consecutive_failures = 0, updated_at = $2
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DbError::NotFound)
    }

    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&id)), err)]
    async fn record_failure(&self, id: SubscriptionId, threshold: i32, now: DateTime<Utc>) -> Result<HealthUpdate> {
        let row = sqlx::query_as::<_, HealthRow>(
            r#"
            WITH prev AS (
                SELECT id, health_state AS prev_state FROM subscriptions WHERE id = $1 FOR UPDATE
            )
            UPDATE subscriptions s
            SET
                consecutive_failures = s.consecutive_failures + 1,
                health_state = CASE
                    WHEN s.health_state = 'enabled' AND s.consecutive_failures + 1 >= $2 THEN 'disabled'
                    ELSE s.health_state
                END,
                disabled_at = CASE
                    WHEN s.health_state = 'enabled' AND s.consecutive_failures + 1 >= $2 THEN $3
                    ELSE s.disabled_at
                END,
                updated_at = $3
            FROM prev
            WHERE s.id = prev.id
            RETURNING s.*, (prev.prev_state = 'enabled' AND s.health_state = 'disabled') AS newly_disabled
            "#,
        )
        .bind(id)
        .bind(threshold)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(row.into())
    }

    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&id)), err)]
    async fn enable_subscription(&self, id: SubscriptionId, now: DateTime<Utc>) -> Result<Subscription> {
        sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET health_state = 'enabled', consecutive_failures = 0, disabled_at = NULL, updated_at = $2
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DbError::NotFound)
    }

    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&id)), err)]
    async fn disable_subscription(&self, id: SubscriptionId, now: DateTime<Utc>) -> Result<HealthUpdate> {
        let row = sqlx::query_as::<_, HealthRow>(
            r#"
            WITH prev AS (
                SELECT id, health_state AS prev_state FROM subscriptions WHERE id = $1 FOR UPDATE
            )
            UPDATE subscriptions s
            SET
                health_state = 'disabled',
                disabled_at = CASE WHEN s.health_state = 'enabled' THEN $2 ELSE s.disabled_at END,
                updated_at = $2
            FROM prev
            WHERE s.id = prev.id
            RETURNING s.*, (prev.prev_state = 'enabled') AS newly_disabled
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(row.into())
    }

    #[instrument(skip(self, new_secret), fields(subscription_id = %abbrev_uuid(&id)), err)]
    async fn rotate_secret(&self, id: SubscriptionId, new_secret: String) -> Result<Subscription> {
        sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET signing_secret = $2, updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(new_secret)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DbError::NotFound)
    }
}

#[async_trait]
impl DeliveryJobs for PostgresStore {
    #[instrument(skip(self, requests), fields(count = requests.len()), err)]
    async fn create_jobs(&self, requests: &[DeliveryJobCreateDBRequest]) -> Result<Vec<DeliveryJob>> {
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(requests.len());

        for request in requests {
            let job = sqlx::query_as::<_, DeliveryJob>(
                r#"
                INSERT INTO delivery_jobs (id, event_id, subscription_id, event_type, payload, next_attempt_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (event_id, subscription_id) DO NOTHING
                RETURNING *
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(request.event_id)
            .bind(request.subscription_id)
            .bind(&request.event_type)
            .bind(&request.payload)
            .bind(request.next_attempt_at)
            .fetch_optional(&mut *tx)
            .await?;

            created.extend(job);
        }

        tx.commit().await?;
        Ok(created)
    }

    #[instrument(skip(self), err)]
    async fn claim_due_jobs(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ClaimedJob>> {
        let mut tx = self.pool.begin().await?;

        let exhausted = sqlx::query(
            r#"
            UPDATE delivery_jobs j
            SET status = 'exhausted', updated_at = $1
            FROM subscriptions s
            WHERE s.id = j.subscription_id
              AND j.status = 'pending'
              AND j.next_attempt_at <= $1
              AND s.health_state = 'disabled'
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if exhausted.rows_affected() > 0 {
            tracing::debug!(count = exhausted.rows_affected(), "Exhausted due jobs of disabled subscriptions");
        }

        let mut rows = sqlx::query_as::<_, ClaimedRow>(
            r#"
            WITH due AS (
                SELECT j.id
                FROM delivery_jobs j
                JOIN subscriptions s ON s.id = j.subscription_id
                WHERE j.status = 'pending'
                  AND j.next_attempt_at <= $1
                  AND s.health_state = 'enabled'
                ORDER BY j.next_attempt_at ASC, j.created_at ASC, j.id ASC
                LIMIT $2
                FOR UPDATE OF j SKIP LOCKED
            )
            UPDATE delivery_jobs j
            SET status = 'in_flight', claimed_at = $1, updated_at = $1
            FROM due, subscriptions s
            WHERE j.id = due.id AND s.id = j.subscription_id
            RETURNING j.*, s.target_url, s.signing_secret
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        rows.sort_by_key(|row| (row.job.next_attempt_at, row.job.created_at, row.job.id));
        Ok(rows
            .into_iter()
            .map(|row| ClaimedJob {
                job: row.job,
                target_url: row.target_url,
                signing_secret: row.signing_secret,
            })
            .collect())
    }

    #[instrument(skip(self), fields(job_id = %abbrev_uuid(&id)), err)]
    async fn complete_job(&self, id: JobId, attempt_number: i32, transition: JobTransition, now: DateTime<Utc>) -> Result<DeliveryJob> {
        let (status, next_attempt_number, next_attempt_at) = match transition {
            JobTransition::Succeeded => (DeliveryStatus::Succeeded, None, None),
            JobTransition::Exhausted => (DeliveryStatus::Exhausted, None, None),
            JobTransition::Retry {
                next_attempt_number,
                next_attempt_at,
            } => (DeliveryStatus::Pending, Some(next_attempt_number), Some(next_attempt_at)),
        };

        let job = sqlx::query_as::<_, DeliveryJob>(
            r#"
            UPDATE delivery_jobs j
            SET
                status = CASE
                    WHEN $3::text = 'pending' AND s.health_state = 'disabled' THEN 'exhausted'
                    ELSE $3::text
                END,
                attempt_number = CASE
                    WHEN $3::text = 'pending' AND s.health_state = 'enabled' THEN $4::integer
                    ELSE j.attempt_number
                END,
                next_attempt_at = CASE
                    WHEN $3::text = 'pending' AND s.health_state = 'enabled' THEN $5::timestamptz
                    ELSE j.next_attempt_at
                END,
                claimed_at = NULL,
                updated_at = $6
            FROM subscriptions s
            WHERE j.id = $1
              AND s.id = j.subscription_id
              AND j.status = 'in_flight'
              AND j.attempt_number = $2
            RETURNING j.*
            "#,
        )
        .bind(id)
        .bind(attempt_number)
        .bind(status.as_str())
        .bind(next_attempt_number)
        .bind(next_attempt_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match job {
            Some(job) => Ok(job),
            None => Err(self.completion_conflict(id, attempt_number).await),
        }
    }

    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&subscription_id)), err)]
    async fn exhaust_pending_jobs(&self, subscription_id: SubscriptionId, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 'exhausted', updated_at = $2
            WHERE subscription_id = $1 AND status = 'pending'
            "#,
        )
        .bind(subscription_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn release_stale_claims(&self, claimed_before: DateTime<Utc>, max_attempts: i32, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs j
            SET
                status = CASE
                    WHEN r.recorded AND j.attempt_number >= $2 THEN 'exhausted'
                    ELSE 'pending'
                END,
                attempt_number = CASE
                    WHEN r.recorded AND j.attempt_number < $2 THEN j.attempt_number + 1
                    ELSE j.attempt_number
                END,
                next_attempt_at = CASE
                    WHEN r.recorded AND j.attempt_number >= $2 THEN j.next_attempt_at
                    ELSE $3
                END,
                claimed_at = NULL,
                updated_at = $3
            FROM (
                SELECT d.id, EXISTS (
                    SELECT 1 FROM delivery_attempts a
                    WHERE a.job_id = d.id AND a.attempt_number = d.attempt_number
                ) AS recorded
                FROM delivery_jobs d
                WHERE d.status = 'in_flight' AND d.claimed_at < $1
            ) r
            WHERE j.id = r.id AND j.status = 'in_flight'
            "#,
        )
        .bind(claimed_before)
        .bind(max_attempts)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(job_id = %abbrev_uuid(&id)), err)]
    async fn get_job(&self, id: JobId) -> Result<Option<DeliveryJob>> {
        let job = sqlx::query_as::<_, DeliveryJob>("SELECT * FROM delivery_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    #[instrument(skip(self), err)]
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<DeliveryJob>> {
        let jobs = sqlx::query_as::<_, DeliveryJob>(
            r#"
            SELECT * FROM delivery_jobs
            WHERE ($1::uuid IS NULL OR event_id = $1)
              AND ($2::uuid IS NULL OR subscription_id = $2)
              AND ($3::text IS NULL OR status = $3)
            ORDER BY created_at ASC, id ASC
            LIMIT $4
            "#,
        )
        .bind(filter.event_id)
        .bind(filter.subscription_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(effective_limit(filter.limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }
}

#[async_trait]
impl DeliveryLog for PostgresStore {
    #[instrument(skip(self, request), fields(job_id = %abbrev_uuid(&request.job_id), attempt = request.attempt_number), err)]
    async fn append_attempt(&self, request: &AttemptRecordCreateDBRequest) -> Result<DeliveryAttemptRecord> {
        let record = sqlx::query_as::<_, DeliveryAttemptRecord>(
            r#"
            INSERT INTO delivery_attempts
                (id, job_id, event_id, subscription_id, attempt_number, sent_at, http_status, error, outcome, latency_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request.job_id)
        .bind(request.event_id)
        .bind(request.subscription_id)
        .bind(request.attempt_number)
        .bind(request.sent_at)
        .bind(request.http_status)
        .bind(&request.error)
        .bind(request.outcome.as_str())
        .bind(request.latency_ms)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    #[instrument(skip(self), err)]
    async fn query_attempts(&self, filter: &AttemptFilter) -> Result<Vec<DeliveryAttemptRecord>> {
        let records = sqlx::query_as::<_, DeliveryAttemptRecord>(
            r#"
            SELECT * FROM delivery_attempts
            WHERE ($1::uuid IS NULL OR subscription_id = $1)
              AND ($2::uuid IS NULL OR event_id = $2)
              AND ($3::uuid IS NULL OR job_id = $3)
              AND ($4::timestamptz IS NULL OR sent_at >= $4)
              AND ($5::timestamptz IS NULL OR sent_at < $5)
            ORDER BY sent_at DESC, attempt_number DESC
            LIMIT $6
            "#,
        )
        .bind(filter.subscription_id)
        .bind(filter.event_id)
        .bind(filter.job_id)
        .bind(filter.since)
        .bind(filter.until)
        .bind(effective_limit(filter.limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&subscription_id)), err)]
    async fn last_failed_attempt(&self, subscription_id: SubscriptionId) -> Result<Option<DeliveryAttemptRecord>> {
        let record = sqlx::query_as::<_, DeliveryAttemptRecord>(
            r#"
            SELECT * FROM delivery_attempts
            WHERE subscription_id = $1 AND outcome <> 'success'
            ORDER BY sent_at DESC, attempt_number DESC
            LIMIT 1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}
