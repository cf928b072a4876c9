//! In-memory store.
//!
//! All state lives behind one `RwLock`; every trait method takes the lock once, so each
//! multi-row operation (claim, health update, exhaust-pending) is atomic with respect to the
//! others. The lock is never held across an `.await`. Suitable for tests and single-process
//! deployments; everything is lost on restart.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::{DeliveryJobs, DeliveryLog, Subscriptions, effective_limit};
use crate::db::errors::{DbError, Result};
use crate::db::models::webhooks::{
    AttemptFilter, AttemptOutcome, AttemptRecordCreateDBRequest, ClaimedJob, DeliveryAttemptRecord, DeliveryJob,
    DeliveryJobCreateDBRequest, DeliveryStatus, HealthState, HealthUpdate, JobFilter, JobTransition, Subscription,
    SubscriptionCreateDBRequest,
};
use crate::types::{EventId, JobId, SubscriptionId};
use crate::webhooks::health::{self, HealthSignal, HealthTransition};

/// Job plus its insertion sequence, used as a stable tiebreak when ordering.
#[derive(Clone)]
struct StoredJob {
    seq: u64,
    job: DeliveryJob,
}

#[derive(Default)]
struct State {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    jobs: HashMap<JobId, StoredJob>,
    job_keys: HashMap<(EventId, SubscriptionId), JobId>,
    attempts: Vec<DeliveryAttemptRecord>,
    attempt_keys: HashSet<(JobId, i32)>,
    next_seq: u64,
}

impl State {
    fn subscription_mut(&mut self, id: SubscriptionId) -> Result<&mut Subscription> {
        self.subscriptions.get_mut(&id).ok_or(DbError::NotFound)
    }

    fn subscription_disabled_or_missing(&self, id: &SubscriptionId) -> bool {
        self.subscriptions
            .get(id)
            .is_none_or(|s| s.health_state == HealthState::Disabled)
    }

    fn sorted_jobs<'a>(&'a self, filter: impl Fn(&DeliveryJob) -> bool) -> Vec<&'a StoredJob> {
        let mut jobs: Vec<&StoredJob> = self.jobs.values().filter(|stored| filter(&stored.job)).collect();
        jobs.sort_by_key(|stored| (stored.job.next_attempt_at, stored.seq));
        jobs
    }
}

fn apply_health(subscription: &mut Subscription, transition: HealthTransition, now: DateTime<Utc>) {
    if transition.newly_disabled {
        subscription.disabled_at = Some(now);
    }
    subscription.health_state = transition.state;
    subscription.consecutive_failures = transition.consecutive_failures;
    subscription.updated_at = now;
}

/// In-memory implementation of [`Store`](super::Store).
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Subscriptions for InMemoryStore {
    async fn create_subscription(&self, request: &SubscriptionCreateDBRequest) -> Result<Subscription> {
        let now = Utc::now();
        let subscription = Subscription {
            id: Uuid::new_v4(),
            target_url: request.target_url.clone(),
            signing_secret: request.signing_secret.clone(),
            event_types: request.event_types.clone(),
            description: request.description.clone(),
            health_state: HealthState::Enabled,
            consecutive_failures: 0,
            disabled_at: None,
            created_at: now,
            updated_at: now,
        };
        self.state.write().subscriptions.insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    async fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        Ok(self.state.read().subscriptions.get(&id).cloned())
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let mut subscriptions: Vec<Subscription> = self.state.read().subscriptions.values().cloned().collect();
        subscriptions.sort_by_key(|s| (s.created_at, s.id));
        Ok(subscriptions)
    }

    async fn enabled_subscriptions_for_event(&self, event_type: &str) -> Result<Vec<Subscription>> {
        let mut subscriptions: Vec<Subscription> = self
            .state
            .read()
            .subscriptions
            .values()
            .filter(|s| s.accepts_event(event_type))
            .cloned()
            .collect();
        subscriptions.sort_by_key(|s| (s.created_at, s.id));
        Ok(subscriptions)
    }

    async fn record_success(&self, id: SubscriptionId, now: DateTime<Utc>) -> Result<Subscription> {
        let mut state = self.state.write();
        let subscription = state.subscription_mut(id)?;
        let transition = health::transition(subscription.health_state, subscription.consecutive_failures, HealthSignal::Success, 0);
        apply_health(subscription, transition, now);
        Ok(subscription.clone())
    }

    async fn record_failure(&self, id: SubscriptionId, threshold: i32, now: DateTime<Utc>) -> Result<HealthUpdate> {
        let mut state = self.state.write();
        let subscription = state.subscription_mut(id)?;
        let transition = health::transition(
            subscription.health_state,
            subscription.consecutive_failures,
            HealthSignal::Failure,
            threshold,
        );
        apply_health(subscription, transition, now);
        Ok(HealthUpdate {
            subscription: subscription.clone(),
            newly_disabled: transition.newly_disabled,
        })
    }

    async fn enable_subscription(&self, id: SubscriptionId, now: DateTime<Utc>) -> Result<Subscription> {
        let mut state = self.state.write();
        let subscription = state.subscription_mut(id)?;
        apply_health(subscription, health::operator_enable(), now);
        subscription.disabled_at = None;
        Ok(subscription.clone())
    }

    async fn disable_subscription(&self, id: SubscriptionId, now: DateTime<Utc>) -> Result<HealthUpdate> {
        let mut state = self.state.write();
        let subscription = state.subscription_mut(id)?;
        let newly_disabled = subscription.health_state == HealthState::Enabled;
        if newly_disabled {
            subscription.health_state = HealthState::Disabled;
            subscription.disabled_at = Some(now);
            subscription.updated_at = now;
        }
        Ok(HealthUpdate {
            subscription: subscription.clone(),
            newly_disabled,
        })
    }

    async fn rotate_secret(&self, id: SubscriptionId, new_secret: String) -> Result<Subscription> {
        let mut state = self.state.write();
        let subscription = state.subscription_mut(id)?;
        subscription.signing_secret = new_secret;
        subscription.updated_at = Utc::now();
        Ok(subscription.clone())
    }
}

#[async_trait]
impl DeliveryJobs for InMemoryStore {
    async fn create_jobs(&self, requests: &[DeliveryJobCreateDBRequest]) -> Result<Vec<DeliveryJob>> {
        let mut state = self.state.write();
        let now = Utc::now();
        let mut created = Vec::new();

        for request in requests {
            let key = (request.event_id, request.subscription_id);
            if state.job_keys.contains_key(&key) {
                continue;
            }
            if !state.subscriptions.contains_key(&request.subscription_id) {
                return Err(DbError::NotFound);
            }

            let job = DeliveryJob {
                id: Uuid::new_v4(),
                event_id: request.event_id,
                subscription_id: request.subscription_id,
                event_type: request.event_type.clone(),
                payload: request.payload.clone(),
                attempt_number: 1,
                next_attempt_at: request.next_attempt_at,
                status: DeliveryStatus::Pending,
                claimed_at: None,
                created_at: now,
                updated_at: now,
            };
            let seq = state.next_seq;
            state.next_seq += 1;
            state.job_keys.insert(key, job.id);
            state.jobs.insert(job.id, StoredJob { seq, job: job.clone() });
            created.push(job);
        }

        Ok(created)
    }

    async fn claim_due_jobs(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ClaimedJob>> {
        let mut state = self.state.write();

        let due: Vec<JobId> = state
            .sorted_jobs(|job| job.status == DeliveryStatus::Pending && job.next_attempt_at <= now)
            .into_iter()
            .map(|stored| stored.job.id)
            .collect();

        let mut claimed = Vec::new();
        for id in due {
            if claimed.len() as i64 >= limit {
                break;
            }
            let Some(subscription_id) = state.jobs.get(&id).map(|s| s.job.subscription_id) else {
                continue;
            };
            let disabled = state.subscription_disabled_or_missing(&subscription_id);
            let endpoint = state
                .subscriptions
                .get(&subscription_id)
                .map(|s| (s.target_url.clone(), s.signing_secret.clone()));

            let Some(stored) = state.jobs.get_mut(&id) else {
                continue;
            };
            stored.job.updated_at = now;
            match endpoint {
                Some((target_url, signing_secret)) if !disabled => {
                    stored.job.status = DeliveryStatus::InFlight;
                    stored.job.claimed_at = Some(now);
                    claimed.push(ClaimedJob {
                        job: stored.job.clone(),
                        target_url,
                        signing_secret,
                    });
                }
                _ => {
                    tracing::debug!(job_id = %id, subscription_id = %subscription_id, "Subscription disabled, exhausting job at claim");
                    stored.job.status = DeliveryStatus::Exhausted;
                }
            }
        }

        Ok(claimed)
    }

    async fn complete_job(&self, id: JobId, attempt_number: i32, transition: JobTransition, now: DateTime<Utc>) -> Result<DeliveryJob> {
        let mut state = self.state.write();
        let subscription_id = state.jobs.get(&id).map(|s| s.job.subscription_id).ok_or(DbError::NotFound)?;
        let disabled = state.subscription_disabled_or_missing(&subscription_id);

        let stored = state.jobs.get_mut(&id).ok_or(DbError::NotFound)?;
        let job = &mut stored.job;
        if job.status != DeliveryStatus::InFlight || job.attempt_number != attempt_number {
            return Err(DbError::Conflict {
                entity: "delivery job",
                id: id.to_string(),
                reason: format!(
                    "expected in_flight at attempt {}, found {} at attempt {}",
                    attempt_number,
                    job.status.as_str(),
                    job.attempt_number
                ),
            });
        }

        match transition {
            JobTransition::Succeeded => job.status = DeliveryStatus::Succeeded,
            JobTransition::Exhausted => job.status = DeliveryStatus::Exhausted,
            JobTransition::Retry { .. } if disabled => job.status = DeliveryStatus::Exhausted,
            JobTransition::Retry {
                next_attempt_number,
                next_attempt_at,
            } => {
                job.status = DeliveryStatus::Pending;
                job.attempt_number = next_attempt_number;
                job.next_attempt_at = next_attempt_at;
            }
        }
        job.claimed_at = None;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn exhaust_pending_jobs(&self, subscription_id: SubscriptionId, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write();
        let mut count = 0;
        for stored in state.jobs.values_mut() {
            if stored.job.subscription_id == subscription_id && stored.job.status == DeliveryStatus::Pending {
                stored.job.status = DeliveryStatus::Exhausted;
                stored.job.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn release_stale_claims(&self, claimed_before: DateTime<Utc>, max_attempts: i32, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write();
        let State { jobs, attempt_keys, .. } = &mut *state;
        let mut count = 0;

        for stored in jobs.values_mut() {
            let job = &mut stored.job;
            let stale = job.status == DeliveryStatus::InFlight && job.claimed_at.is_some_and(|t| t < claimed_before);
            if !stale {
                continue;
            }
            let recorded = attempt_keys.contains(&(job.id, job.attempt_number));
            if recorded && job.attempt_number >= max_attempts {
                job.status = DeliveryStatus::Exhausted;
            } else {
                if recorded {
                    job.attempt_number += 1;
                }
                job.status = DeliveryStatus::Pending;
                job.next_attempt_at = now;
            }
            job.claimed_at = None;
            job.updated_at = now;
            count += 1;
        }

        Ok(count)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<DeliveryJob>> {
        Ok(self.state.read().jobs.get(&id).map(|stored| stored.job.clone()))
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<DeliveryJob>> {
        let state = self.state.read();
        let mut jobs: Vec<&StoredJob> = state.jobs.values().filter(|stored| filter.matches(&stored.job)).collect();
        jobs.sort_by_key(|stored| (stored.job.created_at, stored.seq));
        Ok(jobs
            .into_iter()
            .take(effective_limit(filter.limit) as usize)
            .map(|stored| stored.job.clone())
            .collect())
    }
}

#[async_trait]
impl DeliveryLog for InMemoryStore {
    async fn append_attempt(&self, request: &AttemptRecordCreateDBRequest) -> Result<DeliveryAttemptRecord> {
        let mut state = self.state.write();
        if !state.attempt_keys.insert((request.job_id, request.attempt_number)) {
            return Err(DbError::UniqueViolation {
                constraint: Some("delivery_attempts_job_attempt_unique".to_string()),
                table: Some("delivery_attempts".to_string()),
                message: format!("attempt {} of job {} already recorded", request.attempt_number, request.job_id),
            });
        }

        let record = DeliveryAttemptRecord {
            id: Uuid::new_v4(),
            job_id: request.job_id,
            event_id: request.event_id,
            subscription_id: request.subscription_id,
            attempt_number: request.attempt_number,
            sent_at: request.sent_at,
            http_status: request.http_status,
            error: request.error.clone(),
            outcome: request.outcome,
            latency_ms: request.latency_ms,
        };
        state.attempts.push(record.clone());
        Ok(record)
    }

    async fn query_attempts(&self, filter: &AttemptFilter) -> Result<Vec<DeliveryAttemptRecord>> {
        let state = self.state.read();
        // Appended in order, so reverse iteration is newest-first among equal timestamps.
        let mut records: Vec<DeliveryAttemptRecord> = state.attempts.iter().rev().filter(|r| filter.matches(r)).cloned().collect();
        records.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));
        records.truncate(effective_limit(filter.limit) as usize);
        Ok(records)
    }

    async fn last_failed_attempt(&self, subscription_id: SubscriptionId) -> Result<Option<DeliveryAttemptRecord>> {
        let state = self.state.read();
        Ok(state
            .attempts
            .iter()
            .filter(|r| r.subscription_id == subscription_id && r.outcome != AttemptOutcome::Success)
            .max_by_key(|r| r.sent_at)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::handlers::Store;
    use chrono::TimeDelta;

    async fn store_with_subscription(event_types: &[&str]) -> (InMemoryStore, Subscription) {
        let store = InMemoryStore::new();
        let subscription = store
            .create_subscription(&SubscriptionCreateDBRequest {
                target_url: "https://example.com/hook".to_string(),
                signing_secret: "whsec_c2VjcmV0".to_string(),
                event_types: event_types.iter().map(|s| s.to_string()).collect(),
                description: None,
            })
            .await
            .unwrap();
        (store, subscription)
    }

    fn job_request(event_id: EventId, subscription_id: SubscriptionId, at: DateTime<Utc>) -> DeliveryJobCreateDBRequest {
        DeliveryJobCreateDBRequest {
            event_id,
            subscription_id,
            event_type: "order.completed".to_string(),
            payload: br#"{"id":1}"#.to_vec(),
            next_attempt_at: at,
        }
    }

    fn attempt_request(job: &DeliveryJob, outcome: AttemptOutcome, sent_at: DateTime<Utc>) -> AttemptRecordCreateDBRequest {
        AttemptRecordCreateDBRequest {
            job_id: job.id,
            event_id: job.event_id,
            subscription_id: job.subscription_id,
            attempt_number: job.attempt_number,
            sent_at,
            http_status: Some(503),
            error: None,
            outcome,
            latency_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_create_jobs_is_idempotent_per_pair() {
        let (store, sub) = store_with_subscription(&["order.completed"]).await;
        let event_id = Uuid::new_v4();
        let now = Utc::now();

        let first = store.create_jobs(&[job_request(event_id, sub.id, now)]).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].attempt_number, 1);
        assert_eq!(first[0].status, DeliveryStatus::Pending);

        let second = store.create_jobs(&[job_request(event_id, sub.id, now)]).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(store.list_jobs(&JobFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_respects_due_time_limit_and_order() {
        let (store, sub) = store_with_subscription(&["order.completed"]).await;
        let now = Utc::now();

        let late = store
            .create_jobs(&[job_request(Uuid::new_v4(), sub.id, now + TimeDelta::seconds(60))])
            .await
            .unwrap();
        let a = store.create_jobs(&[job_request(Uuid::new_v4(), sub.id, now)]).await.unwrap();
        let b = store.create_jobs(&[job_request(Uuid::new_v4(), sub.id, now)]).await.unwrap();

        let claimed = store.claim_due_jobs(now, 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job.id, a[0].id);
        assert_eq!(claimed[0].job.status, DeliveryStatus::InFlight);
        assert_eq!(claimed[0].target_url, "https://example.com/hook");

        let claimed = store.claim_due_jobs(now, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job.id, b[0].id);

        // Nothing else is due, and an in-flight job is never claimed twice
        assert!(store.claim_due_jobs(now, 10).await.unwrap().is_empty());

        let claimed = store.claim_due_jobs(now + TimeDelta::seconds(60), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job.id, late[0].id);
    }

    #[tokio::test]
    async fn test_claim_exhausts_jobs_of_disabled_subscription() {
        let (store, sub) = store_with_subscription(&["order.completed"]).await;
        let now = Utc::now();
        let jobs = store.create_jobs(&[job_request(Uuid::new_v4(), sub.id, now)]).await.unwrap();

        store.disable_subscription(sub.id, now).await.unwrap();
        assert!(store.claim_due_jobs(now, 10).await.unwrap().is_empty());

        let job = store.get_job(jobs[0].id).await.unwrap().unwrap();
        assert_eq!(job.status, DeliveryStatus::Exhausted);
    }

    #[tokio::test]
    async fn test_complete_job_is_conditional() {
        let (store, sub) = store_with_subscription(&["order.completed"]).await;
        let now = Utc::now();
        store.create_jobs(&[job_request(Uuid::new_v4(), sub.id, now)]).await.unwrap();
        let claimed = store.claim_due_jobs(now, 1).await.unwrap().remove(0);

        let next_at = now + TimeDelta::seconds(60);
        let job = store
            .complete_job(
                claimed.job.id,
                1,
                JobTransition::Retry {
                    next_attempt_number: 2,
                    next_attempt_at: next_at,
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(job.status, DeliveryStatus::Pending);
        assert_eq!(job.attempt_number, 2);
        assert_eq!(job.next_attempt_at, next_at);

        // Completing again is a conflict: the job is no longer in flight
        let err = store
            .complete_job(claimed.job.id, 1, JobTransition::Succeeded, now)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_retry_after_disable_exhausts() {
        let (store, sub) = store_with_subscription(&["order.completed"]).await;
        let now = Utc::now();
        store.create_jobs(&[job_request(Uuid::new_v4(), sub.id, now)]).await.unwrap();
        let claimed = store.claim_due_jobs(now, 1).await.unwrap().remove(0);

        store.disable_subscription(sub.id, now).await.unwrap();
        let job = store
            .complete_job(
                claimed.job.id,
                1,
                JobTransition::Retry {
                    next_attempt_number: 2,
                    next_attempt_at: now,
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(job.status, DeliveryStatus::Exhausted);
    }

    #[tokio::test]
    async fn test_record_failure_disables_once() {
        let (store, sub) = store_with_subscription(&["order.completed"]).await;
        let now = Utc::now();

        for expected in 1..=2 {
            let update = store.record_failure(sub.id, 3, now).await.unwrap();
            assert_eq!(update.subscription.consecutive_failures, expected);
            assert!(!update.newly_disabled);
        }
        let update = store.record_failure(sub.id, 3, now).await.unwrap();
        assert!(update.newly_disabled);
        assert_eq!(update.subscription.health_state, HealthState::Disabled);
        assert_eq!(update.subscription.disabled_at, Some(now));

        let update = store.record_failure(sub.id, 3, now).await.unwrap();
        assert!(!update.newly_disabled);
        assert_eq!(update.subscription.consecutive_failures, 4);

        // Success resets the counter but keeps it disabled
        let later = now + chrono::TimeDelta::seconds(30);
        let sub_after = store.record_success(sub.id, later).await.unwrap();
        assert_eq!(sub_after.consecutive_failures, 0);
        assert_eq!(sub_after.health_state, HealthState::Disabled);
        assert_eq!(sub_after.updated_at, later);

        let enabled_at = later + chrono::TimeDelta::seconds(30);
        let enabled = store.enable_subscription(sub.id, enabled_at).await.unwrap();
        assert_eq!(enabled.health_state, HealthState::Enabled);
        assert_eq!(enabled.disabled_at, None);
        assert_eq!(enabled.updated_at, enabled_at);
    }

    #[tokio::test]
    async fn test_concurrent_failures_are_not_lost() {
        let (store, sub) = store_with_subscription(&["order.completed"]).await;
        let store: Arc<dyn Store> = Arc::new(store);
        let sub_id = sub.id;
        let now = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.record_failure(sub_id, 10, now).await.unwrap() }));
        }
        let mut newly_disabled = 0;
        for handle in handles {
            if handle.await.unwrap().newly_disabled {
                newly_disabled += 1;
            }
        }

        let sub = store.get_subscription(sub_id).await.unwrap().unwrap();
        assert_eq!(sub.consecutive_failures, 50);
        assert_eq!(newly_disabled, 1);
    }

    #[tokio::test]
    async fn test_exhaust_pending_jobs_leaves_others() {
        let (store, sub) = store_with_subscription(&["order.completed"]).await;
        let now = Utc::now();
        for _ in 0..3 {
            store.create_jobs(&[job_request(Uuid::new_v4(), sub.id, now)]).await.unwrap();
        }
        let in_flight = store.claim_due_jobs(now, 1).await.unwrap().remove(0);

        assert_eq!(store.exhaust_pending_jobs(sub.id, now).await.unwrap(), 2);
        let job = store.get_job(in_flight.job.id).await.unwrap().unwrap();
        assert_eq!(job.status, DeliveryStatus::InFlight);
    }

    #[tokio::test]
    async fn test_release_stale_claims() {
        let (store, sub) = store_with_subscription(&["order.completed"]).await;
        let now = Utc::now();
        store.create_jobs(&[job_request(Uuid::new_v4(), sub.id, now)]).await.unwrap();
        store.create_jobs(&[job_request(Uuid::new_v4(), sub.id, now)]).await.unwrap();
        let claimed = store.claim_due_jobs(now, 2).await.unwrap();

        // The first claim was sent and recorded before the crash, the second was not
        store
            .append_attempt(&attempt_request(&claimed[0].job, AttemptOutcome::RetryableFailure, now))
            .await
            .unwrap();

        let later = now + TimeDelta::minutes(10);
        assert_eq!(store.release_stale_claims(now + TimeDelta::minutes(5), 5, later).await.unwrap(), 2);

        let first = store.get_job(claimed[0].job.id).await.unwrap().unwrap();
        assert_eq!(first.status, DeliveryStatus::Pending);
        assert_eq!(first.attempt_number, 2);
        let second = store.get_job(claimed[1].job.id).await.unwrap().unwrap();
        assert_eq!(second.status, DeliveryStatus::Pending);
        assert_eq!(second.attempt_number, 1);
        assert_eq!(second.next_attempt_at, later);

        // Fresh claims are not released
        store.claim_due_jobs(later, 2).await.unwrap();
        assert_eq!(store.release_stale_claims(later, 5, later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_attempt_log_unique_and_queryable() {
        let (store, sub) = store_with_subscription(&["order.completed"]).await;
        let now = Utc::now();
        let job = store
            .create_jobs(&[job_request(Uuid::new_v4(), sub.id, now)])
            .await
            .unwrap()
            .remove(0);

        store
            .append_attempt(&attempt_request(&job, AttemptOutcome::RetryableFailure, now))
            .await
            .unwrap();
        let dup = store
            .append_attempt(&attempt_request(&job, AttemptOutcome::RetryableFailure, now))
            .await;
        assert!(matches!(dup, Err(DbError::UniqueViolation { .. })));

        let mut second = attempt_request(&job, AttemptOutcome::Success, now + TimeDelta::seconds(60));
        second.attempt_number = 2;
        second.http_status = Some(200);
        store.append_attempt(&second).await.unwrap();

        let all = store
            .query_attempts(&AttemptFilter {
                subscription_id: Some(sub.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.iter().map(|r| r.attempt_number).collect::<Vec<_>>(), vec![2, 1]);

        let ranged = store
            .query_attempts(&AttemptFilter {
                job_id: Some(job.id),
                since: Some(now + TimeDelta::seconds(1)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(ranged.len(), 1);
        assert_eq!(ranged[0].outcome, AttemptOutcome::Success);

        let last_failed = store.last_failed_attempt(sub.id).await.unwrap().unwrap();
        assert_eq!(last_failed.attempt_number, 1);
    }
}
