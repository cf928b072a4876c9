//! Delivery coordinator: event fan-out, the claim loop and outcome bookkeeping.
//!
//! ```text
//! publish(event)
//!   └─ DB: create one pending job per enabled matching subscription (idempotent)
//!
//! run() loop
//!   ├─ reap finished tasks
//!   ├─ DB: release_stale_claims()        // crashed workers' jobs back to pending
//!   ├─ DB: claim_due_jobs(min(batch, free permits))
//!   └─ for each claimed job, spawn (holding a semaphore permit):
//!        ├─ dispatcher.dispatch()         // one attempt, one attempt record
//!        ├─ DB: complete_job()            // conditional on in_flight at this attempt
//!        └─ DB: record_success() / record_failure()
//!             └─ newly disabled → exhaust_pending_jobs() + notify operator
//! ```
//!
//! No store lock is held across the HTTP call. On shutdown the loop stops claiming and waits
//! for in-flight attempts so every one of them is recorded.

use std::cmp;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use metrics::{counter, gauge};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{CLAIM_TIMEOUT_MARGIN, WebhookConfig};
use crate::db::Store;
use crate::db::errors::DbError;
use crate::db::models::webhooks::{
    AttemptOutcome, ClaimedJob, DeliveryAttemptRecord, DeliveryJobCreateDBRequest, DeliveryStatus, Subscription,
};
use crate::notifications::{DisablementNotice, Notifier};
use crate::types::{SubscriptionId, abbrev_uuid};
use crate::webhooks::dispatcher::Dispatcher;
use crate::webhooks::events::Event;
use crate::webhooks::retry::{RetryDecision, RetrySchedule};

/// Source of the current time. Swapped for a manual clock in tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Tunables for the coordinator, derived from [`WebhookConfig`].
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub schedule: RetrySchedule,
    pub disable_threshold: i32,
    pub max_in_flight: usize,
    pub claim_batch_size: i64,
    pub poll_interval: Duration,
    pub claim_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&WebhookConfig::default())
    }
}

impl From<&WebhookConfig> for CoordinatorSettings {
    fn from(config: &WebhookConfig) -> Self {
        Self {
            schedule: RetrySchedule::new(config.retry_schedule_secs.clone()),
            disable_threshold: config.effective_disable_threshold(),
            max_in_flight: config.max_in_flight,
            claim_batch_size: config.claim_batch_size,
            poll_interval: config.poll_interval,
            claim_timeout: config.claim_timeout,
        }
    }
}

/// Result of publishing one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Enabled subscriptions accepting the event type.
    pub matched_subscriptions: usize,
    /// Jobs created by this call. Zero when the event was already published.
    pub jobs_created: usize,
}

pub struct Coordinator {
    store: Arc<dyn Store>,
    dispatcher: Dispatcher,
    notifier: Arc<dyn Notifier>,
    settings: CoordinatorSettings,
    permits: Arc<Semaphore>,
    clock: Clock,
}

impl Coordinator {
    pub fn new(store: Arc<dyn Store>, dispatcher: Dispatcher, notifier: Arc<dyn Notifier>, settings: CoordinatorSettings) -> Self {
        Self::with_clock(store, dispatcher, notifier, settings, system_clock())
    }

    pub fn with_clock(
        store: Arc<dyn Store>,
        dispatcher: Dispatcher,
        notifier: Arc<dyn Notifier>,
        settings: CoordinatorSettings,
        clock: Clock,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_in_flight));
        Self {
            store,
            dispatcher,
            notifier,
            settings,
            permits,
            clock,
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Create one pending job per enabled subscription that accepts the event type.
    ///
    /// Publishing the same event id again creates nothing new.
    #[tracing::instrument(skip_all, fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn publish(&self, event: &Event) -> Result<PublishOutcome, DbError> {
        let now = self.now();
        let subscriptions = self.store.enabled_subscriptions_for_event(&event.event_type).await?;

        let requests: Vec<_> = subscriptions
            .iter()
            .filter(|s| s.accepts_event(&event.event_type))
            .map(|s| DeliveryJobCreateDBRequest {
                event_id: event.id,
                subscription_id: s.id,
                event_type: event.event_type.clone(),
                payload: event.payload.clone(),
                next_attempt_at: now,
            })
            .collect();

        let created = if requests.is_empty() {
            Vec::new()
        } else {
            self.store.create_jobs(&requests).await?
        };

        counter!("dwhooks_jobs_created_total").increment(created.len() as u64);
        tracing::debug!(
            matched = requests.len(),
            created = created.len(),
            "Published event"
        );

        Ok(PublishOutcome {
            matched_subscriptions: requests.len(),
            jobs_created: created.len(),
        })
    }

    /// Claim and process one batch of due jobs, waiting for every attempt to be applied.
    ///
    /// Returns the number of jobs processed.
    pub async fn run_once(self: &Arc<Self>) -> Result<usize, DbError> {
        let mut tasks = JoinSet::new();
        let spawned = self.spawn_due(&mut tasks).await?;
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Delivery task panicked");
            }
        }
        Ok(spawned)
    }

    /// Run the scheduling loop until `shutdown` is cancelled, then drain in-flight attempts.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(
            max_in_flight = self.settings.max_in_flight,
            claim_batch_size = self.settings.claim_batch_size,
            poll_interval = ?self.settings.poll_interval,
            "Starting delivery coordinator"
        );

        let mut tasks: JoinSet<()> = JoinSet::new();

        while !shutdown.is_cancelled() {
            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Delivery task panicked");
                }
            }

            if let Err(e) = self.release_stale_claims().await {
                tracing::warn!(error = %e, "Failed to release stale claims");
            }

            let claimed = match self.spawn_due(&mut tasks).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to claim due jobs");
                    0
                }
            };

            // A full batch means there may be more due work: go again without sleeping
            if claimed > 0 && claimed as i64 == self.settings.claim_batch_size {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Delivery task panicked");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        tracing::info!(in_flight = tasks.len(), "Delivery coordinator stopping, waiting for in-flight attempts");
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Delivery task panicked");
            }
        }
        tracing::info!("Delivery coordinator stopped");
    }

    /// Return jobs claimed longer than `claim_timeout` ago to `pending`.
    ///
    /// Never releases a claim younger than the dispatcher timeout plus [`CLAIM_TIMEOUT_MARGIN`],
    /// whatever `claim_timeout` says: such an attempt may still be in flight.
    pub async fn release_stale_claims(&self) -> Result<u64, DbError> {
        let now = self.now();
        let min_claim_age = self.dispatcher.timeout().saturating_add(CLAIM_TIMEOUT_MARGIN);
        let claim_timeout = cmp::max(self.settings.claim_timeout, min_claim_age);
        let timeout = TimeDelta::from_std(claim_timeout).unwrap_or_else(|_| TimeDelta::days(365));
        let claimed_before = now.checked_sub_signed(timeout).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let released = self
            .store
            .release_stale_claims(claimed_before, self.settings.schedule.max_attempts(), now)
            .await?;
        if released > 0 {
            tracing::warn!(count = released, "Released stale in-flight claims");
        }
        Ok(released)
    }

    async fn spawn_due(self: &Arc<Self>, tasks: &mut JoinSet<()>) -> Result<usize, DbError> {
        let free = self.permits.available_permits();
        if free == 0 {
            tracing::trace!("No free delivery permits");
            return Ok(0);
        }

        let limit = cmp::min(self.settings.claim_batch_size, free as i64);
        let claimed = self.store.claim_due_jobs(self.now(), limit).await?;
        if claimed.is_empty() {
            return Ok(0);
        }

        counter!("dwhooks_jobs_claimed_total").increment(claimed.len() as u64);
        tracing::debug!(count = claimed.len(), "Claimed due jobs");

        let mut spawned = 0;
        for job in claimed {
            // Only this loop takes permits, and it claimed no more than were free
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                tracing::warn!(job_id = %abbrev_uuid(&job.job.id), "Delivery semaphore closed, leaving job to stale claim recovery");
                break;
            };
            tasks.spawn(self.clone().process(job, permit));
            spawned += 1;
        }
        Ok(spawned)
    }

    async fn process(self: Arc<Self>, claimed: ClaimedJob, _permit: OwnedSemaphorePermit) {
        gauge!("dwhooks_deliveries_in_flight").increment(1.0);

        let result = match self.dispatcher.dispatch(&claimed).await {
            Ok(record) => self.apply(&claimed, &record).await,
            Err(e) => Err(e),
        };

        gauge!("dwhooks_deliveries_in_flight").decrement(1.0);

        if let Err(e) = result {
            tracing::error!(
                job_id = %abbrev_uuid(&claimed.job.id),
                attempt = claimed.job.attempt_number,
                error = %e,
                "Failed to record delivery attempt"
            );
        }
    }

    /// Apply the retry decision to the job, then the health transition to its subscription.
    async fn apply(&self, claimed: &ClaimedJob, record: &DeliveryAttemptRecord) -> Result<(), DbError> {
        let now = self.now();
        let job = &claimed.job;
        let decision = self.settings.schedule.decide(record.outcome, record.attempt_number);

        match self
            .store
            .complete_job(job.id, record.attempt_number, decision.into_transition(now), now)
            .await
        {
            Ok(updated) => {
                if updated.status == DeliveryStatus::Exhausted {
                    let reason = match decision {
                        RetryDecision::Exhausted { reason } => reason.as_str(),
                        _ => "subscription_disabled",
                    };
                    counter!("dwhooks_jobs_exhausted_total", "reason" => reason).increment(1);
                    tracing::info!(
                        job_id = %abbrev_uuid(&job.id),
                        event_id = %job.event_id,
                        attempt = record.attempt_number,
                        reason,
                        "Delivery job exhausted"
                    );
                } else if updated.status == DeliveryStatus::Pending {
                    tracing::debug!(
                        job_id = %abbrev_uuid(&job.id),
                        next_attempt = updated.attempt_number,
                        next_attempt_at = %updated.next_attempt_at,
                        "Delivery job scheduled for retry"
                    );
                }
            }
            // The attempt happened and is recorded; it still counts toward endpoint health
            Err(DbError::Conflict { reason, .. }) => {
                tracing::warn!(job_id = %abbrev_uuid(&job.id), reason = %reason, "Job changed while attempt was in flight");
            }
            Err(e) => return Err(e),
        }

        match record.outcome {
            AttemptOutcome::Success => {
                self.store.record_success(job.subscription_id, now).await?;
            }
            AttemptOutcome::RetryableFailure | AttemptOutcome::PermanentFailure => {
                let update = self
                    .store
                    .record_failure(job.subscription_id, self.settings.disable_threshold, now)
                    .await?;
                if update.newly_disabled {
                    let exhausted_jobs = self.exhaust_pending(&update.subscription, now).await?;
                    self.notifier
                        .subscription_disabled(DisablementNotice {
                            subscription_id: update.subscription.id,
                            target_url: update.subscription.target_url.clone(),
                            consecutive_failures: update.subscription.consecutive_failures,
                            disabled_at: update.subscription.disabled_at.unwrap_or(now),
                            exhausted_jobs,
                        })
                        .await;
                }
            }
        }

        Ok(())
    }

    async fn exhaust_pending(&self, subscription: &Subscription, now: DateTime<Utc>) -> Result<u64, DbError> {
        let exhausted = self.store.exhaust_pending_jobs(subscription.id, now).await?;
        counter!("dwhooks_jobs_exhausted_total", "reason" => "subscription_disabled").increment(exhausted);
        Ok(exhausted)
    }

    /// Operator re-enable. Jobs exhausted by the disablement stay exhausted; new events are
    /// delivered again.
    pub async fn enable_subscription(&self, id: SubscriptionId) -> Result<Subscription, DbError> {
        let subscription = self.store.enable_subscription(id, self.now()).await?;
        tracing::info!(subscription_id = %abbrev_uuid(&id), "Subscription enabled by operator");
        Ok(subscription)
    }

    /// Operator disable. Pending jobs are exhausted; attempts already in flight complete and
    /// are recorded.
    pub async fn disable_subscription(&self, id: SubscriptionId) -> Result<Subscription, DbError> {
        let now = self.now();
        let update = self.store.disable_subscription(id, now).await?;
        if update.newly_disabled {
            let exhausted = self.exhaust_pending(&update.subscription, now).await?;
            tracing::info!(subscription_id = %abbrev_uuid(&id), exhausted, "Subscription disabled by operator");
        }
        Ok(update.subscription)
    }
}
