//! Operator notifications for endpoint disablement.
//!
//! The coordinator raises a [`DisablementNotice`] exactly once per `enabled → disabled`
//! transition. [`BroadcastNotifier`] logs it, counts it and fans it out to any live
//! subscribers (the SSE stream on the admin API).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::sync::broadcast;
use utoipa::ToSchema;

use crate::types::{SubscriptionId, abbrev_uuid};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct DisablementNotice {
    #[schema(value_type = String, format = "uuid")]
    pub subscription_id: SubscriptionId,
    pub target_url: String,
    pub consecutive_failures: i32,
    pub disabled_at: DateTime<Utc>,
    /// Pending jobs exhausted as part of the disablement.
    pub exhausted_jobs: u64,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn subscription_disabled(&self, notice: DisablementNotice);
}

#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<DisablementNotice>,
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DisablementNotice> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn subscription_disabled(&self, notice: DisablementNotice) {
        counter!("dwhooks_subscriptions_disabled_total").increment(1);
        tracing::warn!(
            subscription_id = %abbrev_uuid(&notice.subscription_id),
            target_url = %notice.target_url,
            consecutive_failures = notice.consecutive_failures,
            exhausted_jobs = notice.exhausted_jobs,
            "Subscription disabled after repeated delivery failures"
        );

        // No receivers is fine: the log line above is the durable signal
        if self.tx.send(notice).is_err() {
            tracing::debug!("No live notification subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_notice_reaches_subscribers() {
        let notifier = BroadcastNotifier::new();
        let mut rx = notifier.subscribe();

        let notice = DisablementNotice {
            subscription_id: Uuid::new_v4(),
            target_url: "https://example.com/hook".to_string(),
            consecutive_failures: 5,
            disabled_at: Utc::now(),
            exhausted_jobs: 2,
        };
        notifier.subscription_disabled(notice.clone()).await;

        assert_eq!(rx.recv().await.unwrap(), notice);
    }

    #[tokio::test]
    async fn test_notify_without_subscribers() {
        let notifier = BroadcastNotifier::new();
        notifier
            .subscription_disabled(DisablementNotice {
                subscription_id: Uuid::new_v4(),
                target_url: "https://example.com/hook".to_string(),
                consecutive_failures: 5,
                disabled_at: Utc::now(),
                exhausted_jobs: 0,
            })
            .await;
    }
}
