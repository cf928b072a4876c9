//! One delivery attempt: sign, POST, classify, record.
//!
//! ```text
//! dispatch(claimed job)
//!   ├─ CPU: sign payload with the subscription secret (HMAC-SHA256)
//!   ├─ HTTP: single POST with a bounded timeout, redirects not followed
//!   ├─ classify:  2xx                          → success
//!   │             transport error, 5xx, 429    → retryable_failure
//!   │             anything else                → permanent_failure
//!   └─ DB: append one DeliveryAttemptRecord
//! ```
//!
//! Delivery problems never surface as errors: they are recorded as attempt outcomes. Only a
//! failure to append the record is returned to the caller. The dispatcher never retries;
//! scheduling the next attempt is the coordinator's job.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::counter;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;

use crate::db::Store;
use crate::db::errors::DbError;
use crate::db::models::webhooks::{AttemptOutcome, AttemptRecordCreateDBRequest, ClaimedJob, DeliveryAttemptRecord};
use crate::types::abbrev_uuid;
use crate::webhooks::signing;

pub const HEADER_WEBHOOK_ID: &str = "X-Webhook-ID";
pub const HEADER_WEBHOOK_TIMESTAMP: &str = "X-Webhook-Timestamp";
pub const HEADER_WEBHOOK_SIGNATURE: &str = "X-Webhook-Signature";

/// Classify an HTTP response status.
///
/// Redirects are not followed, so a 3xx counts as a misconfigured endpoint just like a 4xx.
pub fn classify_status(status: StatusCode) -> AttemptOutcome {
    if status.is_success() {
        AttemptOutcome::Success
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        AttemptOutcome::RetryableFailure
    } else {
        AttemptOutcome::PermanentFailure
    }
}

/// What came back from the wire, before it is turned into a record.
#[derive(Debug)]
struct SendResult {
    http_status: Option<i32>,
    error: Option<String>,
    outcome: AttemptOutcome,
}

#[derive(Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    store: Arc<dyn Store>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("dwhooks/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, store, timeout })
    }

    /// Upper bound on the HTTP part of one attempt.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Perform one attempt of a claimed job and append its record.
    pub async fn dispatch(&self, claimed: &ClaimedJob) -> Result<DeliveryAttemptRecord, DbError> {
        let job = &claimed.job;
        let sent_at = Utc::now();
        let started = Instant::now();

        tracing::debug!(
            job_id = %abbrev_uuid(&job.id),
            event_id = %job.event_id,
            subscription_id = %abbrev_uuid(&job.subscription_id),
            attempt = job.attempt_number,
            url = %claimed.target_url,
            "Sending webhook"
        );

        let result = match signing::sign_with_secret(&claimed.signing_secret, sent_at.timestamp(), &job.payload) {
            Some(signature) => self.send(claimed, sent_at.timestamp(), signature).await,
            None => {
                tracing::warn!(subscription_id = %abbrev_uuid(&job.subscription_id), "Subscription has an unusable signing secret");
                SendResult {
                    http_status: None,
                    error: Some("invalid signing secret".to_string()),
                    outcome: AttemptOutcome::PermanentFailure,
                }
            }
        };

        let latency_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        counter!("dwhooks_delivery_attempts_total", "outcome" => result.outcome.as_str()).increment(1);

        match result.outcome {
            AttemptOutcome::Success => tracing::debug!(
                job_id = %abbrev_uuid(&job.id),
                attempt = job.attempt_number,
                status = ?result.http_status,
                latency_ms,
                "Webhook delivered"
            ),
            _ => tracing::info!(
                job_id = %abbrev_uuid(&job.id),
                subscription_id = %abbrev_uuid(&job.subscription_id),
                attempt = job.attempt_number,
                status = ?result.http_status,
                error = ?result.error,
                outcome = result.outcome.as_str(),
                "Webhook delivery failed"
            ),
        }

        self.store
            .append_attempt(&AttemptRecordCreateDBRequest {
                job_id: job.id,
                event_id: job.event_id,
                subscription_id: job.subscription_id,
                attempt_number: job.attempt_number,
                sent_at,
                http_status: result.http_status,
                error: result.error,
                outcome: result.outcome,
                latency_ms,
            })
            .await
    }

    async fn send(&self, claimed: &ClaimedJob, timestamp: i64, signature: String) -> SendResult {
        let response = self
            .client
            .post(&claimed.target_url)
            .header(CONTENT_TYPE, "application/json")
            .header(HEADER_WEBHOOK_ID, claimed.job.event_id.to_string())
            .header(HEADER_WEBHOOK_TIMESTAMP, timestamp.to_string())
            .header(HEADER_WEBHOOK_SIGNATURE, signature)
            .body(claimed.job.payload.clone())
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                let outcome = classify_status(status);
                SendResult {
                    http_status: Some(i32::from(status.as_u16())),
                    error: (outcome != AttemptOutcome::Success).then(|| format!("HTTP {}", status.as_u16())),
                    outcome,
                }
            }
            Err(e) => SendResult {
                http_status: None,
                error: Some(if e.is_timeout() { "request timed out".to_string() } else { e.to_string() }),
                outcome: AttemptOutcome::RetryableFailure,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryStore;
    use crate::db::models::webhooks::{DeliveryJobCreateDBRequest, SubscriptionCreateDBRequest};
    use crate::db::{DeliveryJobs, DeliveryLog, Subscriptions};
    use uuid::Uuid;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn claimed_job(store: &InMemoryStore, url: &str, secret: &str) -> ClaimedJob {
        let sub = store
            .create_subscription(&SubscriptionCreateDBRequest {
                target_url: url.to_string(),
                signing_secret: secret.to_string(),
                event_types: vec!["order.completed".to_string()],
                description: None,
            })
            .await
            .unwrap();
        let now = Utc::now();
        store
            .create_jobs(&[DeliveryJobCreateDBRequest {
                event_id: Uuid::new_v4(),
                subscription_id: sub.id,
                event_type: "order.completed".to_string(),
                payload: br#"{"order_id":"ord_1","total":1250}"#.to_vec(),
                next_attempt_at: now,
            }])
            .await
            .unwrap();
        store.claim_due_jobs(now, 1).await.unwrap().remove(0)
    }

    fn dispatcher(store: &InMemoryStore, timeout: Duration) -> Dispatcher {
        Dispatcher::new(Arc::new(store.clone()), timeout).unwrap()
    }

    #[tokio::test]
    async fn test_successful_delivery_is_signed_and_recorded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", "application/json"))
            .and(header_exists("x-webhook-id"))
            .and(header_exists("x-webhook-timestamp"))
            .and(header_exists("x-webhook-signature"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let store = InMemoryStore::new();
        let secret = signing::generate_secret();
        let claimed = claimed_job(&store, &format!("{}/hook", server.uri()), &secret).await;

        let record = dispatcher(&store, Duration::from_secs(5)).dispatch(&claimed).await.unwrap();
        assert_eq!(record.outcome, AttemptOutcome::Success);
        assert_eq!(record.http_status, Some(204));
        assert_eq!(record.attempt_number, 1);
        assert!(record.error.is_none());

        let requests = server.received_requests().await.unwrap();
        let request = &requests[0];
        assert_eq!(request.body, claimed.job.payload);

        let header_str = |name: &str| request.headers.get(name).unwrap().to_str().unwrap().to_string();
        assert_eq!(header_str("x-webhook-id"), claimed.job.event_id.to_string());
        let now = Utc::now().timestamp();
        assert!(signing::verify_headers(
            &secret,
            &header_str("x-webhook-timestamp"),
            &request.body,
            &header_str("x-webhook-signature"),
            now
        ));

        let logged = store.query_attempts(&Default::default()).await.unwrap();
        assert_eq!(logged.len(), 1);
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let store = InMemoryStore::new();
        let claimed = claimed_job(&store, &server.uri(), &signing::generate_secret()).await;

        let record = dispatcher(&store, Duration::from_secs(5)).dispatch(&claimed).await.unwrap();
        assert_eq!(record.outcome, AttemptOutcome::RetryableFailure);
        assert_eq!(record.http_status, Some(503));
        assert_eq!(record.error.as_deref(), Some("HTTP 503"));
    }

    #[tokio::test]
    async fn test_too_many_requests_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let store = InMemoryStore::new();
        let claimed = claimed_job(&store, &server.uri(), &signing::generate_secret()).await;

        let record = dispatcher(&store, Duration::from_secs(5)).dispatch(&claimed).await.unwrap();
        assert_eq!(record.outcome, AttemptOutcome::RetryableFailure);
    }

    #[tokio::test]
    async fn test_client_error_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let store = InMemoryStore::new();
        let claimed = claimed_job(&store, &server.uri(), &signing::generate_secret()).await;

        let record = dispatcher(&store, Duration::from_secs(5)).dispatch(&claimed).await.unwrap();
        assert_eq!(record.outcome, AttemptOutcome::PermanentFailure);
        assert_eq!(record.http_status, Some(404));
    }

    #[tokio::test]
    async fn test_redirect_is_not_followed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(301).insert_header("location", "https://example.com/elsewhere"))
            .expect(1)
            .mount(&server)
            .await;

        let store = InMemoryStore::new();
        let claimed = claimed_job(&store, &server.uri(), &signing::generate_secret()).await;

        let record = dispatcher(&store, Duration::from_secs(5)).dispatch(&claimed).await.unwrap();
        assert_eq!(record.outcome, AttemptOutcome::PermanentFailure);
        assert_eq!(record.http_status, Some(301));
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let store = InMemoryStore::new();
        let claimed = claimed_job(&store, &server.uri(), &signing::generate_secret()).await;

        let record = dispatcher(&store, Duration::from_millis(100)).dispatch(&claimed).await.unwrap();
        assert_eq!(record.outcome, AttemptOutcome::RetryableFailure);
        assert_eq!(record.http_status, None);
        assert_eq!(record.error.as_deref(), Some("request timed out"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        let store = InMemoryStore::new();
        // Nothing listens on port 1
        let claimed = claimed_job(&store, "http://127.0.0.1:1/hook", &signing::generate_secret()).await;

        let record = dispatcher(&store, Duration::from_secs(5)).dispatch(&claimed).await.unwrap();
        assert_eq!(record.outcome, AttemptOutcome::RetryableFailure);
        assert!(record.http_status.is_none());
        assert!(record.error.is_some());
    }

    #[tokio::test]
    async fn test_unusable_secret_is_permanent_and_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let store = InMemoryStore::new();
        let claimed = claimed_job(&store, &server.uri(), "not-a-secret").await;

        let record = dispatcher(&store, Duration::from_secs(5)).dispatch(&claimed).await.unwrap();
        assert_eq!(record.outcome, AttemptOutcome::PermanentFailure);
        assert_eq!(record.error.as_deref(), Some("invalid signing secret"));
    }

    #[tokio::test]
    async fn test_duplicate_attempt_record_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = InMemoryStore::new();
        let claimed = claimed_job(&store, &server.uri(), &signing::generate_secret()).await;
        let dispatcher = dispatcher(&store, Duration::from_secs(5));

        dispatcher.dispatch(&claimed).await.unwrap();
        let err = dispatcher.dispatch(&claimed).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::OK), AttemptOutcome::Success);
        assert_eq!(classify_status(StatusCode::ACCEPTED), AttemptOutcome::Success);
        assert_eq!(classify_status(StatusCode::INTERNAL_SERVER_ERROR), AttemptOutcome::RetryableFailure);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), AttemptOutcome::RetryableFailure);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), AttemptOutcome::RetryableFailure);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), AttemptOutcome::PermanentFailure);
        assert_eq!(classify_status(StatusCode::GONE), AttemptOutcome::PermanentFailure);
        assert_eq!(classify_status(StatusCode::FOUND), AttemptOutcome::PermanentFailure);
    }
}
