use utoipa::OpenApi;

use crate::api;
use crate::db::models::webhooks::{AttemptOutcome, DeliveryStatus, HealthState};
use crate::notifications::DisablementNotice;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::webhooks::create_subscription,
        api::handlers::webhooks::list_subscriptions,
        api::handlers::webhooks::get_subscription,
        api::handlers::webhooks::enable_subscription,
        api::handlers::webhooks::disable_subscription,
        api::handlers::webhooks::rotate_secret,
        api::handlers::webhooks::publish_event,
        api::handlers::webhooks::list_jobs,
        api::handlers::webhooks::list_attempts,
        api::handlers::webhooks::notification_stream,
    ),
    components(
        schemas(
            api::models::webhooks::SubscriptionCreate,
            api::models::webhooks::SubscriptionResponse,
            api::models::webhooks::SubscriptionWithSecretResponse,
            api::models::webhooks::SubscriptionDetailResponse,
            api::models::webhooks::EventCreate,
            api::models::webhooks::EventAcceptedResponse,
            api::models::webhooks::JobResponse,
            api::models::webhooks::AttemptResponse,
            api::models::webhooks::ListJobsQuery,
            api::models::webhooks::ListAttemptsQuery,
            HealthState,
            DeliveryStatus,
            AttemptOutcome,
            DisablementNotice,
        )
    ),
    tags(
        (name = "subscriptions", description = "Register endpoints and manage their health.

Every delivery is signed with the subscription's secret:
`X-Webhook-Signature: sha256=<hex HMAC-SHA256 of \"{timestamp}.{body}\">`, where the timestamp is
the `X-Webhook-Timestamp` header in unix seconds. Secrets are generated by the server and shown
only when created or rotated."),
        (name = "events", description = "Publish events for delivery to matching subscriptions."),
        (name = "deliveries", description = "Inspect delivery jobs and the append-only attempt log."),
        (name = "notifications", description = "Operator notices, e.g. subscriptions disabled after repeated failures."),
    ),
    info(
        title = "dwhooks admin API",
        version = "1.0.0",
        description = "Outbound webhook delivery: registration, ingestion and delivery audit.

The admin API has no authentication of its own and is expected to run behind an authenticating proxy.

Errors are returned as `{\"message\": \"...\"}` with an appropriate status code."
    )
)]
pub struct AdminApiDoc;
