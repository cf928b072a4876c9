//! HTTP handlers for subscription registration, event ingestion and the delivery audit surface.

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        Json,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
};
use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tracing::instrument;
use url::Url;
use uuid::Uuid;

use crate::{
    AppState,
    api::models::webhooks::{
        AttemptResponse, EventAcceptedResponse, EventCreate, JobResponse, ListAttemptsQuery, ListJobsQuery, SubscriptionCreate,
        SubscriptionDetailResponse, SubscriptionResponse, SubscriptionWithSecretResponse,
    },
    db::errors::DbError,
    db::models::webhooks::SubscriptionCreateDBRequest,
    errors::{Error, Result},
    types::SubscriptionId,
    webhooks::{
        events::{Event, normalize_event_types, validate_event_type},
        signing,
    },
};

/// Maximum length of a subscription description.
const MAX_DESCRIPTION_LEN: usize = 512;

/// Check that a target URL is absolute, has a host and uses HTTPS (or HTTP when insecure URLs are
/// allowed). Returns the URL with surrounding whitespace removed.
pub fn validate_target_url(raw: &str, allow_insecure: bool) -> Result<String> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed).map_err(|e| Error::BadRequest {
        message: format!("Invalid webhook URL: {e}"),
    })?;

    match url.scheme() {
        "https" => {}
        "http" if allow_insecure => {}
        _ => {
            return Err(Error::BadRequest {
                message: "Webhook URL must use HTTPS".to_string(),
            });
        }
    }

    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::BadRequest {
            message: "Webhook URL must include a host".to_string(),
        });
    }

    Ok(trimmed.to_string())
}

fn not_found(id: SubscriptionId) -> impl FnOnce(Error) -> Error {
    move |e| match e {
        Error::Database(DbError::NotFound) => Error::NotFound {
            resource: "Subscription".to_string(),
            id: id.to_string(),
        },
        other => other,
    }
}

/// Register a subscription.
#[utoipa::path(
    post,
    path = "/subscriptions",
    tag = "subscriptions",
    summary = "Register subscription",
    description = "Register an endpoint for one or more event types. The signing secret is generated by the server and returned only in this response.",
    request_body = SubscriptionCreate,
    responses(
        (status = 201, description = "Subscription created", body = SubscriptionWithSecretResponse),
        (status = 400, description = "Invalid URL, event types or a caller-supplied secret"),
        (status = 500, description = "Internal server error"),
    )
)]
#[instrument(skip_all)]
pub async fn create_subscription(
    State(state): State<AppState>,
    Json(request): Json<SubscriptionCreate>,
) -> Result<(StatusCode, Json<SubscriptionWithSecretResponse>)> {
    if request.secret.is_some() {
        return Err(Error::BadRequest {
            message: "Signing secrets are generated by the server and cannot be supplied".to_string(),
        });
    }

    let target_url = validate_target_url(&request.url, state.config.webhooks.allow_insecure_urls)?;
    let event_types = normalize_event_types(request.events).map_err(|message| Error::BadRequest { message })?;

    let description = request.description.map(|d| d.trim().to_string()).filter(|d| !d.is_empty());
    if description.as_ref().is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
        return Err(Error::BadRequest {
            message: format!("Description exceeds {MAX_DESCRIPTION_LEN} characters"),
        });
    }

    let subscription = state
        .store
        .create_subscription(&SubscriptionCreateDBRequest {
            target_url,
            signing_secret: signing::generate_secret(),
            event_types,
            description,
        })
        .await?;

    tracing::info!(
        subscription_id = %subscription.id,
        target_url = %subscription.target_url,
        event_types = ?subscription.event_types,
        "Registered subscription"
    );

    Ok((StatusCode::CREATED, Json(subscription.into())))
}

/// List subscriptions.
#[utoipa::path(
    get,
    path = "/subscriptions",
    tag = "subscriptions",
    summary = "List subscriptions",
    description = "List every subscription with its current health state and failure counter.",
    responses(
        (status = 200, description = "Subscriptions, oldest first", body = [SubscriptionResponse]),
        (status = 500, description = "Internal server error"),
    )
)]
#[instrument(skip_all)]
pub async fn list_subscriptions(State(state): State<AppState>) -> Result<Json<Vec<SubscriptionResponse>>> {
    let subscriptions = state.store.list_subscriptions().await?;
    Ok(Json(subscriptions.into_iter().map(Into::into).collect()))
}

/// Get a subscription.
#[utoipa::path(
    get,
    path = "/subscriptions/{id}",
    tag = "subscriptions",
    summary = "Get subscription",
    description = "Get one subscription, including its most recent failed attempt.",
    params(
        ("id" = uuid::Uuid, Path, description = "Subscription ID"),
    ),
    responses(
        (status = 200, description = "Subscription details", body = SubscriptionDetailResponse),
        (status = 404, description = "Subscription not found"),
        (status = 500, description = "Internal server error"),
    )
)]
#[instrument(skip_all)]
pub async fn get_subscription(State(state): State<AppState>, Path(id): Path<SubscriptionId>) -> Result<Json<SubscriptionDetailResponse>> {
    let subscription = state.store.get_subscription(id).await?.ok_or_else(|| Error::NotFound {
        resource: "Subscription".to_string(),
        id: id.to_string(),
    })?;
    let last_failed_attempt = state.store.last_failed_attempt(id).await?;

    Ok(Json(SubscriptionDetailResponse {
        subscription: subscription.into(),
        last_failed_attempt: last_failed_attempt.map(Into::into),
    }))
}

/// Re-enable a subscription.
#[utoipa::path(
    post,
    path = "/subscriptions/{id}/enable",
    tag = "subscriptions",
    summary = "Enable subscription",
    description = "Re-enable a subscription and reset its failure counter. Jobs exhausted while it was disabled are not revived.",
    params(
        ("id" = uuid::Uuid, Path, description = "Subscription ID"),
    ),
    responses(
        (status = 200, description = "Subscription enabled", body = SubscriptionResponse),
        (status = 404, description = "Subscription not found"),
        (status = 500, description = "Internal server error"),
    )
)]
#[instrument(skip_all)]
pub async fn enable_subscription(State(state): State<AppState>, Path(id): Path<SubscriptionId>) -> Result<Json<SubscriptionResponse>> {
    let subscription = state
        .coordinator
        .enable_subscription(id)
        .await
        .map_err(Error::from)
        .map_err(not_found(id))?;
    Ok(Json(subscription.into()))
}

/// Disable a subscription.
#[utoipa::path(
    post,
    path = "/subscriptions/{id}/disable",
    tag = "subscriptions",
    summary = "Disable subscription",
    description = "Disable a subscription. Its pending jobs are exhausted; attempts already in flight complete and are recorded.",
    params(
        ("id" = uuid::Uuid, Path, description = "Subscription ID"),
    ),
    responses(
        (status = 200, description = "Subscription disabled", body = SubscriptionResponse),
        (status = 404, description = "Subscription not found"),
        (status = 500, description = "Internal server error"),
    )
)]
#[instrument(skip_all)]
pub async fn disable_subscription(State(state): State<AppState>, Path(id): Path<SubscriptionId>) -> Result<Json<SubscriptionResponse>> {
    let subscription = state
        .coordinator
        .disable_subscription(id)
        .await
        .map_err(Error::from)
        .map_err(not_found(id))?;
    Ok(Json(subscription.into()))
}

/// Rotate a subscription's signing secret.
#[utoipa::path(
    post,
    path = "/subscriptions/{id}/rotate-secret",
    tag = "subscriptions",
    summary = "Rotate signing secret",
    description = "Generate a new signing secret. The old secret stops being used for attempts sent after this call. The new secret is only shown once.",
    params(
        ("id" = uuid::Uuid, Path, description = "Subscription ID"),
    ),
    responses(
        (status = 200, description = "Secret rotated", body = SubscriptionWithSecretResponse),
        (status = 404, description = "Subscription not found"),
        (status = 500, description = "Internal server error"),
    )
)]
#[instrument(skip_all)]
pub async fn rotate_secret(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
) -> Result<Json<SubscriptionWithSecretResponse>> {
    let subscription = state
        .store
        .rotate_secret(id, signing::generate_secret())
        .await
        .map_err(Error::from)
        .map_err(not_found(id))?;

    tracing::info!(subscription_id = %id, "Rotated signing secret");
    Ok(Json(subscription.into()))
}

/// Publish an event.
#[utoipa::path(
    post,
    path = "/events",
    tag = "events",
    summary = "Publish event",
    description = "Accept an event for delivery and create one job per enabled subscription accepting its type. Publishing an event id again creates no duplicate jobs.",
    request_body = EventCreate,
    responses(
        (status = 202, description = "Event accepted", body = EventAcceptedResponse),
        (status = 400, description = "Invalid event type"),
        (status = 500, description = "Internal server error"),
    )
)]
#[instrument(skip_all)]
pub async fn publish_event(
    State(state): State<AppState>,
    Json(request): Json<EventCreate>,
) -> Result<(StatusCode, Json<EventAcceptedResponse>)> {
    validate_event_type(&request.event_type).map_err(|message| Error::BadRequest { message })?;

    let event = Event::new(
        request.id.unwrap_or_else(Uuid::new_v4),
        request.event_type,
        request.payload.get().as_bytes().to_vec(),
        request.occurred_at.unwrap_or_else(Utc::now),
    );

    let outcome = state.coordinator.publish(&event).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(EventAcceptedResponse {
            event_id: event.id,
            matched_subscriptions: outcome.matched_subscriptions,
            jobs_created: outcome.jobs_created,
        }),
    ))
}

/// List delivery jobs.
#[utoipa::path(
    get,
    path = "/jobs",
    tag = "deliveries",
    summary = "List delivery jobs",
    description = "List delivery jobs, oldest first, optionally filtered by event, subscription or status.",
    params(ListJobsQuery),
    responses(
        (status = 200, description = "Delivery jobs", body = [JobResponse]),
        (status = 500, description = "Internal server error"),
    )
)]
#[instrument(skip_all)]
pub async fn list_jobs(State(state): State<AppState>, Query(query): Query<ListJobsQuery>) -> Result<Json<Vec<JobResponse>>> {
    let jobs = state.store.list_jobs(&query.into()).await?;
    Ok(Json(jobs.into_iter().map(Into::into).collect()))
}

/// Query the attempt log.
#[utoipa::path(
    get,
    path = "/attempts",
    tag = "deliveries",
    summary = "Query delivery attempts",
    description = "Query the append-only attempt log, newest first.",
    params(ListAttemptsQuery),
    responses(
        (status = 200, description = "Attempt records", body = [AttemptResponse]),
        (status = 400, description = "Invalid query"),
        (status = 500, description = "Internal server error"),
    )
)]
#[instrument(skip_all)]
pub async fn list_attempts(State(state): State<AppState>, Query(query): Query<ListAttemptsQuery>) -> Result<Json<Vec<AttemptResponse>>> {
    if matches!((query.since, query.until), (Some(since), Some(until)) if since > until) {
        return Err(Error::BadRequest {
            message: "`since` must not be after `until`".to_string(),
        });
    }

    let records = state.store.query_attempts(&query.into()).await?;
    Ok(Json(records.into_iter().map(Into::into).collect()))
}

/// Stream subscription disablement notices.
#[utoipa::path(
    get,
    path = "/notifications/stream",
    tag = "notifications",
    summary = "Stream disablement notices",
    description = "Server-sent events, one JSON `DisablementNotice` per subscription disabled by the health state machine.",
    responses(
        (status = 200, description = "Event stream", content_type = "text/event-stream"),
    )
)]
pub async fn notification_stream(State(state): State<AppState>) -> Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>> {
    let stream = BroadcastStream::new(state.notifier.subscribe()).filter_map(|notice| async move {
        match notice {
            Ok(notice) => Some(Ok(SseEvent::default()
                .event("subscription_disabled")
                .data(serde_json::to_string(&notice).unwrap_or_default()))),
            Err(e) => {
                tracing::warn!("Notification stream lagged: {}", e);
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
