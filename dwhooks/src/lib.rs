//! # dwhooks: Outbound Webhook Delivery Engine
//!
//! `dwhooks` delivers domain events to HTTP endpoints registered by third parties. Every
//! delivery is signed with the endpoint's secret, retried on a fixed schedule, recorded in an
//! append-only audit log, and stops once an endpoint has failed too many times in a row.
//!
//! ## Architecture
//!
//! The application is built on [Axum](https://github.com/tokio-rs/axum) for the admin API and
//! a background [`Coordinator`](webhooks::Coordinator) for delivery. State lives behind the
//! [`Store`](db::Store) traits, either in memory (development, tests) or in PostgreSQL.
//!
//! ```text
//!  POST /admin/api/v1/events
//!            │
//!            ↓
//!  Coordinator::publish ──→ one pending job per enabled matching subscription
//!
//!  Coordinator::run (background)
//!    claim due jobs ──→ Dispatcher (sign + POST + classify + record)
//!                   ──→ RetrySchedule (succeeded / retry at +delay / exhausted)
//!                   ──→ health state machine (reset / count / disable + notify)
//! ```
//!
//! ## Guarantees
//!
//! - At most one attempt per job is in flight at any time, across every worker.
//! - Every attempt that was sent is recorded exactly once in the attempt log.
//! - Publishing the same event id twice never creates duplicate jobs.
//! - A disabled subscription receives no further attempts until an operator re-enables it.
//!
//! Delivery is at-least-once: receivers must deduplicate on the `X-Webhook-ID` header.
//!
//! ## Getting Started
//!
//! ```bash
//! dwhooks -f config.yaml
//! ```
//!
//! See [`config`] for the configuration file and environment overrides.

pub mod api;
pub mod config;
pub mod db;
pub mod errors;
pub mod notifications;
mod openapi;
pub mod telemetry;
#[cfg(test)]
mod test_utils;
pub mod types;
pub mod webhooks;

use std::sync::Arc;

use axum::{
    Json, Router,
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
pub use config::Config;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info, warn};
use utoipa::OpenApi;

use crate::config::DatabaseConfig;
use crate::db::{InMemoryStore, PostgresStore, Store};
use crate::notifications::BroadcastNotifier;
use crate::openapi::AdminApiDoc;
use crate::webhooks::{Coordinator, CoordinatorSettings, Dispatcher};

pub use types::{AttemptId, EventId, JobId, SubscriptionId};

/// Application state shared across all request handlers.
///
/// # Example
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .store(store)
///     .coordinator(coordinator)
///     .notifier(notifier)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub coordinator: Arc<Coordinator>,
    pub notifier: Arc<BroadcastNotifier>,
}

/// Get the dwhooks database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Open the configured store, applying migrations for Postgres when enabled.
///
/// Returns the pool alongside the store so it can be closed on shutdown.
async fn setup_store(config: &Config) -> anyhow::Result<(Arc<dyn Store>, Option<PgPool>)> {
    match &config.database {
        DatabaseConfig::Memory => {
            warn!("Using the in-memory store: subscriptions, jobs and the attempt log are lost on restart");
            Ok((Arc::new(InMemoryStore::new()), None))
        }
        DatabaseConfig::Postgres {
            url,
            max_connections,
            run_migrations,
        } => {
            let store = PostgresStore::connect(url, *max_connections).await?;
            if *run_migrations {
                info!("Running database migrations...");
                store.migrate().await?;
            }
            let pool = store.pool().clone();
            Ok((Arc::new(store), Some(pool)))
        }
    }
}

/// Build the coordinator and its dispatcher over `store`.
pub fn build_coordinator(config: &Config, store: Arc<dyn Store>, notifier: Arc<BroadcastNotifier>) -> anyhow::Result<Arc<Coordinator>> {
    let settings = CoordinatorSettings::from(&config.webhooks);
    let schedule_len = settings.schedule.max_attempts();
    if settings.disable_threshold != schedule_len {
        warn!(
            disable_threshold = settings.disable_threshold,
            max_attempts = schedule_len,
            "webhooks.disable_threshold differs from the retry schedule length"
        );
    }

    let dispatcher = Dispatcher::new(store.clone(), config.webhooks.timeout)?;
    Ok(Arc::new(Coordinator::new(store, dispatcher, notifier, settings)))
}

/// Build the application router.
///
/// - `/healthz`: liveness
/// - `/admin/api/v1/*`: admin API, OpenAPI document at `/admin/api/v1/openapi.json`
/// - `/internal/metrics`: Prometheus exposition, when `enable_metrics` is set
pub fn build_router(state: &AppState) -> Router {
    use api::handlers::webhooks;

    let api_routes = Router::new()
        .route(
            "/subscriptions",
            post(webhooks::create_subscription).get(webhooks::list_subscriptions),
        )
        .route("/subscriptions/{id}", get(webhooks::get_subscription))
        .route("/subscriptions/{id}/enable", post(webhooks::enable_subscription))
        .route("/subscriptions/{id}/disable", post(webhooks::disable_subscription))
        .route("/subscriptions/{id}/rotate-secret", post(webhooks::rotate_secret))
        .route("/events", post(webhooks::publish_event))
        .route("/jobs", get(webhooks::list_jobs))
        .route("/attempts", get(webhooks::list_attempts))
        .route("/notifications/stream", get(webhooks::notification_stream))
        .route("/openapi.json", get(|| async { Json(AdminApiDoc::openapi()) }))
        .with_state(state.clone());

    let mut router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .nest("/admin/api/v1", api_routes);

    // Add Prometheus metrics if enabled
    if state.config.enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        router = router
            .route("/internal/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

/// Background tasks running alongside the HTTP server.
///
/// When dropped, the `drop_guard` cancels the shutdown token, stopping the delivery loop.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<DropGuard>,
}

impl BackgroundServices {
    /// Signal every task to stop and wait for them. The delivery loop returns once its in-flight
    /// attempts are recorded.
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();

        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

fn setup_background_services(config: &Config, coordinator: Arc<Coordinator>, shutdown_token: CancellationToken) -> BackgroundServices {
    let drop_guard = shutdown_token.clone().drop_guard();
    let mut background_tasks = Vec::new();

    if config.webhooks.enabled {
        let loop_shutdown = shutdown_token.clone();
        background_tasks.push(tokio::spawn(async move {
            coordinator.run(loop_shutdown).await;
        }));
    } else {
        info!("Webhook delivery is disabled; events are accepted and queued but not sent");
    }

    BackgroundServices {
        background_tasks,
        shutdown_token,
        drop_guard: Some(drop_guard),
    }
}

/// Main application struct.
///
/// # Lifecycle
///
/// 1. **Create**: [`Application::new`] opens the store, runs migrations and starts the
///    delivery loop
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and starts handling requests
/// 3. **Shutdown**: when the shutdown future resolves, the server stops accepting requests,
///    the delivery loop drains and the pool is closed
pub struct Application {
    router: Router,
    app_state: AppState,
    config: Config,
    pool: Option<PgPool>,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting dwhooks with configuration: {:#?}", config);

        let (store, pool) = setup_store(&config).await?;
        let notifier = Arc::new(BroadcastNotifier::new());
        let coordinator = build_coordinator(&config, store.clone(), notifier.clone())?;

        let shutdown_token = CancellationToken::new();
        let bg_services = setup_background_services(&config, coordinator.clone(), shutdown_token);

        let app_state = AppState::builder()
            .config(config.clone())
            .store(store)
            .coordinator(coordinator)
            .notifier(notifier)
            .build();
        let router = build_router(&app_state);

        Ok(Self {
            router,
            app_state,
            config,
            pool,
            bg_services,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.app_state
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router.into_make_service()).expect("Failed to create test server");
        (server, self.bg_services)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "dwhooks listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Waiting for in-flight deliveries to finish...");
        self.bg_services.shutdown().await;

        if let Some(pool) = self.pool {
            info!("Closing database connections...");
            pool.close().await;
        }

        Ok(())
    }
}
