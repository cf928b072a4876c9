//! Shared constructors for handler and application tests.

use axum_test::TestServer;

use crate::config::{Config, DatabaseConfig};
use crate::{AppState, Application};

/// In-memory configuration with the delivery loop turned off, so tests drive delivery
/// explicitly.
pub fn create_test_config() -> Config {
    let mut config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        database: DatabaseConfig::Memory,
        enable_metrics: false,
        ..Default::default()
    };
    config.webhooks.enabled = false;
    config
}

/// Build a test server over a fresh in-memory store, returning the shared state for direct
/// store and coordinator access.
pub async fn create_test_app() -> (TestServer, AppState) {
    let app = Application::new(create_test_config())
        .await
        .expect("Failed to create application");
    let state = app.state().clone();
    let (server, _bg_services) = app.into_test_server();
    (server, state)
}
