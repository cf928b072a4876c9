//! API layer for HTTP request handling and data models.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Request/response data structures
//!
//! # API Structure
//!
//! Everything is nested under `/admin/api/v1`:
//!
//! - **Subscriptions** (`/subscriptions/*`): registration, health and secret rotation
//! - **Events** (`/events`): event ingestion
//! - **Deliveries** (`/jobs`, `/attempts`): job inspection and the attempt audit log
//! - **Notifications** (`/notifications/stream`): disablement notices as server-sent events
//!
//! The OpenAPI document is served at `/admin/api/v1/openapi.json`.

pub mod handlers;
pub mod models;
