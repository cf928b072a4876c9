//! Common type definitions shared across the engine.
//!
//! All entity IDs are UUIDs wrapped in type aliases for readability:
//!
//! - [`SubscriptionId`]: a registered endpoint
//! - [`EventId`]: a published domain event (also sent as `X-Webhook-ID`)
//! - [`JobId`]: one (event, subscription) delivery job
//! - [`AttemptId`]: one appended delivery attempt record
//!
//! [`abbrev_uuid`] shortens UUIDs to their first 8 characters for log fields.

use uuid::Uuid;

pub type SubscriptionId = Uuid;
pub type EventId = Uuid;
pub type JobId = Uuid;
pub type AttemptId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}
