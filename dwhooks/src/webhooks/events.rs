//! Domain events accepted for delivery.

use chrono::{DateTime, Utc};

use crate::types::EventId;

/// Maximum length of an event type string.
pub const MAX_EVENT_TYPE_LEN: usize = 128;

/// An immutable domain event. The payload bytes are sent verbatim as the request body of
/// every delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: EventId,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    pub fn new(id: EventId, event_type: impl Into<String>, payload: Vec<u8>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            payload,
            occurred_at,
        }
    }
}

/// Check that an event type is a dotted lowercase name such as `order.completed`.
///
/// Segments are non-empty and made of `a-z`, `0-9`, `_` and `-`.
pub fn validate_event_type(event_type: &str) -> Result<(), String> {
    if event_type.is_empty() {
        return Err("Event type must not be empty".to_string());
    }
    if event_type.len() > MAX_EVENT_TYPE_LEN {
        return Err(format!("Event type exceeds {} characters: {}", MAX_EVENT_TYPE_LEN, event_type));
    }
    let valid_segment = |segment: &str| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    };
    if !event_type.split('.').all(valid_segment) {
        return Err(format!(
            "Invalid event type: {}. Expected dot-separated lowercase segments, e.g. order.completed",
            event_type
        ));
    }
    Ok(())
}

/// Validate and deduplicate a subscription's event types, preserving first-seen order.
pub fn normalize_event_types(event_types: Vec<String>) -> Result<Vec<String>, String> {
    if event_types.is_empty() {
        return Err("At least one event type is required".to_string());
    }
    let mut normalized: Vec<String> = Vec::with_capacity(event_types.len());
    for event_type in event_types {
        validate_event_type(&event_type)?;
        if !normalized.contains(&event_type) {
            normalized.push(event_type);
        }
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_event_type() {
        assert!(validate_event_type("order.completed").is_ok());
        assert!(validate_event_type("invoice").is_ok());
        assert!(validate_event_type("user_v2.email-changed").is_ok());

        assert!(validate_event_type("").is_err());
        assert!(validate_event_type("Order.Completed").is_err());
        assert!(validate_event_type("order..completed").is_err());
        assert!(validate_event_type(".order").is_err());
        assert!(validate_event_type("order.").is_err());
        assert!(validate_event_type("order completed").is_err());
        assert!(validate_event_type(&"a".repeat(MAX_EVENT_TYPE_LEN + 1)).is_err());
    }

    #[test]
    fn test_normalize_event_types_dedups() {
        let types = vec![
            "order.completed".to_string(),
            "order.refunded".to_string(),
            "order.completed".to_string(),
        ];
        assert_eq!(
            normalize_event_types(types).unwrap(),
            vec!["order.completed".to_string(), "order.refunded".to_string()]
        );
    }

    #[test]
    fn test_normalize_event_types_rejects_empty_and_invalid() {
        assert!(normalize_event_types(vec![]).is_err());
        assert!(normalize_event_types(vec!["ok.type".to_string(), "BAD".to_string()]).is_err());
    }
}
