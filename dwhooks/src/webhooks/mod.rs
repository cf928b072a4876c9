//! Webhook delivery engine.
//!
//! - [`signing`]: secret generation, HMAC-SHA256 signing and verification
//! - [`events`]: the [`Event`](events::Event) type and event-type validation
//! - [`dispatcher`]: one attempt: sign, POST, classify, record
//! - [`retry`]: the retry schedule and per-attempt decision
//! - [`health`]: the endpoint health state machine
//! - [`coordinator`]: fan-out, the claim loop and the worker pool

pub mod coordinator;
pub mod dispatcher;
pub mod events;
pub mod health;
pub mod retry;
pub mod signing;

pub use coordinator::{Coordinator, CoordinatorSettings, PublishOutcome};
pub use dispatcher::Dispatcher;
pub use events::Event;
pub use retry::RetrySchedule;
