//! API request and response data models.
//!
//! API models are distinct from the store models in [`crate::db::models`]; in particular the
//! signing secret only appears in [`webhooks::SubscriptionWithSecretResponse`].

pub mod webhooks;
