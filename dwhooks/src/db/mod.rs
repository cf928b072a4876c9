//! Persistence layer.
//!
//! The engine only talks to storage through the narrow traits in [`handlers`]:
//!
//! ```text
//! ┌──────────────────────┐
//! │ Coordinator / API    │
//! └──────────┬───────────┘
//!            │ Arc<dyn Store>
//!            ↓
//! ┌──────────────────────┐
//! │ Subscriptions        │  create / read / atomic health updates
//! │ DeliveryJobs         │  create / claim / conditional complete / scan
//! │ DeliveryLog          │  append / query
//! └──────────┬───────────┘
//!      ┌─────┴──────┐
//!      ↓            ↓
//! InMemoryStore  PostgresStore
//! ```
//!
//! # Modules
//!
//! - [`handlers`]: Store traits and their implementations
//! - [`models`]: Records shared by every implementation
//! - [`errors`]: Store error type

pub mod errors;
pub mod handlers;
pub mod models;

pub use handlers::{DeliveryJobs, DeliveryLog, InMemoryStore, PostgresStore, Store, Subscriptions};
