//! Service request lifecycle and business ratings for a home-services marketplace.
//!
//! Consumers submit service requests to businesses; both sides then move each
//! request through a fixed status lifecycle (accept, request payment, pay, confirm,
//! review). This crate owns that lifecycle, the persistence boundary behind it, and
//! the rating aggregate that reviews update.
//!
//! Stores are pluggable: an in-memory store for tests and embedding, and a
//! PostgreSQL store behind the `postgres` feature.

pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod notify;
pub mod profile;
pub mod rating;
pub mod store;

// Re-export commonly used types
pub use domain::business::{Business, BusinessId, NewBusiness, Rating, Review, ReviewId};
pub use domain::request::{
    Action, ActionKind, AnyServiceRequest, PaymentMethod, RequestId, RequestStatus,
    ServiceKind, ServiceRequest, ServiceRequestDraft, UserId, available_actions,
};
pub use domain::{Actor, Party};
pub use error::{HandymanError, Result};
pub use lifecycle::{LifecycleConfig, RequestLifecycle};
#[cfg(feature = "metrics")]
pub use metrics::HandymanMetrics;
pub use notify::{Notification, Notifier, RecordingNotifier, TracingNotifier, WebhookNotifier};
pub use profile::BusinessProfiles;
pub use rating::{RatingAggregator, RatingConfig, ReviewSubmission};
pub use store::{BusinessStore, InMemoryStore, RequestFilter, RequestStore, StatusUpdate};
#[cfg(feature = "postgres")]
pub use store::postgres::{PoolConfig, PostgresStore, StorePools};

/// Get the handyman database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
