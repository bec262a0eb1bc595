//! Persistence boundary for requests, businesses and reviews.
//!
//! This module defines the `RequestStore` and `BusinessStore` traits. Stores are
//! deliberately ignorant of lifecycle policy: `update_status` writes whatever it is
//! given, guarded only by an optional expected-status precondition. The lifecycle
//! and rating services decide which writes are legal.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::domain::business::{
    Business, BusinessId, FoldedRating, NewBusiness, NewReview, RatingSnapshot, Review,
};
use crate::domain::request::{
    AnyServiceRequest, PaymentMethod, RequestId, RequestState, RequestStatus, ServiceRequest,
    ServiceRequestDraft, ServiceRequestRecord, UserId,
};
use crate::error::{HandymanError, Result};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryStore;

/// Live result sets produced by [`RequestStore::watch`].
pub type RequestStream = Pin<Box<dyn Stream<Item = Result<Vec<AnyServiceRequest>>> + Send>>;

/// Which requests a query or watch covers. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFilter {
    pub user_id: Option<UserId>,
    pub business_id: Option<BusinessId>,
    /// Restrict to these statuses.
    pub statuses: Option<Vec<RequestStatus>>,
}

impl RequestFilter {
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            ..Default::default()
        }
    }

    pub fn for_business(business_id: BusinessId) -> Self {
        Self {
            business_id: Some(business_id),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = RequestStatus>) -> Self {
        self.statuses = Some(statuses.into_iter().collect());
        self
    }

    pub fn matches(&self, request: &AnyServiceRequest) -> bool {
        let data = request.data();
        self.user_id.as_ref().is_none_or(|u| *u == data.user_id)
            && self.business_id.as_ref().is_none_or(|b| *b == data.business_id)
            && self
                .statuses
                .as_ref()
                .is_none_or(|s| s.contains(&request.status()))
    }

    /// Whether a change to a document with these parties can affect the result set.
    pub fn covers_change(&self, change: &RequestChange) -> bool {
        self.user_id
            .as_ref()
            .is_none_or(|u| change.user_id.as_deref() == Some(u.as_str()))
            && self
                .business_id
                .as_ref()
                .is_none_or(|b| change.business_id.as_deref() == Some(b.as_str()))
    }
}

/// A write to a request document, as published to watchers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RequestChange {
    pub id: uuid::Uuid,
    pub user_id: Option<String>,
    pub business_id: Option<String>,
}

impl RequestChange {
    pub fn of(record: &ServiceRequestRecord) -> Option<Self> {
        Some(RequestChange {
            id: record.id.parse().ok()?,
            user_id: record.user_id.clone(),
            business_id: record.business_id.clone(),
        })
    }
}

/// A single-document status write. `None` side fields leave the stored value alone.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: RequestStatus,
    /// Apply only if the stored status (normalized) still equals this.
    pub expected: Option<RequestStatus>,
    pub amount: Option<Decimal>,
    pub payment_method: Option<PaymentMethod>,
    pub at: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn new(status: RequestStatus) -> Self {
        Self {
            status,
            expected: None,
            amount: None,
            payment_method: None,
            at: Utc::now(),
        }
    }

    pub fn expecting(mut self, status: RequestStatus) -> Self {
        self.expected = Some(status);
        self
    }

    pub fn with_amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_payment_method(mut self, method: PaymentMethod) -> Self {
        self.payment_method = Some(method);
        self
    }

    /// The write that brings the stored document in line with `request`.
    pub fn for_request(request: &AnyServiceRequest, expected: RequestStatus) -> Self {
        Self {
            status: request.status(),
            expected: Some(expected),
            amount: request.amount(),
            payment_method: request.payment_method(),
            at: request.data().updated_at,
        }
    }

    /// Check the precondition against a stored status string.
    pub fn check_expected(&self, id: RequestId, stored: &str) -> Result<()> {
        let Some(expected) = self.expected else {
            return Ok(());
        };
        match RequestStatus::from_stored(stored) {
            Ok(current) if current == expected => Ok(()),
            Ok(current) => Err(HandymanError::TransactionConflict(format!(
                "request {} is '{}', expected '{}'",
                id, current, expected
            ))),
            Err(e) => Err(e),
        }
    }

    pub fn apply_to(&self, record: &mut ServiceRequestRecord) {
        record.status = self.status.as_str().to_string();
        if let Some(amount) = self.amount {
            record.amount = Some(amount);
        }
        if let Some(method) = self.payment_method {
            record.payment_method = Some(method.as_str().to_string());
        }
        record.updated_at = Some(self.at);
    }
}

/// Everything the rating transaction writes, with the preconditions it was computed
/// under.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewCommit {
    pub business_id: BusinessId,
    /// Business version the rating fold was computed from.
    pub expected_version: u64,
    pub rating: FoldedRating,
    /// Status the source request was read in.
    pub expected_request_status: RequestStatus,
    pub review: NewReview,
}

/// Storage for service requests.
///
/// Implementations must not hold locks across suspension points and must make every
/// write all-or-nothing.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a new `Pending` request and return its id.
    ///
    /// If the draft carries an idempotency key that is already stored, the existing
    /// id is returned and nothing is written.
    async fn create(&self, draft: ServiceRequestDraft) -> Result<RequestId>;

    async fn get(&self, id: RequestId) -> Result<AnyServiceRequest>;

    /// Requests matching `filter`, newest first.
    async fn query(&self, filter: RequestFilter) -> Result<Vec<AnyServiceRequest>>;

    async fn query_by_user(&self, user_id: &UserId) -> Result<Vec<AnyServiceRequest>> {
        self.query(RequestFilter::for_user(user_id.clone())).await
    }

    async fn query_by_business(&self, business_id: &BusinessId) -> Result<Vec<AnyServiceRequest>> {
        self.query(RequestFilter::for_business(business_id.clone()))
            .await
    }

    /// Write a status and its side fields in one update.
    ///
    /// Returns `TransactionConflict` without writing if `update.expected` is set and
    /// no longer matches.
    async fn update_status(&self, id: RequestId, update: StatusUpdate) -> Result<()>;

    /// The current result set, then a fresh one after every change to a matching
    /// request. Dropping the stream ends the subscription.
    fn watch(&self, filter: RequestFilter) -> RequestStream;

    /// Persist a typed transition out of `from`.
    async fn persist_transition<T: RequestState + Clone>(
        &self,
        from: RequestStatus,
        request: &ServiceRequest<T>,
    ) -> Result<()>
    where
        AnyServiceRequest: From<ServiceRequest<T>>,
    {
        let any_request = AnyServiceRequest::from(request.clone());
        let update = StatusUpdate::for_request(&any_request, from);
        self.update_status(any_request.id(), update).await
    }
}

/// Storage for business profiles and reviews.
#[async_trait]
pub trait BusinessStore: Send + Sync {
    /// Register an account as a business. Fails if it already is one.
    async fn upgrade_to_business(&self, profile: NewBusiness) -> Result<Business>;

    async fn get_business(&self, id: &BusinessId) -> Result<Business>;

    /// Replace the advertised service categories.
    async fn update_services(&self, id: &BusinessId, services: BTreeSet<String>)
    -> Result<Business>;

    async fn update_manager_name(&self, id: &BusinessId, name: Option<String>) -> Result<Business>;

    /// Current rating fields and the version they were read at.
    async fn rating_snapshot(&self, id: &BusinessId) -> Result<RatingSnapshot>;

    /// Atomically fold a rating into the business, insert the review, and mark the
    /// source request `Reviewed`.
    ///
    /// Returns `TransactionConflict` with nothing written if the business moved past
    /// `expected_version` or the request left `expected_request_status`.
    async fn commit_review(&self, commit: ReviewCommit) -> Result<Review>;

    /// Reviews for a business, newest first.
    async fn list_reviews(&self, id: &BusinessId) -> Result<Vec<Review>>;
}

/// Run a store call with a deadline. Expiry surfaces as `StoreUnavailable`.
pub async fn with_timeout<T, F>(timeout: Duration, operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                operation,
                timeout_ms = timeout.as_millis() as u64,
                "Store call timed out"
            );
            Err(HandymanError::StoreUnavailable(format!(
                "{} timed out after {}ms",
                operation,
                timeout.as_millis()
            )))
        }
    }
}
