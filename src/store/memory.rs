//! In-process store backend.
//!
//! Documents are kept as [`ServiceRequestRecord`]s so reads go through the same
//! validating decode as any other backend. Every write happens under a single
//! `parking_lot` lock, which is never held across an await, and is then announced
//! on a broadcast channel that backs [`RequestStore::watch`].
//!
//! Test hooks: [`InMemoryStore::fail_next`] injects a failure into the next write,
//! [`InMemoryStore::with_latency`] delays every call, and
//! [`InMemoryStore::insert_raw`] seeds legacy or corrupt documents.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use super::{
    BusinessStore, RequestChange, RequestFilter, RequestStore, RequestStream, ReviewCommit,
    StatusUpdate,
};
use crate::domain::business::{Business, BusinessId, NewBusiness, RatingSnapshot, Review, ReviewId};
use crate::domain::request::{
    AnyServiceRequest, RequestId, RequestStatus, ServiceRequestDraft, ServiceRequestRecord, UserId,
};
use crate::error::{HandymanError, Result};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// A failure to inject into the next write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The store is unreachable; nothing is written.
    Unavailable,
    /// A concurrent writer won; nothing is written.
    Conflict,
}

#[derive(Default)]
struct Documents {
    requests: HashMap<Uuid, ServiceRequestRecord>,
    /// Keys are scoped to the consumer that sent them.
    idempotency_keys: HashMap<(UserId, String), Uuid>,
    businesses: HashMap<BusinessId, Business>,
    reviews: Vec<Review>,
}

struct Inner {
    documents: Mutex<Documents>,
    faults: Mutex<VecDeque<Fault>>,
    latency: Mutex<Option<Duration>>,
    changes: broadcast::Sender<RequestChange>,
}

/// Store backed by process memory. Cheap to clone; clones share documents.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                documents: Mutex::new(Documents::default()),
                faults: Mutex::new(VecDeque::new()),
                latency: Mutex::new(None),
                changes,
            }),
        }
    }

    /// Delay every store call by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.inner.latency.lock() = Some(latency);
        self
    }

    /// Make the next write fail with `fault`. Queued faults are consumed in order.
    pub fn fail_next(&self, fault: Fault) {
        self.inner.faults.lock().push_back(fault);
    }

    pub fn fail_times(&self, times: usize, fault: Fault) {
        let mut faults = self.inner.faults.lock();
        faults.extend(std::iter::repeat_n(fault, times));
    }

    /// Store a document as-is, bypassing validation.
    pub fn insert_raw(&self, record: ServiceRequestRecord) -> Result<RequestId> {
        let id = Uuid::parse_str(&record.id)
            .map_err(|e| HandymanError::Validation(format!("invalid request id: {}", e)))?;
        let change = RequestChange::of(&record);
        self.inner.documents.lock().requests.insert(id, record);
        self.publish(change);
        Ok(RequestId(id))
    }

    /// The stored document, undecoded.
    pub fn raw_record(&self, id: RequestId) -> Option<ServiceRequestRecord> {
        self.inner.documents.lock().requests.get(&id.0).cloned()
    }

    pub fn review_count(&self) -> usize {
        self.inner.documents.lock().reviews.len()
    }

    /// Live watch streams. Dropping a stream unsubscribes it.
    pub fn watcher_count(&self) -> usize {
        self.inner.changes.receiver_count()
    }

    async fn delay(&self) {
        let latency = *self.inner.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Entry point for every write: latency, then any queued fault.
    async fn begin_write(&self, operation: &str) -> Result<()> {
        self.delay().await;
        let fault = self.inner.faults.lock().pop_front();
        match fault {
            None => Ok(()),
            Some(Fault::Unavailable) => {
                tracing::debug!(operation, "Injected store outage");
                Err(HandymanError::StoreUnavailable(format!(
                    "{}: store unreachable",
                    operation
                )))
            }
            Some(Fault::Conflict) => {
                tracing::debug!(operation, "Injected transaction conflict");
                Err(HandymanError::TransactionConflict(format!(
                    "{}: concurrent write",
                    operation
                )))
            }
        }
    }

    fn publish(&self, change: Option<RequestChange>) {
        // No receivers is fine: nobody is watching.
        if let Some(change) = change {
            let _ = self.inner.changes.send(change);
        }
    }

    fn select(&self, filter: &RequestFilter) -> Result<Vec<AnyServiceRequest>> {
        let records: Vec<ServiceRequestRecord> = {
            let documents = self.inner.documents.lock();
            documents
                .requests
                .values()
                .filter(|record| {
                    filter
                        .user_id
                        .as_ref()
                        .is_none_or(|u| record.owner() == Some(u.as_str()))
                        && filter
                            .business_id
                            .as_ref()
                            .is_none_or(|b| record.business() == Some(b.as_str()))
                })
                .cloned()
                .collect()
        };

        let mut requests = records
            .into_iter()
            .map(AnyServiceRequest::try_from)
            .collect::<Result<Vec<_>>>()?;
        requests.retain(|request| filter.matches(request));
        requests.sort_by(|a, b| b.data().created_at.cmp(&a.data().created_at));
        Ok(requests)
    }

    fn modify_business<F>(&self, id: &BusinessId, change: F) -> Result<Business>
    where
        F: FnOnce(&mut Business),
    {
        let mut documents = self.inner.documents.lock();
        let business = documents
            .businesses
            .get_mut(id)
            .ok_or_else(|| HandymanError::BusinessNotFound(id.clone()))?;
        change(business);
        business.version += 1;
        Ok(business.clone())
    }
}

#[async_trait]
impl RequestStore for InMemoryStore {
    async fn create(&self, draft: ServiceRequestDraft) -> Result<RequestId> {
        draft.validate()?;
        self.begin_write("create").await?;

        let (id, change) = {
            let mut documents = self.inner.documents.lock();
            let scoped_key = draft
                .idempotency_key
                .clone()
                .map(|key| (draft.user_id.clone(), key));
            if let Some(key) = &scoped_key
                && let Some(existing) = documents.idempotency_keys.get(key)
            {
                tracing::debug!(
                    request_id = %RequestId(*existing),
                    idempotency_key = %key.1,
                    "Create deduplicated by idempotency key"
                );
                return Ok(RequestId(*existing));
            }

            let id = RequestId(Uuid::new_v4());
            let record = ServiceRequestRecord::new_pending(id, &draft, Utc::now());
            let change = RequestChange::of(&record);
            if let Some(key) = scoped_key {
                documents.idempotency_keys.insert(key, id.0);
            }
            documents.requests.insert(id.0, record);
            (id, change)
        };

        self.publish(change);
        tracing::debug!(request_id = %id, "Created service request");
        Ok(id)
    }

    async fn get(&self, id: RequestId) -> Result<AnyServiceRequest> {
        self.delay().await;
        let record = self
            .inner
            .documents
            .lock()
            .requests
            .get(&id.0)
            .cloned()
            .ok_or(HandymanError::RequestNotFound(id))?;
        AnyServiceRequest::try_from(record)
    }

    async fn query(&self, filter: RequestFilter) -> Result<Vec<AnyServiceRequest>> {
        self.delay().await;
        self.select(&filter)
    }

    async fn update_status(&self, id: RequestId, update: StatusUpdate) -> Result<()> {
        self.begin_write("update_status").await?;

        let change = {
            let mut documents = self.inner.documents.lock();
            let record = documents
                .requests
                .get_mut(&id.0)
                .ok_or(HandymanError::RequestNotFound(id))?;
            update.check_expected(id, &record.status)?;
            update.apply_to(record);
            RequestChange::of(record)
        };

        self.publish(change);
        Ok(())
    }

    fn watch(&self, filter: RequestFilter) -> RequestStream {
        // Subscribe before the first snapshot so no change can slip between them.
        let changes = self.inner.changes.subscribe();
        let store = self.clone();

        type State = (InMemoryStore, RequestFilter, broadcast::Receiver<RequestChange>, bool);

        Box::pin(futures::stream::unfold(
            (store, filter, changes, true),
            |(store, filter, mut changes, first): State| async move {
                if !first {
                    loop {
                        match changes.recv().await {
                            Ok(change) if filter.covers_change(&change) => break,
                            Ok(_) => continue,
                            Err(RecvError::Lagged(skipped)) => {
                                tracing::warn!(skipped, "Watcher lagged behind changes, re-querying");
                                break;
                            }
                            Err(RecvError::Closed) => return None,
                        }
                    }
                }
                let snapshot = store.select(&filter);
                Some((snapshot, (store, filter, changes, false)))
            },
        ))
    }
}

#[async_trait]
impl BusinessStore for InMemoryStore {
    async fn upgrade_to_business(&self, profile: NewBusiness) -> Result<Business> {
        let business = profile.into_business()?;
        self.begin_write("upgrade_to_business").await?;

        let mut documents = self.inner.documents.lock();
        if documents.businesses.contains_key(&business.uid) {
            return Err(HandymanError::Validation(format!(
                "account {} is already a business",
                business.uid
            )));
        }
        documents
            .businesses
            .insert(business.uid.clone(), business.clone());
        Ok(business)
    }

    async fn get_business(&self, id: &BusinessId) -> Result<Business> {
        self.delay().await;
        self.inner
            .documents
            .lock()
            .businesses
            .get(id)
            .cloned()
            .ok_or_else(|| HandymanError::BusinessNotFound(id.clone()))
    }

    async fn update_services(
        &self,
        id: &BusinessId,
        services: BTreeSet<String>,
    ) -> Result<Business> {
        self.begin_write("update_services").await?;
        self.modify_business(id, |business| business.services = services)
    }

    async fn update_manager_name(&self, id: &BusinessId, name: Option<String>) -> Result<Business> {
        self.begin_write("update_manager_name").await?;
        self.modify_business(id, |business| business.manager_name = name)
    }

    async fn rating_snapshot(&self, id: &BusinessId) -> Result<RatingSnapshot> {
        let business = self.get_business(id).await?;
        Ok(RatingSnapshot {
            business_id: business.uid,
            business_name: business.business_name,
            average_rating: business.average_rating,
            rating_count: business.rating_count,
            version: business.version,
        })
    }

    async fn commit_review(&self, commit: ReviewCommit) -> Result<Review> {
        self.begin_write("commit_review").await?;
        let request_id = commit.review.source_request_id;

        let (review, change) = {
            let mut documents = self.inner.documents.lock();

            // Check every precondition before touching anything.
            let business = documents
                .businesses
                .get(&commit.business_id)
                .ok_or_else(|| HandymanError::BusinessNotFound(commit.business_id.clone()))?;
            if business.version != commit.expected_version {
                return Err(HandymanError::TransactionConflict(format!(
                    "business {} is at version {}, expected {}",
                    commit.business_id, business.version, commit.expected_version
                )));
            }
            let record = documents
                .requests
                .get(&request_id.0)
                .ok_or(HandymanError::RequestNotFound(request_id))?;
            let reviewed = StatusUpdate::new(RequestStatus::Reviewed)
                .expecting(commit.expected_request_status);
            reviewed.check_expected(request_id, &record.status)?;
            if documents
                .reviews
                .iter()
                .any(|review| review.source_request_id == request_id)
            {
                return Err(HandymanError::TransactionConflict(format!(
                    "request {} already has a review",
                    request_id
                )));
            }

            let review = commit
                .review
                .into_review(ReviewId(Uuid::new_v4()), reviewed.at);

            if let Some(business) = documents.businesses.get_mut(&commit.business_id) {
                business.average_rating = commit.rating.average_rating;
                business.rating_count = commit.rating.rating_count;
                business.version += 1;
            }
            let change = documents.requests.get_mut(&request_id.0).and_then(|record| {
                reviewed.apply_to(record);
                RequestChange::of(record)
            });
            documents.reviews.push(review.clone());
            (review, change)
        };

        self.publish(change);
        Ok(review)
    }

    async fn list_reviews(&self, id: &BusinessId) -> Result<Vec<Review>> {
        self.delay().await;
        let mut reviews: Vec<Review> = self
            .inner
            .documents
            .lock()
            .reviews
            .iter()
            .filter(|review| review.business_id == *id)
            .cloned()
            .collect();
        reviews.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(reviews)
    }
}
