//! PostgreSQL store backend.
//!
//! Status writes and the rating transaction run in transactions that lock the rows
//! they check with `SELECT ... FOR UPDATE`, so preconditions and writes cannot
//! interleave with another writer. Changes are announced by a trigger on the
//! `service_request_changes` channel and consumed by [`RequestStore::watch`].

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgListener;
use uuid::Uuid;

use super::{
    BusinessStore, RequestChange, RequestFilter, RequestStore, RequestStream, ReviewCommit,
    StatusUpdate,
};
use crate::domain::business::{
    Business, BusinessId, GeoPoint, NewBusiness, Rating, RatingSnapshot, Review, ReviewId,
};
use crate::domain::request::{
    AnyServiceRequest, RequestId, RequestStatus, ServiceRequestDraft, ServiceRequestRecord, UserId,
};
use crate::error::{HandymanError, Result};

mod pools;

pub use pools::{PoolConfig, StorePools};

const CHANGE_CHANNEL: &str = "service_request_changes";
const RECONNECT_DELAY_SECS: u64 = 5;

const REQUEST_COLUMNS: &str = "id, user_id, user_name, business_id, business_name, \
    service_category, service, scheduled_at, scheduled_date, scheduled_time, amount, \
    payment_method, status, created_at, updated_at, idempotency_key";

const BUSINESS_COLUMNS: &str = "uid, business_name, manager_name, contact_email, \
    contact_phone, latitude, longitude, services, average_rating, rating_count, version";

const REVIEW_COLUMNS: &str = "id, business_id, business_name, client_id, client_name, \
    rating, comment, source_request_id, created_at";

/// Map a database error onto the store taxonomy.
fn store_error(operation: &str, e: sqlx::Error) -> HandymanError {
    if let sqlx::Error::Database(db) = &e {
        match db.code().as_deref() {
            // serialization_failure, deadlock_detected, unique_violation
            Some("40001") | Some("40P01") | Some("23505") => {
                tracing::warn!(operation, error = %db, "Store write conflicted");
                return HandymanError::TransactionConflict(format!("{}: {}", operation, db));
            }
            // check_violation
            Some("23514") => {
                return HandymanError::Validation(format!("{}: {}", operation, db));
            }
            _ => {}
        }
    }
    tracing::error!(operation, error = %e, "Store call failed");
    HandymanError::StoreUnavailable(format!("{}: {}", operation, e))
}

#[derive(sqlx::FromRow)]
struct RequestRow {
    id: Uuid,
    user_id: Option<String>,
    user_name: String,
    business_id: Option<String>,
    business_name: String,
    service_category: Option<String>,
    service: Option<String>,
    scheduled_at: Option<DateTime<Utc>>,
    scheduled_date: Option<String>,
    scheduled_time: Option<String>,
    amount: Option<Decimal>,
    payment_method: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    idempotency_key: Option<String>,
}

impl From<RequestRow> for ServiceRequestRecord {
    fn from(row: RequestRow) -> Self {
        ServiceRequestRecord {
            id: row.id.to_string(),
            user_id: row.user_id,
            user_name: row.user_name,
            business_id: row.business_id,
            business_name: row.business_name,
            service_category: row.service_category,
            service: row.service,
            scheduled_date_time: row.scheduled_at,
            scheduled_date: row.scheduled_date,
            scheduled_time: row.scheduled_time,
            amount: row.amount,
            payment_method: row.payment_method,
            status: row.status,
            timestamp: Some(row.created_at),
            updated_at: Some(row.updated_at),
            idempotency_key: row.idempotency_key,
        }
    }
}

#[derive(sqlx::FromRow)]
struct BusinessRow {
    uid: String,
    business_name: String,
    manager_name: Option<String>,
    contact_email: Option<String>,
    contact_phone: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    services: Vec<String>,
    average_rating: f64,
    rating_count: i32,
    version: i64,
}

impl From<BusinessRow> for Business {
    fn from(row: BusinessRow) -> Self {
        let location = match (row.latitude, row.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoPoint {
                latitude,
                longitude,
            }),
            _ => None,
        };
        Business {
            uid: BusinessId(row.uid),
            business_name: row.business_name,
            manager_name: row.manager_name,
            contact_email: row.contact_email,
            contact_phone: row.contact_phone,
            location,
            services: row.services.into_iter().collect(),
            average_rating: row.average_rating,
            rating_count: row.rating_count.max(0) as u32,
            version: row.version.max(0) as u64,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ReviewRow {
    id: Uuid,
    business_id: String,
    business_name: String,
    client_id: String,
    client_name: String,
    rating: i16,
    comment: String,
    source_request_id: Uuid,
    created_at: DateTime<Utc>,
}

impl TryFrom<ReviewRow> for Review {
    type Error = HandymanError;

    fn try_from(row: ReviewRow) -> Result<Self> {
        Ok(Review {
            id: ReviewId(row.id),
            business_id: BusinessId(row.business_id),
            business_name: row.business_name,
            client_id: UserId(row.client_id),
            client_name: row.client_name,
            rating: Rating::new(i64::from(row.rating))?,
            comment: row.comment,
            source_request_id: RequestId(row.source_request_id),
            created_at: row.created_at,
        })
    }
}

/// PostgreSQL implementation of [`RequestStore`] and [`BusinessStore`].
///
/// # Example
/// ```ignore
/// let pool = PgPool::connect(&database_url).await?;
/// handyman::migrator().run(&pool).await?;
/// let store = PostgresStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pools: StorePools,
}

impl PostgresStore {
    pub fn new(pools: impl Into<StorePools>) -> Self {
        Self {
            pools: pools.into(),
        }
    }

    pub async fn connect(config: &PoolConfig) -> Result<Self> {
        Ok(Self::new(StorePools::connect(config).await?))
    }

    pub fn pools(&self) -> &StorePools {
        &self.pools
    }

    async fn select(&self, filter: &RequestFilter) -> Result<Vec<AnyServiceRequest>> {
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM service_requests \
             WHERE ($1::TEXT IS NULL OR user_id = $1) \
               AND ($2::TEXT IS NULL OR business_id = $2) \
             ORDER BY created_at DESC"
        );
        let rows: Vec<RequestRow> = sqlx::query_as(&sql)
            .bind(filter.user_id.as_ref().map(|u| u.as_str()))
            .bind(filter.business_id.as_ref().map(|b| b.as_str()))
            .fetch_all(self.pools.read())
            .await
            .map_err(|e| store_error("query", e))?;

        let mut requests = rows
            .into_iter()
            .map(|row| AnyServiceRequest::try_from(ServiceRequestRecord::from(row)))
            .collect::<Result<Vec<_>>>()?;
        requests.retain(|request| filter.matches(request));
        Ok(requests)
    }
}

#[async_trait]
impl RequestStore for PostgresStore {
    #[tracing::instrument(skip(self, draft), fields(user_id = %draft.user_id, business_id = %draft.business_id))]
    async fn create(&self, draft: ServiceRequestDraft) -> Result<RequestId> {
        draft.validate()?;
        let id = RequestId(Uuid::new_v4());
        let record = ServiceRequestRecord::new_pending(id, &draft, Utc::now());

        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO service_requests (
                id, user_id, user_name, business_id, business_name,
                service_category, service, scheduled_at, status, idempotency_key
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (user_id, idempotency_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id.0)
        .bind(&record.user_id)
        .bind(&record.user_name)
        .bind(&record.business_id)
        .bind(&record.business_name)
        .bind(&record.service_category)
        .bind(&record.service)
        .bind(record.scheduled_date_time)
        .bind(&record.status)
        .bind(&record.idempotency_key)
        .fetch_optional(self.pools.write())
        .await
        .map_err(|e| store_error("create", e))?;

        if let Some((created,)) = inserted {
            tracing::debug!(request_id = %RequestId(created), "Created service request");
            return Ok(RequestId(created));
        }

        // Only this consumer's idempotency key can conflict; return the request holding it.
        let existing: (Uuid,) = sqlx::query_as(
            "SELECT id FROM service_requests WHERE user_id = $1 AND idempotency_key = $2",
        )
        .bind(&record.user_id)
        .bind(&record.idempotency_key)
        .fetch_one(self.pools.write())
        .await
        .map_err(|e| store_error("create", e))?;
        tracing::debug!(
            request_id = %RequestId(existing.0),
            "Create deduplicated by idempotency key"
        );
        Ok(RequestId(existing.0))
    }

    async fn get(&self, id: RequestId) -> Result<AnyServiceRequest> {
        // Primary: callers validate transitions against what they read here.
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM service_requests WHERE id = $1");
        let row: Option<RequestRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(self.pools.write())
            .await
            .map_err(|e| store_error("get", e))?;
        let row = row.ok_or(HandymanError::RequestNotFound(id))?;
        AnyServiceRequest::try_from(ServiceRequestRecord::from(row))
    }

    async fn query(&self, filter: RequestFilter) -> Result<Vec<AnyServiceRequest>> {
        self.select(&filter).await
    }

    #[tracing::instrument(skip(self, update), fields(request_id = %id, status = %update.status))]
    async fn update_status(&self, id: RequestId, update: StatusUpdate) -> Result<()> {
        let mut tx = self
            .pools
            .write()
            .begin()
            .await
            .map_err(|e| store_error("update_status", e))?;

        let stored: Option<(String,)> =
            sqlx::query_as("SELECT status FROM service_requests WHERE id = $1 FOR UPDATE")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| store_error("update_status", e))?;
        let (status,) = stored.ok_or(HandymanError::RequestNotFound(id))?;
        update.check_expected(id, &status)?;

        sqlx::query(
            r#"
            UPDATE service_requests SET
                status = $2,
                amount = COALESCE($3, amount),
                payment_method = COALESCE($4, payment_method),
                updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(update.status.as_str())
        .bind(update.amount)
        .bind(update.payment_method.map(|m| m.as_str()))
        .bind(update.at)
        .execute(&mut *tx)
        .await
        .map_err(|e| store_error("update_status", e))?;

        tx.commit()
            .await
            .map_err(|e| store_error("update_status", e))?;
        Ok(())
    }

    fn watch(&self, filter: RequestFilter) -> RequestStream {
        let store = self.clone();

        // State: (store, filter, live listener, whether a fresh snapshot is owed).
        // Every (re)connect owes a snapshot, since changes may have been missed.
        type State = (PostgresStore, RequestFilter, Option<PgListener>, bool);

        Box::pin(futures::stream::unfold(
            (store, filter, None, true),
            |(store, filter, mut listener, mut owed): State| async move {
                loop {
                    if listener.is_none() {
                        let connected = 'reconnect: loop {
                            let mut connected =
                                match PgListener::connect_with(store.pools.write()).await {
                                    Ok(connected) => connected,
                                    Err(e) => {
                                        tracing::error!(
                                            error = %e,
                                            "Failed to connect request watcher, retrying in {}s",
                                            RECONNECT_DELAY_SECS
                                        );
                                        tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS))
                                            .await;
                                        continue 'reconnect;
                                    }
                                };
                            if let Err(e) = connected.listen(CHANGE_CHANNEL).await {
                                tracing::error!(
                                    error = %e,
                                    "Failed to LISTEN on {}, retrying in {}s",
                                    CHANGE_CHANNEL,
                                    RECONNECT_DELAY_SECS
                                );
                                tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
                                continue 'reconnect;
                            }
                            tracing::debug!("Watching service requests via PostgreSQL NOTIFY");
                            break connected;
                        };
                        listener = Some(connected);
                        owed = true;
                    }

                    if owed {
                        let snapshot = store.select(&filter).await;
                        if snapshot.is_err() {
                            tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
                            return Some((snapshot, (store, filter, listener, true)));
                        }
                        return Some((snapshot, (store, filter, listener, false)));
                    }

                    let Some(active) = listener.as_mut() else {
                        continue;
                    };
                    match active.try_recv().await {
                        Ok(Some(notification)) => {
                            match serde_json::from_str::<RequestChange>(notification.payload()) {
                                Ok(change) => owed = filter.covers_change(&change),
                                Err(e) => {
                                    tracing::error!(
                                        payload = notification.payload(),
                                        error = %e,
                                        "Unparseable change notification, skipping"
                                    );
                                }
                            }
                        }
                        Ok(None) => {
                            tracing::warn!(
                                "Watcher connection closed, reconnecting in {}s",
                                RECONNECT_DELAY_SECS
                            );
                            tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
                            listener = None;
                        }
                        Err(e) => {
                            tracing::error!(
                                error = %e,
                                "Watcher listen failed, reconnecting in {}s",
                                RECONNECT_DELAY_SECS
                            );
                            tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
                            listener = None;
                        }
                    }
                }
            },
        ))
    }
}

#[async_trait]
impl BusinessStore for PostgresStore {
    async fn upgrade_to_business(&self, profile: NewBusiness) -> Result<Business> {
        let business = profile.into_business()?;
        let sql = format!(
            r#"
            INSERT INTO businesses (
                uid, business_name, manager_name, contact_email, contact_phone,
                latitude, longitude, services
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (uid) DO NOTHING
            RETURNING {BUSINESS_COLUMNS}
            "#
        );
        let row: Option<BusinessRow> = sqlx::query_as(&sql)
            .bind(business.uid.as_str())
            .bind(&business.business_name)
            .bind(&business.manager_name)
            .bind(&business.contact_email)
            .bind(&business.contact_phone)
            .bind(business.location.map(|l| l.latitude))
            .bind(business.location.map(|l| l.longitude))
            .bind(business.services.iter().cloned().collect::<Vec<_>>())
            .fetch_optional(self.pools.write())
            .await
            .map_err(|e| store_error("upgrade_to_business", e))?;

        row.map(Business::from).ok_or_else(|| {
            HandymanError::Validation(format!("account {} is already a business", business.uid))
        })
    }

    async fn get_business(&self, id: &BusinessId) -> Result<Business> {
        let sql = format!("SELECT {BUSINESS_COLUMNS} FROM businesses WHERE uid = $1");
        let row: Option<BusinessRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .fetch_optional(self.pools.read())
            .await
            .map_err(|e| store_error("get_business", e))?;
        row.map(Business::from)
            .ok_or_else(|| HandymanError::BusinessNotFound(id.clone()))
    }

    async fn update_services(
        &self,
        id: &BusinessId,
        services: BTreeSet<String>,
    ) -> Result<Business> {
        let sql = format!(
            "UPDATE businesses SET services = $2, version = version + 1 \
             WHERE uid = $1 RETURNING {BUSINESS_COLUMNS}"
        );
        let row: Option<BusinessRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .bind(services.into_iter().collect::<Vec<_>>())
            .fetch_optional(self.pools.write())
            .await
            .map_err(|e| store_error("update_services", e))?;
        row.map(Business::from)
            .ok_or_else(|| HandymanError::BusinessNotFound(id.clone()))
    }

    async fn update_manager_name(&self, id: &BusinessId, name: Option<String>) -> Result<Business> {
        let sql = format!(
            "UPDATE businesses SET manager_name = $2, version = version + 1 \
             WHERE uid = $1 RETURNING {BUSINESS_COLUMNS}"
        );
        let row: Option<BusinessRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .bind(name)
            .fetch_optional(self.pools.write())
            .await
            .map_err(|e| store_error("update_manager_name", e))?;
        row.map(Business::from)
            .ok_or_else(|| HandymanError::BusinessNotFound(id.clone()))
    }

    async fn rating_snapshot(&self, id: &BusinessId) -> Result<RatingSnapshot> {
        // Primary: the version read here is checked by commit_review.
        let row: Option<(String, f64, i32, i64)> = sqlx::query_as(
            "SELECT business_name, average_rating, rating_count, version FROM businesses WHERE uid = $1",
        )
        .bind(id.as_str())
        .fetch_optional(self.pools.write())
        .await
        .map_err(|e| store_error("rating_snapshot", e))?;
        let (business_name, average_rating, rating_count, version) =
            row.ok_or_else(|| HandymanError::BusinessNotFound(id.clone()))?;
        Ok(RatingSnapshot {
            business_id: id.clone(),
            business_name,
            average_rating,
            rating_count: rating_count.max(0) as u32,
            version: version.max(0) as u64,
        })
    }

    #[tracing::instrument(skip(self, commit), fields(
        business_id = %commit.business_id,
        request_id = %commit.review.source_request_id
    ))]
    async fn commit_review(&self, commit: ReviewCommit) -> Result<Review> {
        let request_id = commit.review.source_request_id;
        let mut tx = self
            .pools
            .write()
            .begin()
            .await
            .map_err(|e| store_error("commit_review", e))?;

        let version: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM businesses WHERE uid = $1 FOR UPDATE")
                .bind(commit.business_id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| store_error("commit_review", e))?;
        let (version,) =
            version.ok_or_else(|| HandymanError::BusinessNotFound(commit.business_id.clone()))?;
        if version as u64 != commit.expected_version {
            return Err(HandymanError::TransactionConflict(format!(
                "business {} is at version {}, expected {}",
                commit.business_id, version, commit.expected_version
            )));
        }

        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM service_requests WHERE id = $1 FOR UPDATE")
                .bind(request_id.0)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| store_error("commit_review", e))?;
        let (status,) = status.ok_or(HandymanError::RequestNotFound(request_id))?;
        let reviewed =
            StatusUpdate::new(RequestStatus::Reviewed).expecting(commit.expected_request_status);
        reviewed.check_expected(request_id, &status)?;

        sqlx::query(
            r#"
            UPDATE businesses SET
                average_rating = $2,
                rating_count = $3,
                version = version + 1
            WHERE uid = $1
            "#,
        )
        .bind(commit.business_id.as_str())
        .bind(commit.rating.average_rating)
        .bind(commit.rating.rating_count as i32)
        .execute(&mut *tx)
        .await
        .map_err(|e| store_error("commit_review", e))?;

        let review_id = ReviewId(Uuid::new_v4());
        let (created_at,): (DateTime<Utc>,) = sqlx::query_as(
            r#"
            INSERT INTO reviews (
                id, business_id, business_name, client_id, client_name,
                rating, comment, source_request_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING created_at
            "#,
        )
        .bind(review_id.0)
        .bind(commit.review.business_id.as_str())
        .bind(&commit.review.business_name)
        .bind(commit.review.client_id.as_str())
        .bind(&commit.review.client_name)
        .bind(i16::from(commit.review.rating.value()))
        .bind(&commit.review.comment)
        .bind(request_id.0)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| store_error("commit_review", e))?;

        sqlx::query("UPDATE service_requests SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(request_id.0)
            .bind(RequestStatus::Reviewed.as_str())
            .bind(created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error("commit_review", e))?;

        tx.commit()
            .await
            .map_err(|e| store_error("commit_review", e))?;

        Ok(commit.review.into_review(review_id, created_at))
    }

    async fn list_reviews(&self, id: &BusinessId) -> Result<Vec<Review>> {
        let sql = format!(
            "SELECT {REVIEW_COLUMNS} FROM reviews WHERE business_id = $1 ORDER BY created_at DESC"
        );
        let rows: Vec<ReviewRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .fetch_all(self.pools.read())
            .await
            .map_err(|e| store_error("list_reviews", e))?;
        rows.into_iter().map(Review::try_from).collect()
    }
}
