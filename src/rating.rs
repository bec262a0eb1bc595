//! Review submission and business rating aggregation.
//!
//! A review touches three records: the business's rating fields, a new review, and
//! the source request's status. [`RatingAggregator`] reads all it needs, folds the
//! rating into a snapshot of the business, and hands the result to
//! [`BusinessStore::commit_review`], which applies it atomically only if nothing it
//! read has changed. Lost races are retried from a fresh read.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::domain::Actor;
use crate::domain::business::{BusinessId, NewReview, Rating, Review};
use crate::domain::request::{ActionKind, RequestId, RequestStatus, UserId};
use crate::error::{HandymanError, Result};
#[cfg(feature = "metrics")]
use crate::metrics::HandymanMetrics;
use crate::notify::{Notifier, TracingNotifier, report};
use crate::store::{BusinessStore, RequestStore, ReviewCommit, with_timeout};

/// Configuration for [`RatingAggregator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatingConfig {
    /// Deadline for each store call in milliseconds
    pub store_timeout_ms: u64,

    /// How many times a submission is attempted when the commit conflicts
    pub max_attempts: u32,

    /// Base delay between attempts; attempt `n` waits `n * backoff_ms`
    pub backoff_ms: u64,
}

impl Default for RatingConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: 10_000,
            max_attempts: 5,
            backoff_ms: 20,
        }
    }
}

/// A consumer's review of a finished request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewSubmission {
    pub business_id: BusinessId,
    pub client_id: UserId,
    pub client_name: String,
    /// Star rating, 1 to 5.
    pub rating: i64,
    #[serde(default)]
    pub comment: String,
    pub source_request_id: RequestId,
}

pub struct RatingAggregator<S> {
    store: Arc<S>,
    config: RatingConfig,
    notifier: Arc<dyn Notifier>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<HandymanMetrics>>,
}

impl<S> Clone for RatingAggregator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
            notifier: self.notifier.clone(),
            #[cfg(feature = "metrics")]
            metrics: self.metrics.clone(),
        }
    }
}

impl<S: RequestStore + BusinessStore> RatingAggregator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            config: RatingConfig::default(),
            notifier: Arc::new(TracingNotifier),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    pub fn with_config(mut self, config: RatingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<HandymanMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Record a review, fold its rating into the business average, and mark the
    /// source request `Reviewed`, all or nothing.
    ///
    /// # Errors
    ///
    /// - `Validation` if the rating is outside 1..=5 or the request belongs to a
    ///   different business
    /// - `Forbidden` if `actor` is not the consumer who made the request
    /// - `InvalidTransition` if the request is not awaiting a review, including when
    ///   it was reviewed already
    /// - `TransactionConflict` if every attempt lost a race
    #[tracing::instrument(
        skip(self, actor, submission),
        fields(
            actor = %actor,
            business_id = %submission.business_id,
            request_id = %submission.source_request_id,
        )
    )]
    pub async fn submit_review(&self, actor: &Actor, submission: ReviewSubmission) -> Result<Review> {
        let request_id = submission.source_request_id;
        let result = self.submit_with_retry(actor, &submission).await;
        if let Err(e @ HandymanError::StoreUnavailable(_)) = &result {
            tracing::error!(error = %e, "Review failed: store unavailable");
        }
        report(
            self.notifier.as_ref(),
            actor,
            Some(request_id),
            ActionKind::SubmitReview.success_message(),
            &result,
        )
        .await;
        result
    }

    async fn submit_with_retry(&self, actor: &Actor, submission: &ReviewSubmission) -> Result<Review> {
        let rating = Rating::new(submission.rating)?;
        if !actor.is_user(&submission.client_id) {
            counter!("handyman_transition_rejected_total", "reason" => "forbidden").increment(1);
            return Err(HandymanError::Forbidden {
                actor: actor.uid().to_string(),
                action: "review on behalf of another account".to_string(),
            });
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt: u32 = 1;
        loop {
            match self.try_submit(submission, rating).await {
                Ok((review, from)) => {
                    counter!("handyman_reviews_submitted_total").increment(1);
                    #[cfg(feature = "metrics")]
                    if let Some(metrics) = &self.metrics {
                        metrics.record_review(rating);
                        metrics.record_status_change(from, RequestStatus::Reviewed);
                    }
                    tracing::info!(
                        review_id = %review.id,
                        from = %from,
                        rating = rating.value(),
                        attempt,
                        "Review committed"
                    );
                    return Ok(review);
                }
                Err(HandymanError::TransactionConflict(reason)) => {
                    counter!("handyman_transaction_conflicts_total", "operation" => "submit_review")
                        .increment(1);
                    if attempt >= max_attempts {
                        tracing::warn!(attempt, reason = %reason, "Review conflicted, giving up");
                        return Err(HandymanError::TransactionConflict(reason));
                    }
                    tracing::warn!(attempt, reason = %reason, "Review conflicted, retrying");
                    tokio::time::sleep(Duration::from_millis(
                        self.config.backoff_ms * u64::from(attempt),
                    ))
                    .await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One read-fold-commit pass. Returns the review and the status the request was
    /// reviewed from.
    async fn try_submit(
        &self,
        submission: &ReviewSubmission,
        rating: Rating,
    ) -> Result<(Review, RequestStatus)> {
        let request = self
            .call("get", self.store.get(submission.source_request_id))
            .await?;
        let data = request.data();
        if data.user_id != submission.client_id {
            counter!("handyman_transition_rejected_total", "reason" => "forbidden").increment(1);
            return Err(HandymanError::Forbidden {
                actor: submission.client_id.to_string(),
                action: "review a request they did not make".to_string(),
            });
        }
        if data.business_id != submission.business_id {
            return Err(HandymanError::Validation(format!(
                "request {} was not made to business {}",
                data.id, submission.business_id
            )));
        }

        let from = request.status();
        if !from.can_transition_to(RequestStatus::Reviewed) {
            counter!("handyman_transition_rejected_total", "reason" => "invalid_transition")
                .increment(1);
            return Err(HandymanError::InvalidTransition {
                from,
                to: RequestStatus::Reviewed,
            });
        }
        let reviewed = request.into_reviewed(Utc::now())?;

        let snapshot = self
            .call(
                "rating_snapshot",
                self.store.rating_snapshot(&submission.business_id),
            )
            .await?;
        let folded = snapshot.fold(rating);
        tracing::debug!(
            version = snapshot.version,
            previous_average = snapshot.average_rating,
            average_rating = folded.average_rating,
            rating_count = folded.rating_count,
            "Folded rating into snapshot"
        );

        let commit = ReviewCommit {
            business_id: submission.business_id.clone(),
            expected_version: snapshot.version,
            rating: folded,
            expected_request_status: from,
            review: NewReview {
                business_id: submission.business_id.clone(),
                business_name: reviewed.data.business_name,
                client_id: submission.client_id.clone(),
                client_name: submission.client_name.clone(),
                rating,
                comment: submission.comment.clone(),
                source_request_id: submission.source_request_id,
            },
        };
        let review = self
            .call("commit_review", self.store.commit_review(commit))
            .await?;
        Ok((review, from))
    }

    async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();
        let result = with_timeout(
            Duration::from_millis(self.config.store_timeout_ms),
            operation,
            fut,
        )
        .await;
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.observe_store_call(operation, started.elapsed());
        }
        result
    }
}
