//! Prometheus metrics for the service request core.
//!
//! Transitions and reviews also emit `metrics`-crate counters unconditionally
//! (`handyman_transitions_total`, `handyman_transition_rejected_total`,
//! `handyman_reviews_submitted_total`, `handyman_transaction_conflicts_total`); this
//! module is the registry-backed alternative for services that scrape Prometheus
//! directly.
//!
//! - **Counters**: status changes by edge, rejected actions by reason
//! - **Histograms**: submitted ratings, store call latency

#[cfg(feature = "metrics")]
use prometheus::{CounterVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry};
#[cfg(feature = "metrics")]
use std::time::Duration;

#[cfg(feature = "metrics")]
use crate::domain::business::Rating;
#[cfg(feature = "metrics")]
use crate::domain::request::RequestStatus;
#[cfg(feature = "metrics")]
use crate::error::Result;

/// Prometheus registry wrapper for lifecycle and rating metrics.
#[cfg(feature = "metrics")]
#[derive(Clone)]
pub struct HandymanMetrics {
    registry: Registry,

    status_changes_total: CounterVec,
    rejected_actions_total: CounterVec,

    review_rating: Histogram,
    store_call_duration_seconds: HistogramVec,
}

#[cfg(feature = "metrics")]
impl HandymanMetrics {
    /// Register all metrics with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric is already registered.
    pub fn new(registry: Registry) -> Result<Self> {
        let status_changes_total = CounterVec::new(
            Opts::new(
                "handyman_request_status_changes_total",
                "Committed service request status changes by edge",
            ),
            &["from", "to"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create status_changes_total counter: {}", e))?;

        let rejected_actions_total = CounterVec::new(
            Opts::new(
                "handyman_rejected_actions_total",
                "Lifecycle actions rejected before any write, by reason",
            ),
            &["reason"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create rejected_actions_total counter: {}", e))?;

        let review_rating = Histogram::with_opts(
            HistogramOpts::new("handyman_review_rating", "Ratings of committed reviews")
                .buckets(vec![1.0, 2.0, 3.0, 4.0, 5.0]),
        )
        .map_err(|e| anyhow::anyhow!("Failed to create review_rating histogram: {}", e))?;

        let store_call_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "handyman_store_call_duration_seconds",
                "Store call latency in seconds, including timed-out calls",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["operation"],
        )
        .map_err(|e| {
            anyhow::anyhow!("Failed to create store_call_duration_seconds histogram: {}", e)
        })?;

        registry
            .register(Box::new(status_changes_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register status_changes_total: {}", e))?;
        registry
            .register(Box::new(rejected_actions_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register rejected_actions_total: {}", e))?;
        registry
            .register(Box::new(review_rating.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register review_rating: {}", e))?;
        registry
            .register(Box::new(store_call_duration_seconds.clone()))
            .map_err(|e| {
                anyhow::anyhow!("Failed to register store_call_duration_seconds: {}", e)
            })?;

        Ok(Self {
            registry,
            status_changes_total,
            rejected_actions_total,
            review_rating,
            store_call_duration_seconds,
        })
    }

    /// The underlying registry, for an exporter endpoint.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_status_change(&self, from: RequestStatus, to: RequestStatus) {
        self.status_changes_total
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();
    }

    /// `reason` should be low-cardinality: "invalid_transition", "forbidden", ...
    pub fn record_rejection(&self, reason: &str) {
        self.rejected_actions_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn record_review(&self, rating: Rating) {
        self.review_rating.observe(f64::from(rating.value()));
    }

    pub fn observe_store_call(&self, operation: &str, duration: Duration) {
        self.store_call_duration_seconds
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }
}
