//! Authorized, validated lifecycle operations over a [`RequestStore`].
//!
//! [`RequestLifecycle`] is the only place that decides whether a status change may
//! happen. Each action:
//!
//! 1. reads the request,
//! 2. checks the actor is the party the action belongs to,
//! 3. checks the edge against [`RequestStatus::can_transition_to`],
//! 4. runs the typed transition, which writes status and side fields in one guarded
//!    update.
//!
//! If the guarded write loses a race (`TransactionConflict`) the whole sequence is
//! re-run against a fresh read, so a late action sees the new status and is
//! rejected instead of overwriting it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::request::{
    Action, ActionKind, AnyServiceRequest, PaymentMethod, RequestId, RequestStatus,
    ServiceRequestDraft, available_actions,
};
use crate::domain::{Actor, Party};
use crate::error::{HandymanError, Result};
#[cfg(feature = "metrics")]
use crate::metrics::HandymanMetrics;
use crate::notify::{Notifier, TracingNotifier, report};
use crate::store::{RequestFilter, RequestStore, RequestStream, with_timeout};

/// Configuration for [`RequestLifecycle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Deadline for each store call in milliseconds
    pub store_timeout_ms: u64,

    /// How many times an action is attempted when its guarded write conflicts
    pub max_transition_attempts: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: 10_000,
            max_transition_attempts: 3,
        }
    }
}

/// Service request lifecycle over a store.
pub struct RequestLifecycle<S: RequestStore> {
    store: Arc<S>,
    config: LifecycleConfig,
    notifier: Arc<dyn Notifier>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<HandymanMetrics>>,
}

impl<S: RequestStore> Clone for RequestLifecycle<S> {
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

impl<S: RequestStore> RequestLifecycle<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            config: LifecycleConfig::default(),
            notifier: Arc::new(TracingNotifier),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    pub fn with_config(mut self, config: LifecycleConfig) -> Self {
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

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Submit a new request on behalf of `actor`, who must be the draft's consumer.
    ///
    /// The request always starts `Pending`.
    #[tracing::instrument(skip(self, draft), fields(actor = %actor, business_id = %draft.business_id))]
    pub async fn create_request(
        &self,
        actor: &Actor,
        draft: ServiceRequestDraft,
    ) -> Result<AnyServiceRequest> {
        let result = self.create_inner(actor, draft).await;
        let request_id = result.as_ref().ok().map(AnyServiceRequest::id);
        report(
            self.notifier.as_ref(),
            actor,
            request_id,
            "Service request submitted.",
            &result,
        )
        .await;
        result
    }

    async fn create_inner(
        &self,
        actor: &Actor,
        draft: ServiceRequestDraft,
    ) -> Result<AnyServiceRequest> {
        if !actor.is_user(&draft.user_id) {
            self.reject("forbidden");
            return Err(HandymanError::Forbidden {
                actor: actor.uid().to_string(),
                action: "create a request for another account".to_string(),
            });
        }
        draft.validate()?;

        let user_id = draft.user_id.clone();
        let id = self.call("create", self.store.create(draft)).await?;
        let request = self.call("get", self.store.get(id)).await?;
        // A deduplicated create must resolve to the caller's own request.
        if request.data().user_id != user_id {
            tracing::error!(
                request_id = %id,
                "Idempotency key resolved to another account's request"
            );
            self.reject("forbidden");
            return Err(HandymanError::Forbidden {
                actor: actor.uid().to_string(),
                action: "reuse an idempotency key held by another account".to_string(),
            });
        }
        tracing::info!(request_id = %id, "Service request created");
        Ok(request)
    }

    /// Read one request. Only its consumer and business may see it.
    pub async fn get(&self, actor: &Actor, id: RequestId) -> Result<AnyServiceRequest> {
        let request = self.call("get", self.store.get(id)).await?;
        let data = request.data();
        if !actor.is_user(&data.user_id) && !actor.is_business(&data.business_id) {
            return Err(HandymanError::Forbidden {
                actor: actor.uid().to_string(),
                action: "view this request".to_string(),
            });
        }
        Ok(request)
    }

    /// Requests the actor submitted as a consumer, newest first.
    pub async fn requests_for_user(&self, actor: &Actor) -> Result<Vec<AnyServiceRequest>> {
        let user_id = actor.as_user();
        self.call("query_by_user", self.store.query_by_user(&user_id))
            .await
    }

    /// Requests addressed to the actor's business, newest first.
    pub async fn requests_for_business(&self, actor: &Actor) -> Result<Vec<AnyServiceRequest>> {
        let business_id = actor.as_business();
        self.call(
            "query_by_business",
            self.store.query_by_business(&business_id),
        )
        .await
    }

    /// Live view of the actor's own requests.
    pub fn watch_user(&self, actor: &Actor) -> RequestStream {
        self.store.watch(RequestFilter::for_user(actor.as_user()))
    }

    /// Live view of requests addressed to the actor's business.
    pub fn watch_business(&self, actor: &Actor) -> RequestStream {
        self.store
            .watch(RequestFilter::for_business(actor.as_business()))
    }

    /// Actions `actor` may currently take on `request`.
    pub fn actions_for(&self, actor: &Actor, request: &AnyServiceRequest) -> Vec<ActionKind> {
        let data = request.data();
        let mut actions = Vec::new();
        if actor.is_user(&data.user_id) {
            actions.extend(available_actions(request.status(), Party::Consumer));
        }
        if actor.is_business(&data.business_id) {
            actions.extend(available_actions(request.status(), Party::Business));
        }
        actions
    }

    pub async fn cancel(&self, actor: &Actor, id: RequestId) -> Result<AnyServiceRequest> {
        self.apply(actor, id, Action::Cancel).await
    }

    pub async fn decline(&self, actor: &Actor, id: RequestId) -> Result<AnyServiceRequest> {
        self.apply(actor, id, Action::Decline).await
    }

    pub async fn accept(
        &self,
        actor: &Actor,
        id: RequestId,
        amount: Option<Decimal>,
    ) -> Result<AnyServiceRequest> {
        self.apply(actor, id, Action::Accept { amount }).await
    }

    pub async fn request_payment(
        &self,
        actor: &Actor,
        id: RequestId,
        amount: Option<Decimal>,
    ) -> Result<AnyServiceRequest> {
        self.apply(actor, id, Action::RequestPayment { amount })
            .await
    }

    pub async fn mark_complete(&self, actor: &Actor, id: RequestId) -> Result<AnyServiceRequest> {
        self.apply(actor, id, Action::MarkComplete).await
    }

    pub async fn submit_payment(
        &self,
        actor: &Actor,
        id: RequestId,
        method: PaymentMethod,
    ) -> Result<AnyServiceRequest> {
        self.apply(actor, id, Action::SubmitPayment { method })
            .await
    }

    pub async fn confirm_payment(&self, actor: &Actor, id: RequestId) -> Result<AnyServiceRequest> {
        self.apply(actor, id, Action::ConfirmPayment).await
    }

    /// Apply `action` to request `id` on behalf of `actor` and return the request in
    /// its new state.
    ///
    /// # Errors
    ///
    /// - `RequestNotFound` if the request does not exist
    /// - `Forbidden` if the actor is not the party the action belongs to
    /// - `InvalidTransition` if the current status has no edge to the action's target
    /// - `Validation` if a side field is missing or malformed
    /// - `TransactionConflict` if every attempt lost a race
    /// - `StoreUnavailable` if a store call failed or timed out
    ///
    /// Nothing is written in any error case.
    #[tracing::instrument(skip(self, actor), fields(actor = %actor, request_id = %id, action = %action.kind()))]
    pub async fn apply(
        &self,
        actor: &Actor,
        id: RequestId,
        action: Action,
    ) -> Result<AnyServiceRequest> {
        let result = self.apply_with_retry(actor, id, action).await;
        match &result {
            Err(e @ HandymanError::StoreUnavailable(_)) => {
                tracing::error!(error = %e, "Transition failed: store unavailable");
            }
            Err(e) => tracing::debug!(error = %e, "Transition rejected"),
            Ok(_) => {}
        }
        report(
            self.notifier.as_ref(),
            actor,
            Some(id),
            action.kind().success_message(),
            &result,
        )
        .await;
        result
    }

    async fn apply_with_retry(
        &self,
        actor: &Actor,
        id: RequestId,
        action: Action,
    ) -> Result<AnyServiceRequest> {
        let max_attempts = self.config.max_transition_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.try_apply(actor, id, action).await {
                Err(HandymanError::TransactionConflict(reason)) => {
                    counter!(
                        "handyman_transaction_conflicts_total",
                        "operation" => action.kind().as_str()
                    )
                    .increment(1);
                    if attempt >= max_attempts {
                        tracing::warn!(attempt, reason = %reason, "Transition conflicted, giving up");
                        return Err(HandymanError::TransactionConflict(reason));
                    }
                    tracing::warn!(attempt, reason = %reason, "Transition conflicted, re-reading");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn try_apply(
        &self,
        actor: &Actor,
        id: RequestId,
        action: Action,
    ) -> Result<AnyServiceRequest> {
        let request = self.call("get", self.store.get(id)).await?;
        let kind = action.kind();
        self.authorize(actor, &request, kind)?;

        let from = request.status();
        let to = action.target();
        if !from.can_transition_to(to) {
            self.reject("invalid_transition");
            return Err(HandymanError::InvalidTransition { from, to });
        }

        let updated = self
            .call(
                kind.as_str(),
                dispatch(self.store.as_ref(), request, action),
            )
            .await?;
        self.record_status_change(from, to);
        Ok(updated)
    }

    fn authorize(&self, actor: &Actor, request: &AnyServiceRequest, kind: ActionKind) -> Result<()> {
        let data = request.data();
        let allowed = match kind.party() {
            Party::Consumer => actor.is_user(&data.user_id),
            Party::Business => actor.is_business(&data.business_id),
        };
        if allowed {
            return Ok(());
        }
        self.reject("forbidden");
        Err(HandymanError::Forbidden {
            actor: actor.uid().to_string(),
            action: kind.as_str().to_string(),
        })
    }

    fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.config.store_timeout_ms)
    }

    async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();
        let result = with_timeout(self.store_timeout(), operation, fut).await;
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.observe_store_call(operation, started.elapsed());
        }
        result
    }

    fn reject(&self, reason: &'static str) {
        counter!("handyman_transition_rejected_total", "reason" => reason).increment(1);
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_rejection(reason);
        }
    }

    #[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
    fn record_status_change(&self, from: RequestStatus, to: RequestStatus) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_status_change(from, to);
        }
    }
}

/// Run the typed transition matching `action` on `request`.
async fn dispatch<S: RequestStore + ?Sized>(
    store: &S,
    request: AnyServiceRequest,
    action: Action,
) -> Result<AnyServiceRequest> {
    let updated = match (request, action) {
        (AnyServiceRequest::Pending(r), Action::Cancel) => {
            AnyServiceRequest::from(r.cancel(store).await?)
        }
        (AnyServiceRequest::Pending(r), Action::Decline) => {
            AnyServiceRequest::from(r.decline(store).await?)
        }
        (AnyServiceRequest::Pending(r), Action::Accept { amount }) => {
            AnyServiceRequest::from(r.accept(amount, store).await?)
        }
        (AnyServiceRequest::Accepted(r), Action::RequestPayment { amount }) => {
            AnyServiceRequest::from(r.request_payment(amount, store).await?)
        }
        (AnyServiceRequest::Accepted(r), Action::MarkComplete) => {
            AnyServiceRequest::from(r.mark_complete(store).await?)
        }
        (AnyServiceRequest::PendingPayment(r), Action::SubmitPayment { method }) => {
            AnyServiceRequest::from(r.submit_payment(method, store).await?)
        }
        (AnyServiceRequest::ConfirmingPayment(r), Action::ConfirmPayment) => {
            AnyServiceRequest::from(r.confirm_payment(store).await?)
        }
        (other, action) => {
            return Err(HandymanError::InvalidTransition {
                from: other.status(),
                to: action.target(),
            });
        }
    };
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::business::BusinessId;
    use crate::domain::request::{ServiceKind, UserId};
    use crate::notify::RecordingNotifier;
    use crate::store::memory::{Fault, InMemoryStore};
    use chrono::Utc;

    fn draft() -> ServiceRequestDraft {
        ServiceRequestDraft {
            user_id: UserId::new("consumer-1"),
            user_name: "Ana".to_string(),
            business_id: BusinessId::new("business-1"),
            business_name: "Sparkle Maids".to_string(),
            service: ServiceKind::Category("Maid".to_string()),
            scheduled_at: Utc::now(),
            idempotency_key: None,
        }
    }

    fn setup() -> (RequestLifecycle<InMemoryStore>, InMemoryStore, RecordingNotifier) {
        let store = InMemoryStore::new();
        let notifier = RecordingNotifier::new();
        let lifecycle = RequestLifecycle::new(Arc::new(store.clone()))
            .with_notifier(Arc::new(notifier.clone()));
        (lifecycle, store, notifier)
    }

    fn consumer() -> Actor {
        Actor::new("consumer-1")
    }

    fn business() -> Actor {
        Actor::new("business-1")
    }

    #[tokio::test]
    async fn test_create_starts_pending_and_notifies() {
        let (lifecycle, _store, notifier) = setup();

        let request = lifecycle.create_request(&consumer(), draft()).await.unwrap();
        assert_eq!(request.status(), RequestStatus::Pending);

        let sent = notifier.last().unwrap();
        assert!(sent.success);
        assert_eq!(sent.request_id, Some(request.id()));
    }

    #[tokio::test]
    async fn test_create_for_another_account_is_forbidden() {
        let (lifecycle, store, _) = setup();

        let err = lifecycle
            .create_request(&business(), draft())
            .await
            .unwrap_err();
        assert!(matches!(err, HandymanError::Forbidden { .. }));
        assert!(store.query(RequestFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_consumer_cannot_take_business_actions() {
        let (lifecycle, store, notifier) = setup();
        let id = lifecycle
            .create_request(&consumer(), draft())
            .await
            .unwrap()
            .id();

        let err = lifecycle.accept(&consumer(), id, None).await.unwrap_err();
        assert!(matches!(err, HandymanError::Forbidden { .. }));
        assert!(store.get(id).await.unwrap().is_pending());

        let sent = notifier.last().unwrap();
        assert!(!sent.success);
        assert_eq!(sent.message, err.user_message());
    }

    #[tokio::test]
    async fn test_conflict_is_retried_against_fresh_read() {
        let (lifecycle, store, _) = setup();
        let id = lifecycle
            .create_request(&consumer(), draft())
            .await
            .unwrap()
            .id();

        store.fail_next(Fault::Conflict);
        let accepted = lifecycle.accept(&business(), id, None).await.unwrap();
        assert_eq!(accepted.status(), RequestStatus::Accepted);
    }

    #[tokio::test]
    async fn test_conflict_retries_are_bounded() {
        let (lifecycle, store, _) = setup();
        let lifecycle = lifecycle.with_config(LifecycleConfig {
            max_transition_attempts: 2,
            ..Default::default()
        });
        let id = lifecycle
            .create_request(&consumer(), draft())
            .await
            .unwrap()
            .id();

        store.fail_times(2, Fault::Conflict);
        let err = lifecycle.decline(&business(), id).await.unwrap_err();
        assert!(matches!(err, HandymanError::TransactionConflict(_)));
        assert!(store.get(id).await.unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_actions_for_each_party() {
        let (lifecycle, _store, _) = setup();
        let request = lifecycle.create_request(&consumer(), draft()).await.unwrap();

        assert_eq!(
            lifecycle.actions_for(&consumer(), &request),
            vec![ActionKind::Cancel]
        );
        assert_eq!(
            lifecycle.actions_for(&business(), &request),
            vec![ActionKind::Decline, ActionKind::Accept]
        );
        assert!(
            lifecycle
                .actions_for(&Actor::new("stranger"), &request)
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_get_is_limited_to_parties() {
        let (lifecycle, _store, _) = setup();
        let id = lifecycle
            .create_request(&consumer(), draft())
            .await
            .unwrap()
            .id();

        assert!(lifecycle.get(&consumer(), id).await.is_ok());
        assert!(lifecycle.get(&business(), id).await.is_ok());
        assert!(matches!(
            lifecycle.get(&Actor::new("stranger"), id).await,
            Err(HandymanError::Forbidden { .. })
        ));
    }

    /// Deduplicates idempotency keys across every consumer.
    struct GlobalKeyStore {
        inner: InMemoryStore,
        keys: parking_lot::Mutex<std::collections::HashMap<String, RequestId>>,
    }

    #[async_trait::async_trait]
    impl RequestStore for GlobalKeyStore {
        async fn create(&self, draft: ServiceRequestDraft) -> Result<RequestId> {
            let existing = draft
                .idempotency_key
                .as_ref()
                .and_then(|key| self.keys.lock().get(key).copied());
            if let Some(id) = existing {
                return Ok(id);
            }
            let key = draft.idempotency_key.clone();
            let id = self.inner.create(draft).await?;
            if let Some(key) = key {
                self.keys.lock().insert(key, id);
            }
            Ok(id)
        }

        async fn get(&self, id: RequestId) -> Result<AnyServiceRequest> {
            self.inner.get(id).await
        }

        async fn query(&self, filter: RequestFilter) -> Result<Vec<AnyServiceRequest>> {
            self.inner.query(filter).await
        }

        async fn update_status(
            &self,
            id: RequestId,
            update: crate::store::StatusUpdate,
        ) -> Result<()> {
            self.inner.update_status(id, update).await
        }

        fn watch(&self, filter: RequestFilter) -> RequestStream {
            self.inner.watch(filter)
        }
    }

    #[tokio::test]
    async fn test_create_never_hands_out_another_accounts_request() {
        let notifier = RecordingNotifier::new();
        let lifecycle = RequestLifecycle::new(Arc::new(GlobalKeyStore {
            inner: InMemoryStore::new(),
            keys: parking_lot::Mutex::new(Default::default()),
        }))
        .with_notifier(Arc::new(notifier.clone()));

        let keyed = ServiceRequestDraft {
            idempotency_key: Some("checkout-1".to_string()),
            ..draft()
        };
        lifecycle
            .create_request(&consumer(), keyed.clone())
            .await
            .unwrap();

        let other = Actor::new("consumer-2");
        let err = lifecycle
            .create_request(
                &other,
                ServiceRequestDraft {
                    user_id: UserId::new("consumer-2"),
                    ..keyed
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HandymanError::Forbidden { .. }));
        assert!(!notifier.last().unwrap().success);
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: LifecycleConfig =
            serde_json::from_str(r#"{"store_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.store_timeout_ms, 250);
        assert_eq!(config.max_transition_attempts, 3);
    }
}
