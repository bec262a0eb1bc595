use chrono::Utc;
use handyman::domain::request::ServiceRequestRecord;
use handyman::store::memory::Fault;
use handyman::{
    Action, Actor, AnyServiceRequest, BusinessId, BusinessStore, HandymanError, InMemoryStore,
    LifecycleConfig, NewBusiness, PaymentMethod, RatingAggregator, RecordingNotifier, RequestId,
    RequestLifecycle, RequestStatus, RequestStore, ReviewSubmission, ServiceKind,
    ServiceRequestDraft, UserId,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

fn consumer() -> Actor {
    Actor::new("U1")
}

fn business() -> Actor {
    Actor::new("B1")
}

fn draft() -> ServiceRequestDraft {
    ServiceRequestDraft {
        user_id: UserId::new("U1"),
        user_name: "Ana Reyes".to_string(),
        business_id: BusinessId::new("B1"),
        business_name: "Sparkle Maids".to_string(),
        service: ServiceKind::Category("Maid".to_string()),
        scheduled_at: Utc::now(),
        idempotency_key: None,
    }
}

/// Store a request directly in `status`, with every side field any status needs.
fn seed(store: &InMemoryStore, status: RequestStatus) -> RequestId {
    let id = RequestId(uuid::Uuid::new_v4());
    let mut record = ServiceRequestRecord::new_pending(id, &draft(), Utc::now());
    record.status = status.as_str().to_string();
    record.amount = Some(Decimal::new(50, 0));
    record.payment_method = Some("card".to_string());
    store.insert_raw(record).expect("Failed to seed request")
}

fn actor_for(action: &Action) -> Actor {
    match action.party() {
        handyman::Party::Consumer => consumer(),
        handyman::Party::Business => business(),
    }
}

fn all_actions() -> Vec<Action> {
    vec![
        Action::Cancel,
        Action::Decline,
        Action::Accept {
            amount: Some(Decimal::new(50, 0)),
        },
        Action::RequestPayment {
            amount: Some(Decimal::new(50, 0)),
        },
        Action::MarkComplete,
        Action::SubmitPayment {
            method: PaymentMethod::Card,
        },
        Action::ConfirmPayment,
    ]
}

#[test_log::test(tokio::test)]
async fn test_full_payment_scenario_ends_reviewed() {
    let store = Arc::new(InMemoryStore::new());
    store
        .upgrade_to_business(NewBusiness {
            uid: BusinessId::new("B1"),
            business_name: "Sparkle Maids".to_string(),
            manager_name: Some("Dana".to_string()),
            contact_email: None,
            contact_phone: None,
            location: None,
            services: vec!["Maid".to_string()],
        })
        .await
        .unwrap();
    let lifecycle = RequestLifecycle::new(store.clone());
    let aggregator = RatingAggregator::new(store.clone());

    let request = lifecycle.create_request(&consumer(), draft()).await.unwrap();
    assert_eq!(request.status(), RequestStatus::Pending);
    let id = request.id();

    let accepted = lifecycle
        .accept(&business(), id, Some(Decimal::new(500, 1)))
        .await
        .unwrap();
    assert_eq!(accepted.status(), RequestStatus::Accepted);
    assert_eq!(accepted.amount(), Some(Decimal::new(50, 0)));

    let pending_payment = lifecycle.request_payment(&business(), id, None).await.unwrap();
    assert_eq!(pending_payment.status(), RequestStatus::PendingPayment);

    let confirming = lifecycle
        .submit_payment(&consumer(), id, PaymentMethod::Card)
        .await
        .unwrap();
    assert_eq!(confirming.status(), RequestStatus::ConfirmingPayment);

    let done = lifecycle.confirm_payment(&business(), id).await.unwrap();
    assert_eq!(done.status(), RequestStatus::ReserviceAccomplished);

    let review = aggregator
        .submit_review(
            &consumer(),
            ReviewSubmission {
                business_id: BusinessId::new("B1"),
                client_id: UserId::new("U1"),
                client_name: "Ana Reyes".to_string(),
                rating: 4,
                comment: "Spotless".to_string(),
                source_request_id: id,
            },
        )
        .await
        .unwrap();
    assert_eq!(review.business_name, "Sparkle Maids");

    let stored = store.get(id).await.unwrap();
    assert_eq!(stored.status(), RequestStatus::Reviewed);
    assert_eq!(stored.amount(), Some(Decimal::new(50, 0)));
    assert_eq!(stored.payment_method(), Some(PaymentMethod::Card));

    let business = store.get_business(&BusinessId::new("B1")).await.unwrap();
    assert_eq!(business.rating_count, 1);
    assert_eq!(business.average_rating, 4.0);
}

#[test_log::test(tokio::test)]
async fn test_complete_without_payment_path() {
    let store = Arc::new(InMemoryStore::new());
    let lifecycle = RequestLifecycle::new(store.clone());
    let id = lifecycle
        .create_request(&consumer(), draft())
        .await
        .unwrap()
        .id();

    lifecycle.accept(&business(), id, None).await.unwrap();
    let completed = lifecycle.mark_complete(&business(), id).await.unwrap();
    assert_eq!(completed.status(), RequestStatus::Completed);
    assert_eq!(completed.amount(), None);
}

#[test_log::test(tokio::test)]
async fn test_every_untabled_transition_is_rejected_without_writing() {
    let store = Arc::new(InMemoryStore::new());
    let lifecycle = RequestLifecycle::new(store.clone());

    let mut checked = 0;
    for from in RequestStatus::ALL {
        for action in all_actions() {
            let to = action.target();
            if from.can_transition_to(to) {
                continue;
            }
            let id = seed(&store, from);
            let before = store.raw_record(id).unwrap();

            let err = lifecycle
                .apply(&actor_for(&action), id, action)
                .await
                .unwrap_err();
            match err {
                HandymanError::InvalidTransition {
                    from: got_from,
                    to: got_to,
                } => {
                    assert_eq!(got_from, from);
                    assert_eq!(got_to, to);
                }
                other => panic!("{} -> {}: expected InvalidTransition, got {:?}", from, to, other),
            }
            assert_eq!(store.raw_record(id).unwrap(), before, "{} -> {} wrote", from, to);
            checked += 1;
        }
    }
    // 10 statuses x 7 actions, minus the 7 lifecycle edges reachable through actions
    assert_eq!(checked, 63);
}

#[test_log::test(tokio::test)]
async fn test_cancel_after_terminal_state_fails() {
    let store = Arc::new(InMemoryStore::new());
    let lifecycle = RequestLifecycle::new(store.clone());

    for terminal in [
        RequestStatus::Cancelled,
        RequestStatus::Declined,
        RequestStatus::Reviewed,
    ] {
        let id = seed(&store, terminal);
        let err = lifecycle.cancel(&consumer(), id).await.unwrap_err();
        assert!(matches!(err, HandymanError::InvalidTransition { .. }));
        assert_eq!(store.get(id).await.unwrap().status(), terminal);
    }
}

#[test_log::test(tokio::test)]
async fn test_missing_request_is_not_found() {
    let lifecycle = RequestLifecycle::new(Arc::new(InMemoryStore::new()));
    let missing = RequestId(uuid::Uuid::new_v4());

    let err = lifecycle.cancel(&consumer(), missing).await.unwrap_err();
    assert!(matches!(err, HandymanError::RequestNotFound(id) if id == missing));
}

#[test_log::test(tokio::test)]
async fn test_wrong_party_is_forbidden_and_not_written() {
    let store = Arc::new(InMemoryStore::new());
    let notifier = RecordingNotifier::new();
    let lifecycle =
        RequestLifecycle::new(store.clone()).with_notifier(Arc::new(notifier.clone()));
    let id = seed(&store, RequestStatus::Pending);

    // The consumer cannot decline their own request, the business cannot cancel it.
    assert!(matches!(
        lifecycle.decline(&consumer(), id).await,
        Err(HandymanError::Forbidden { .. })
    ));
    assert!(matches!(
        lifecycle.cancel(&business(), id).await,
        Err(HandymanError::Forbidden { .. })
    ));
    assert!(matches!(
        lifecycle.cancel(&Actor::new("stranger"), id).await,
        Err(HandymanError::Forbidden { .. })
    ));
    assert!(store.get(id).await.unwrap().is_pending());
    assert!(notifier.notifications().iter().all(|n| !n.success));
}

#[test_log::test(tokio::test)]
async fn test_missing_payment_amount_is_validation_error() {
    let store = Arc::new(InMemoryStore::new());
    let lifecycle = RequestLifecycle::new(store.clone());
    let id = lifecycle
        .create_request(&consumer(), draft())
        .await
        .unwrap()
        .id();
    lifecycle.accept(&business(), id, None).await.unwrap();

    let err = lifecycle
        .request_payment(&business(), id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, HandymanError::Validation(_)));
    assert_eq!(store.get(id).await.unwrap().status(), RequestStatus::Accepted);

    let err = lifecycle
        .request_payment(&business(), id, Some(Decimal::new(-5, 0)))
        .await
        .unwrap_err();
    assert!(matches!(err, HandymanError::Validation(_)));

    // Sub-cent amounts would round differently per backend.
    let err = lifecycle
        .request_payment(&business(), id, Some(Decimal::new(12_345, 3)))
        .await
        .unwrap_err();
    assert!(matches!(err, HandymanError::Validation(_)));
    assert_eq!(store.get(id).await.unwrap().amount(), None);
}

#[test_log::test(tokio::test)]
async fn test_store_outage_leaves_request_untouched() {
    let store = Arc::new(InMemoryStore::new());
    let lifecycle = RequestLifecycle::new(store.clone());
    let id = seed(&store, RequestStatus::PendingPayment);
    let before = store.raw_record(id).unwrap();

    store.fail_next(Fault::Unavailable);
    let err = lifecycle
        .submit_payment(&consumer(), id, PaymentMethod::Wallet)
        .await
        .unwrap_err();
    assert!(matches!(err, HandymanError::StoreUnavailable(_)));
    assert!(err.is_retryable());
    assert_eq!(store.raw_record(id).unwrap(), before);

    // The same call goes through once the store is back.
    let confirming = lifecycle
        .submit_payment(&consumer(), id, PaymentMethod::Wallet)
        .await
        .unwrap();
    assert_eq!(confirming.payment_method(), Some(PaymentMethod::Wallet));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_slow_store_times_out() {
    let store = Arc::new(InMemoryStore::new().with_latency(Duration::from_secs(30)));
    let lifecycle = RequestLifecycle::new(store.clone()).with_config(LifecycleConfig {
        store_timeout_ms: 500,
        ..Default::default()
    });
    let id = seed(&store, RequestStatus::Pending);

    let err = lifecycle.accept(&business(), id, None).await.unwrap_err();
    assert!(matches!(err, HandymanError::StoreUnavailable(_)));
    assert_eq!(store.raw_record(id).unwrap().status, "Pending");
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_racing_accept_and_cancel_has_one_winner() {
    for _ in 0..20 {
        let store = Arc::new(InMemoryStore::new());
        let lifecycle = RequestLifecycle::new(store.clone());
        let id = seed(&store, RequestStatus::Pending);

        let accept = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.accept(&business(), id, None).await })
        };
        let cancel = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.cancel(&consumer(), id).await })
        };
        let accepted = accept.await.unwrap();
        let cancelled = cancel.await.unwrap();

        let winner: Vec<&AnyServiceRequest> = [&accepted, &cancelled]
            .into_iter()
            .filter_map(|r| r.as_ref().ok())
            .collect();
        assert_eq!(winner.len(), 1, "exactly one action may commit");

        let stored = store.get(id).await.unwrap().status();
        assert_eq!(stored, winner[0].status());
        for loser in [&accepted, &cancelled].into_iter().filter_map(|r| r.as_ref().err()) {
            assert!(
                matches!(
                    loser,
                    HandymanError::InvalidTransition { .. } | HandymanError::TransactionConflict(_)
                ),
                "unexpected loser error: {:?}",
                loser
            );
        }
    }
}

#[test_log::test(tokio::test)]
async fn test_idempotent_creation() {
    let store = Arc::new(InMemoryStore::new());
    let lifecycle = RequestLifecycle::new(store.clone());
    let keyed = ServiceRequestDraft {
        idempotency_key: Some("checkout-7f3a".to_string()),
        ..draft()
    };

    let first = lifecycle
        .create_request(&consumer(), keyed.clone())
        .await
        .unwrap();
    let second = lifecycle.create_request(&consumer(), keyed).await.unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(lifecycle.requests_for_user(&consumer()).await.unwrap().len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_shared_idempotency_key_across_consumers() {
    let store = Arc::new(InMemoryStore::new());
    let lifecycle = RequestLifecycle::new(store.clone());
    let alice = Actor::new("alice");
    let bob = Actor::new("bob");
    let keyed = |user: &str| ServiceRequestDraft {
        user_id: UserId::new(user),
        idempotency_key: Some("checkout-1".to_string()),
        ..draft()
    };

    let alices = lifecycle.create_request(&alice, keyed("alice")).await.unwrap();
    let bobs = lifecycle.create_request(&bob, keyed("bob")).await.unwrap();

    assert_ne!(alices.id(), bobs.id());
    assert_eq!(bobs.data().user_id, UserId::new("bob"));
    assert_eq!(lifecycle.requests_for_user(&bob).await.unwrap().len(), 1);
    assert_eq!(lifecycle.requests_for_user(&alice).await.unwrap().len(), 1);
    assert!(matches!(
        lifecycle.get(&bob, alices.id()).await,
        Err(HandymanError::Forbidden { .. })
    ));
}

#[test_log::test(tokio::test)]
async fn test_listings_are_newest_first_per_party() {
    let store = Arc::new(InMemoryStore::new());
    let lifecycle = RequestLifecycle::new(store.clone());

    let older = lifecycle
        .create_request(&consumer(), draft())
        .await
        .unwrap()
        .id();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let newer = lifecycle
        .create_request(&consumer(), draft())
        .await
        .unwrap()
        .id();
    lifecycle
        .create_request(
            &Actor::new("U2"),
            ServiceRequestDraft {
                user_id: UserId::new("U2"),
                ..draft()
            },
        )
        .await
        .unwrap();

    let mine: Vec<RequestId> = lifecycle
        .requests_for_user(&consumer())
        .await
        .unwrap()
        .iter()
        .map(AnyServiceRequest::id)
        .collect();
    assert_eq!(mine, vec![newer, older]);

    let incoming = lifecycle.requests_for_business(&business()).await.unwrap();
    assert_eq!(incoming.len(), 3);
}
