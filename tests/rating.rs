use chrono::Utc;
use handyman::domain::request::ServiceRequestRecord;
use handyman::store::memory::Fault;
use handyman::{
    Actor, BusinessId, BusinessProfiles, BusinessStore, HandymanError, InMemoryStore,
    NewBusiness, RatingAggregator, RatingConfig, RequestId, RequestLifecycle, RequestStatus,
    RequestStore, ReviewSubmission, ServiceKind, ServiceRequestDraft, UserId,
};
use rust_decimal::Decimal;
use std::sync::Arc;

const BUSINESS: &str = "biz-handy";

async fn setup() -> (Arc<InMemoryStore>, RequestLifecycle<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    BusinessProfiles::new(store.clone())
        .upgrade(
            &Actor::new(BUSINESS),
            NewBusiness {
                uid: BusinessId::new(BUSINESS),
                business_name: "Handy Helpers".to_string(),
                manager_name: None,
                contact_email: None,
                contact_phone: None,
                location: None,
                services: vec!["Home Repair".to_string(), "Painting".to_string()],
            },
        )
        .await
        .unwrap();
    let lifecycle = RequestLifecycle::new(store.clone());
    (store, lifecycle)
}

/// Create a request for `client` and drive it to `Completed`.
async fn completed_request(lifecycle: &RequestLifecycle<InMemoryStore>, client: &str) -> RequestId {
    let id = lifecycle
        .create_request(
            &Actor::new(client),
            ServiceRequestDraft {
                user_id: UserId::new(client),
                user_name: client.to_string(),
                business_id: BusinessId::new(BUSINESS),
                business_name: "Handy Helpers".to_string(),
                service: ServiceKind::Custom("Fix the fence".to_string()),
                scheduled_at: Utc::now(),
                idempotency_key: None,
            },
        )
        .await
        .unwrap()
        .id();
    let business = Actor::new(BUSINESS);
    lifecycle.accept(&business, id, None).await.unwrap();
    lifecycle.mark_complete(&business, id).await.unwrap();
    id
}

fn submission(request_id: RequestId, client: &str, rating: i64) -> ReviewSubmission {
    ReviewSubmission {
        business_id: BusinessId::new(BUSINESS),
        client_id: UserId::new(client),
        client_name: client.to_string(),
        rating,
        comment: String::new(),
        source_request_id: request_id,
    }
}

#[test_log::test(tokio::test)]
async fn test_new_rating_folds_into_existing_average() {
    let (store, lifecycle) = setup().await;
    let aggregator = RatingAggregator::new(store.clone());

    for client in ["c1", "c2", "c3"] {
        let id = completed_request(&lifecycle, client).await;
        aggregator
            .submit_review(&Actor::new(client), submission(id, client, 4))
            .await
            .unwrap();
    }
    let business = store.get_business(&BusinessId::new(BUSINESS)).await.unwrap();
    assert_eq!(business.rating_count, 3);
    assert_eq!(business.average_rating, 4.0);

    let id = completed_request(&lifecycle, "c4").await;
    aggregator
        .submit_review(&Actor::new("c4"), submission(id, "c4", 2))
        .await
        .unwrap();

    let business = store.get_business(&BusinessId::new(BUSINESS)).await.unwrap();
    assert_eq!(business.rating_count, 4);
    assert!((business.average_rating - 3.5).abs() < 1e-9);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_reviews_average_to_the_mean() {
    let (store, lifecycle) = setup().await;
    let aggregator = RatingAggregator::new(store.clone()).with_config(RatingConfig {
        max_attempts: 100,
        backoff_ms: 1,
        ..Default::default()
    });

    let ratings: Vec<i64> = vec![5, 3, 4, 1, 2, 5, 5, 4, 3, 2, 1, 4, 5, 3, 2, 4];
    let mut requests = Vec::new();
    for (n, rating) in ratings.iter().enumerate() {
        let client = format!("client-{}", n);
        let id = completed_request(&lifecycle, &client).await;
        requests.push((client, id, *rating));
    }

    let handles: Vec<_> = requests
        .into_iter()
        .map(|(client, id, rating)| {
            let aggregator = aggregator.clone();
            tokio::spawn(async move {
                aggregator
                    .submit_review(&Actor::new(client.clone()), submission(id, &client, rating))
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().expect("review should commit");
    }

    let business = store.get_business(&BusinessId::new(BUSINESS)).await.unwrap();
    let mean = ratings.iter().sum::<i64>() as f64 / ratings.len() as f64;
    assert_eq!(business.rating_count as usize, ratings.len());
    assert!(
        (business.average_rating - mean).abs() < 1e-9,
        "average {} != mean {}",
        business.average_rating,
        mean
    );
    assert_eq!(store.review_count(), ratings.len());
}

#[test_log::test(tokio::test)]
async fn test_failed_commit_has_no_visible_effect() {
    let (store, lifecycle) = setup().await;
    let aggregator = RatingAggregator::new(store.clone());
    let id = completed_request(&lifecycle, "c1").await;
    let before = store.get_business(&BusinessId::new(BUSINESS)).await.unwrap();

    store.fail_next(Fault::Unavailable);
    let err = aggregator
        .submit_review(&Actor::new("c1"), submission(id, "c1", 5))
        .await
        .unwrap_err();
    assert!(matches!(err, HandymanError::StoreUnavailable(_)));

    assert_eq!(store.review_count(), 0);
    assert_eq!(
        store.get_business(&BusinessId::new(BUSINESS)).await.unwrap(),
        before
    );
    assert_eq!(store.get(id).await.unwrap().status(), RequestStatus::Completed);
}

#[test_log::test(tokio::test)]
async fn test_review_requires_a_finished_request() {
    let (store, lifecycle) = setup().await;
    let aggregator = RatingAggregator::new(store.clone());

    let id = lifecycle
        .create_request(
            &Actor::new("c1"),
            ServiceRequestDraft {
                user_id: UserId::new("c1"),
                user_name: "c1".to_string(),
                business_id: BusinessId::new(BUSINESS),
                business_name: "Handy Helpers".to_string(),
                service: ServiceKind::Category("Painting".to_string()),
                scheduled_at: Utc::now(),
                idempotency_key: None,
            },
        )
        .await
        .unwrap()
        .id();

    let err = aggregator
        .submit_review(&Actor::new("c1"), submission(id, "c1", 5))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HandymanError::InvalidTransition {
            from: RequestStatus::Pending,
            to: RequestStatus::Reviewed
        }
    ));
    assert_eq!(store.review_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_review_from_every_unreviewable_status_writes_nothing() {
    let (store, _lifecycle) = setup().await;
    let aggregator = RatingAggregator::new(store.clone());
    let business_before = store.get_business(&BusinessId::new(BUSINESS)).await.unwrap();

    let mut checked = Vec::new();
    for from in RequestStatus::ALL {
        if from.can_transition_to(RequestStatus::Reviewed) {
            continue;
        }
        let id = RequestId(uuid::Uuid::new_v4());
        let draft = ServiceRequestDraft {
            user_id: UserId::new("c1"),
            user_name: "c1".to_string(),
            business_id: BusinessId::new(BUSINESS),
            business_name: "Handy Helpers".to_string(),
            service: ServiceKind::Category("Painting".to_string()),
            scheduled_at: Utc::now(),
            idempotency_key: None,
        };
        let mut record = ServiceRequestRecord::new_pending(id, &draft, Utc::now());
        record.status = from.as_str().to_string();
        record.amount = Some(Decimal::new(80, 0));
        record.payment_method = Some("cash".to_string());
        store.insert_raw(record).unwrap();
        let before = store.raw_record(id).unwrap();

        let err = aggregator
            .submit_review(&Actor::new("c1"), submission(id, "c1", 5))
            .await
            .unwrap_err();
        match err {
            HandymanError::InvalidTransition { from: got, to } => {
                assert_eq!(got, from);
                assert_eq!(to, RequestStatus::Reviewed);
            }
            other => panic!("{}: expected InvalidTransition, got {:?}", from, other),
        }
        assert_eq!(store.raw_record(id).unwrap(), before, "{} was rewritten", from);
        checked.push(from);
    }

    assert_eq!(
        checked,
        vec![
            RequestStatus::Pending,
            RequestStatus::Accepted,
            RequestStatus::Declined,
            RequestStatus::Cancelled,
            RequestStatus::PendingPayment,
            RequestStatus::ConfirmingPayment,
            RequestStatus::Paid,
            RequestStatus::Reviewed,
        ]
    );
    assert_eq!(store.review_count(), 0);
    assert_eq!(
        store.get_business(&BusinessId::new(BUSINESS)).await.unwrap(),
        business_before
    );
}

#[test_log::test(tokio::test)]
async fn test_review_for_wrong_business_is_rejected() {
    let (store, lifecycle) = setup().await;
    let aggregator = RatingAggregator::new(store.clone());
    let id = completed_request(&lifecycle, "c1").await;

    let err = aggregator
        .submit_review(
            &Actor::new("c1"),
            ReviewSubmission {
                business_id: BusinessId::new("another-biz"),
                ..submission(id, "c1", 5)
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HandymanError::Validation(_)));
    assert_eq!(store.review_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_reviews_listed_newest_first() {
    let (store, lifecycle) = setup().await;
    let aggregator = RatingAggregator::new(store.clone());
    let profiles = BusinessProfiles::new(store.clone());

    for (client, rating) in [("c1", 3), ("c2", 5)] {
        let id = completed_request(&lifecycle, client).await;
        aggregator
            .submit_review(&Actor::new(client), submission(id, client, rating))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let reviews = profiles.reviews(&BusinessId::new(BUSINESS)).await.unwrap();
    let clients: Vec<&str> = reviews.iter().map(|r| r.client_id.as_str()).collect();
    assert_eq!(clients, vec!["c2", "c1"]);
}
