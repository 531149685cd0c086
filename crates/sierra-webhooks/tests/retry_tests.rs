//! Integration tests for the retry path.

mod common;

use std::sync::Arc;

use common::*;
use sierra_core::OrganizationId;
use sierra_webhooks::models::RecordOutcome;
use sierra_webhooks::{AttemptOutcome, DeliveryNotification, DeliveryStatus, InMemoryStore};
use wiremock::MockServer;

#[tokio::test]
async fn test_first_attempt_success() {
    let server = MockServer::start().await;
    mount(&server, CaptureResponder::default()).await;

    let store = Arc::new(InMemoryStore::new());
    let engine = build_engine(&store, fast_config());
    let org = OrganizationId::new();
    store.put_destination(destination_for(&server, org)).await;
    let mut notifications = engine.notifier().subscribe();

    let attempt_id = send_one(&engine, org).await;
    let outcomes = drive(&engine, attempt_id).await;

    assert_eq!(
        outcomes,
        vec![AttemptOutcome::Succeeded {
            attempt_number: 1,
            http_status: 200
        }]
    );

    let attempt = store.attempt(attempt_id).await.unwrap();
    assert_eq!(attempt.status, DeliveryStatus::Success);
    assert_eq!(attempt.attempt_number, 1);
    assert_eq!(attempt.http_status, Some(200));
    assert_eq!(attempt.response_excerpt.as_deref(), Some("ok"));
    assert!(attempt.next_attempt_at.is_none());
    assert!(!engine.queue().contains(attempt_id));

    let records = store.records(attempt_id).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, RecordOutcome::Success);

    match notifications.recv().await.unwrap() {
        DeliveryNotification::WebhookSuccess {
            attempt_id: id,
            attempt_number,
            ..
        } => {
            assert_eq!(id, attempt_id);
            assert_eq!(attempt_number, 1);
        }
        other => panic!("unexpected notification: {other:?}"),
    }
}

#[tokio::test]
async fn test_fail_twice_then_succeed() {
    let server = MockServer::start().await;
    let responder = FailingResponder::fail_times(2);
    mount(&server, responder.clone()).await;

    let store = Arc::new(InMemoryStore::new());
    let engine = build_engine(&store, fast_config());
    let org = OrganizationId::new();
    store
        .put_destination(destination_for(&server, org).with_max_attempts(3))
        .await;

    let attempt_id = send_one(&engine, org).await;
    let outcomes = drive(&engine, attempt_id).await;

    assert_eq!(outcomes.len(), 3);
    assert!(matches!(
        outcomes[0],
        AttemptOutcome::Retrying { attempt_number: 2, .. }
    ));
    assert!(matches!(
        outcomes[1],
        AttemptOutcome::Retrying { attempt_number: 3, .. }
    ));
    assert_eq!(
        outcomes[2],
        AttemptOutcome::Succeeded {
            attempt_number: 3,
            http_status: 200
        }
    );
    assert_eq!(responder.calls(), 3);

    let attempt = store.attempt(attempt_id).await.unwrap();
    assert_eq!(attempt.status, DeliveryStatus::Success);
    assert_eq!(attempt.attempt_number, 3);

    let records = store.records(attempt_id).await;
    let numbers: Vec<u32> = records.iter().map(|r| r.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(records[0].http_status, Some(503));
    assert_eq!(records[2].outcome, RecordOutcome::Success);
}

/// maxAttempts=3, delays [1, 5, 25] s: fail, fail, succeed.
#[tokio::test]
async fn test_backoff_schedule_with_jitter() {
    let server = MockServer::start().await;
    mount(&server, FailingResponder::fail_times(2)).await;

    let store = Arc::new(InMemoryStore::new());
    let mut config = fast_config();
    config.delivery.jitter_ratio = 0.25;
    let engine = build_engine(&store, config);
    let org = OrganizationId::new();
    store
        .put_destination(
            destination_for(&server, org)
                .with_max_attempts(3)
                .with_retry_delays_secs(vec![1, 5, 25]),
        )
        .await;

    let attempt_id = send_one(&engine, org).await;
    let outcomes = drive(&engine, attempt_id).await;
    assert!(matches!(
        outcomes.last().unwrap(),
        AttemptOutcome::Succeeded { attempt_number: 3, .. }
    ));

    let records = store.records(attempt_id).await;
    let offsets_ms: Vec<i64> = records[..2]
        .iter()
        .map(|r| (r.next_attempt_at.unwrap() - r.recorded_at).num_milliseconds())
        .collect();

    assert!((750..=1250).contains(&offsets_ms[0]), "first delay {}", offsets_ms[0]);
    assert!((3750..=6250).contains(&offsets_ms[1]), "second delay {}", offsets_ms[1]);
    assert!(records[2].next_attempt_at.is_none());
}

#[tokio::test]
async fn test_retry_is_requeued_until_terminal() {
    let server = MockServer::start().await;
    mount(&server, FailingResponder::fail_times(1)).await;

    let store = Arc::new(InMemoryStore::new());
    let engine = build_engine(&store, fast_config());
    let org = OrganizationId::new();
    store
        .put_destination(destination_for(&server, org).with_max_attempts(2))
        .await;

    let attempt_id = send_one(&engine, org).await;
    assert!(engine.queue().contains(attempt_id));

    let first = engine.executor().execute(attempt_id).await.unwrap();
    assert!(matches!(first, AttemptOutcome::Retrying { .. }));
    assert!(engine.queue().contains(attempt_id));
    assert!(store.attempt(attempt_id).await.unwrap().is_pending());

    let second = engine.executor().execute(attempt_id).await.unwrap();
    assert!(second.is_terminal());
    assert!(!engine.queue().contains(attempt_id));

    // A stale queue entry for a finished attempt is discarded.
    let again = engine.executor().execute(attempt_id).await.unwrap();
    assert_eq!(again, AttemptOutcome::Skipped);
    assert_eq!(store.records(attempt_id).await.len(), 2);
}
