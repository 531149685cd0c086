//! Integration tests for terminal failures.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use sierra_core::OrganizationId;
use sierra_webhooks::models::RecordOutcome;
use sierra_webhooks::{
    AttemptOutcome, CircuitBreakerConfig, DeliveryError, DeliveryNotification, DeliveryStatus,
    InMemoryStore,
};
use wiremock::MockServer;

#[tokio::test]
async fn test_always_failing_endpoint_records_every_try() {
    let server = MockServer::start().await;
    let responder = CountingResponder::new(500);
    mount(&server, responder.clone()).await;

    let store = Arc::new(InMemoryStore::new());
    let engine = build_engine(&store, fast_config());
    let org = OrganizationId::new();
    store
        .put_destination(destination_for(&server, org).with_max_attempts(4))
        .await;

    let attempt_id = send_one(&engine, org).await;
    let outcomes = drive(&engine, attempt_id).await;

    assert_eq!(outcomes.len(), 4);
    match outcomes.last().unwrap() {
        AttemptOutcome::Failed {
            total_attempts,
            error,
        } => {
            assert_eq!(*total_attempts, 4);
            assert_eq!(error.http_status(), Some(500));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(responder.calls(), 4);

    let records = store.records(attempt_id).await;
    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|r| r.outcome == RecordOutcome::Failed));
    assert!(records.iter().all(|r| r.http_status == Some(500)));

    let attempt = store.attempt(attempt_id).await.unwrap();
    assert_eq!(attempt.status, DeliveryStatus::Failed);
    assert_eq!(attempt.attempt_number, 4);
    assert_eq!(attempt.response_excerpt.as_deref(), Some("upstream says no"));
    assert!(attempt.next_attempt_at.is_none());

    let metrics = engine
        .metrics()
        .daily(org, chrono::Utc::now().date_naive())
        .await;
    assert_eq!(metrics.total, 4);
    assert_eq!(metrics.failed, 4);
}

/// A slow endpoint within the destination timeout succeeds even when the
/// breaker-wide timeout is shorter.
#[tokio::test]
async fn test_destination_timeout_bounds_the_request() {
    let server = MockServer::start().await;
    mount(&server, DelayedResponder::new(Duration::from_millis(400))).await;

    let store = Arc::new(InMemoryStore::new());
    let config = fast_config().with_circuit_breaker(
        CircuitBreakerConfig::default().with_timeout(Duration::from_millis(100)),
    );
    let engine = build_engine(&store, config);
    let org = OrganizationId::new();
    store
        .put_destination(destination_for(&server, org).with_timeout_ms(5000))
        .await;

    let attempt_id = send_one(&engine, org).await;
    let outcomes = drive(&engine, attempt_id).await;

    assert_eq!(
        outcomes,
        vec![AttemptOutcome::Succeeded {
            attempt_number: 1,
            http_status: 200
        }]
    );
    let breaker = engine.registry().get(&breaker_name(&server)).await.unwrap();
    assert_eq!(breaker.stats().timeouts, 0);
}

/// Endpoint always times out with maxAttempts=2.
#[tokio::test]
async fn test_timeouts_exhaust_attempts() {
    let server = MockServer::start().await;
    mount(&server, DelayedResponder::new(Duration::from_secs(2))).await;

    let store = Arc::new(InMemoryStore::new());
    let engine = build_engine(&store, fast_config());
    let org = OrganizationId::new();
    store
        .put_destination(
            destination_for(&server, org)
                .with_max_attempts(2)
                .with_timeout_ms(100),
        )
        .await;
    let mut notifications = engine.notifier().subscribe();

    let attempt_id = send_one(&engine, org).await;
    let outcomes = drive(&engine, attempt_id).await;

    assert_eq!(outcomes.len(), 2);
    match &outcomes[1] {
        AttemptOutcome::Failed {
            total_attempts,
            error,
        } => {
            assert_eq!(*total_attempts, 2);
            assert!(matches!(error, DeliveryError::Timeout { .. }));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(!engine.queue().contains(attempt_id));
    assert!(engine.queue().is_empty());

    let failed = loop {
        match notifications.recv().await.unwrap() {
            DeliveryNotification::WebhookFailed { total_attempts, .. } => break total_attempts,
            _ => continue,
        }
    };
    assert_eq!(failed, 2);
}

#[tokio::test]
async fn test_deleted_destination_fails_without_retry() {
    let server = MockServer::start().await;
    let responder = CountingResponder::new(200);
    mount(&server, responder.clone()).await;

    let store = Arc::new(InMemoryStore::new());
    let engine = build_engine(&store, fast_config());
    let org = OrganizationId::new();
    let destination = destination_for(&server, org).with_max_attempts(5);
    let destination_id = destination.id;
    store.put_destination(destination).await;
    let mut notifications = engine.notifier().subscribe();

    let attempt_id = send_one(&engine, org).await;
    store.remove_destination(destination_id).await;

    let outcomes = drive(&engine, attempt_id).await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        &outcomes[0],
        AttemptOutcome::Failed {
            total_attempts: 1,
            error: DeliveryError::Configuration(_)
        }
    ));
    assert_eq!(responder.calls(), 0);

    let attempt = store.attempt(attempt_id).await.unwrap();
    assert_eq!(attempt.status, DeliveryStatus::Failed);
    assert!(attempt
        .error_message
        .as_deref()
        .unwrap()
        .contains("no longer exists"));
    assert_eq!(store.records(attempt_id).await.len(), 1);

    assert!(matches!(
        notifications.recv().await.unwrap(),
        DeliveryNotification::WebhookFailed { total_attempts: 1, .. }
    ));
}

#[tokio::test]
async fn test_inactive_destination_fails_without_retry() {
    let server = MockServer::start().await;
    mount(&server, CountingResponder::new(200)).await;

    let store = Arc::new(InMemoryStore::new());
    let engine = build_engine(&store, fast_config());
    let org = OrganizationId::new();
    let destination = destination_for(&server, org);
    store.put_destination(destination.clone()).await;

    let attempt_id = send_one(&engine, org).await;
    store.put_destination(destination.with_active(false)).await;

    let outcome = engine.executor().execute(attempt_id).await.unwrap();
    assert!(matches!(
        outcome,
        AttemptOutcome::Failed {
            error: DeliveryError::Configuration(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_connection_refused_is_retried() {
    let store = Arc::new(InMemoryStore::new());
    let engine = build_engine(&store, fast_config());
    let org = OrganizationId::new();
    store
        .put_destination(
            sierra_webhooks::WebhookDestination::new(org, "http://127.0.0.1:1/hook")
                .with_event_type(EVENT_TYPE)
                .with_max_attempts(2),
        )
        .await;

    let attempt_id = send_one(&engine, org).await;
    let first = engine.executor().execute(attempt_id).await.unwrap();
    match first {
        AttemptOutcome::Retrying { error, .. } => {
            assert!(matches!(error, DeliveryError::Network(_)));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}
