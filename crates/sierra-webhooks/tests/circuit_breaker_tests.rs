//! Integration tests for per-host circuit breaking.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use sierra_core::OrganizationId;
use sierra_webhooks::{
    AttemptOutcome, CircuitBreakerConfig, CircuitState, DeliveryError, InMemoryStore,
};
use wiremock::MockServer;

fn tripping_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig::default()
        .with_error_threshold(1)
        .with_minimum_requests(1)
        .with_reset_timeout(Duration::from_secs(60))
}

/// 25 consecutive failures with errorThreshold=5, minimumRequests=20.
#[tokio::test]
async fn test_breaker_opens_and_stops_network_calls() {
    let server = MockServer::start().await;
    let responder = CountingResponder::new(500);
    mount(&server, responder.clone()).await;

    let store = Arc::new(InMemoryStore::new());
    let config = fast_config().with_circuit_breaker(
        CircuitBreakerConfig::default()
            .with_error_threshold(5)
            .with_minimum_requests(20)
            .with_reset_timeout(Duration::from_secs(60)),
    );
    let engine = build_engine(&store, config);
    let org = OrganizationId::new();
    store
        .put_destination(destination_for(&server, org).with_max_attempts(1))
        .await;

    let mut outcomes = Vec::new();
    for _ in 0..25 {
        let attempt_id = send_one(&engine, org).await;
        outcomes.push(engine.executor().execute(attempt_id).await.unwrap());
    }

    let breaker = engine.registry().get(&breaker_name(&server)).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(responder.calls(), 20);

    for outcome in &outcomes[20..] {
        match outcome {
            AttemptOutcome::Failed { error, .. } => {
                assert!(matches!(error, DeliveryError::CircuitOpen { .. }));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    let stats = breaker.stats();
    assert_eq!(stats.rejected_requests, 5);
    assert_eq!(stats.failed_requests, 20);
}

#[tokio::test]
async fn test_breaker_is_scoped_to_host() {
    let bad = MockServer::start().await;
    mount(&bad, CountingResponder::new(500)).await;
    let good = MockServer::start().await;
    let good_responder = CountingResponder::new(200);
    mount(&good, good_responder.clone()).await;

    let store = Arc::new(InMemoryStore::new());
    let engine = build_engine(&store, fast_config().with_circuit_breaker(tripping_config()));
    let bad_org = OrganizationId::new();
    let good_org = OrganizationId::new();
    store
        .put_destination(destination_for(&bad, bad_org).with_max_attempts(1))
        .await;
    store.put_destination(destination_for(&good, good_org)).await;

    let failed = send_one(&engine, bad_org).await;
    engine.executor().execute(failed).await.unwrap();

    let delivered = send_one(&engine, good_org).await;
    let outcome = engine.executor().execute(delivered).await.unwrap();
    assert!(matches!(outcome, AttemptOutcome::Succeeded { .. }));
    assert_eq!(good_responder.calls(), 1);

    let statuses = engine.registry().statuses().await;
    assert_eq!(statuses.len(), 2);
    let bad_stats = statuses
        .iter()
        .find(|s| s.name == breaker_name(&bad))
        .unwrap();
    assert_eq!(bad_stats.state, CircuitState::Open);
    let good_stats = statuses
        .iter()
        .find(|s| s.name == breaker_name(&good))
        .unwrap();
    assert_eq!(good_stats.state, CircuitState::Closed);
}

#[tokio::test]
async fn test_circuit_open_consumes_retry_slot() {
    let server = MockServer::start().await;
    let responder = CountingResponder::new(500);
    mount(&server, responder.clone()).await;

    let store = Arc::new(InMemoryStore::new());
    let engine = build_engine(&store, fast_config().with_circuit_breaker(tripping_config()));
    let org = OrganizationId::new();
    store
        .put_destination(destination_for(&server, org).with_max_attempts(3))
        .await;

    let attempt_id = send_one(&engine, org).await;
    let outcomes = drive(&engine, attempt_id).await;

    assert_eq!(responder.calls(), 1);
    assert_eq!(outcomes.len(), 3);
    match outcomes.last().unwrap() {
        AttemptOutcome::Failed {
            total_attempts,
            error,
        } => {
            assert_eq!(*total_attempts, 3);
            assert!(matches!(error, DeliveryError::CircuitOpen { .. }));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(store.records(attempt_id).await.len(), 3);
}

#[tokio::test]
async fn test_circuit_open_defers_without_consuming_slot() {
    let server = MockServer::start().await;
    let responder = CountingResponder::new(500);
    mount(&server, responder.clone()).await;

    let store = Arc::new(InMemoryStore::new());
    let mut config = fast_config().with_circuit_breaker(tripping_config());
    config.delivery.circuit_open_consumes_attempt = false;
    let engine = build_engine(&store, config);
    let org = OrganizationId::new();
    store
        .put_destination(destination_for(&server, org).with_max_attempts(2))
        .await;

    let first = send_one(&engine, org).await;
    engine.executor().execute(first).await.unwrap();

    let second = send_one(&engine, org).await;
    let outcome = engine.executor().execute(second).await.unwrap();
    match outcome {
        AttemptOutcome::Deferred {
            attempt_number,
            next_attempt_at,
        } => {
            assert_eq!(attempt_number, 1);
            assert!(next_attempt_at > chrono::Utc::now() + chrono::Duration::seconds(50));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(responder.calls(), 1);

    let attempt = store.attempt(second).await.unwrap();
    assert!(attempt.is_pending());
    assert_eq!(attempt.attempt_number, 1);
    assert!(engine.queue().contains(second));
    assert!(!engine.queue().drain_due(chrono::Utc::now(), 10).contains(&second));
}

#[tokio::test]
async fn test_reset_allows_delivery_again() {
    let server = MockServer::start().await;
    let responder = FailingResponder::fail_times(1);
    mount(&server, responder.clone()).await;

    let store = Arc::new(InMemoryStore::new());
    let engine = build_engine(&store, fast_config().with_circuit_breaker(tripping_config()));
    let org = OrganizationId::new();
    store
        .put_destination(destination_for(&server, org).with_max_attempts(1))
        .await;

    let first = send_one(&engine, org).await;
    engine.executor().execute(first).await.unwrap();

    let stats = engine.registry().reset(&breaker_name(&server)).await.unwrap();
    assert_eq!(stats.state, CircuitState::Closed);

    let second = send_one(&engine, org).await;
    let outcome = engine.executor().execute(second).await.unwrap();
    assert!(matches!(outcome, AttemptOutcome::Succeeded { .. }));
    assert_eq!(responder.calls(), 2);
}
