//! Integration tests for event fan-out.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use sierra_core::OrganizationId;
use sierra_webhooks::{
    DeliveryNotification, DeliveryStatus, InMemoryStore, RateLimitConfig, WebhookDestination,
};
use wiremock::MockServer;

#[tokio::test]
async fn test_rate_limited_destination_is_dropped() {
    let server = MockServer::start().await;
    mount(&server, CountingResponder::new(200)).await;

    let store = Arc::new(InMemoryStore::new());
    let config = fast_config().with_rate_limit(
        RateLimitConfig::default()
            .with_max_per_window(2)
            .with_window(Duration::from_secs(1)),
    );
    let engine = build_engine(&store, config);
    let org = OrganizationId::new();
    let destination = destination_for(&server, org);
    let destination_id = destination.id;
    store.put_destination(destination).await;
    let mut notifications = engine.notifier().subscribe();

    send_one(&engine, org).await;
    send_one(&engine, org).await;
    let summary = engine
        .send(org, EVENT_TYPE, serde_json::json!({}), None)
        .await
        .unwrap();

    assert!(summary.scheduled.is_empty());
    assert_eq!(summary.rate_limited, vec![destination_id]);
    assert_eq!(store.attempts().await.len(), 2);
    assert_eq!(engine.queue().len(), 2);

    let rate_limited = loop {
        if let DeliveryNotification::RateLimited {
            organization_id,
            destination_id,
        } = notifications.recv().await.unwrap()
        {
            break (organization_id, destination_id);
        }
    };
    assert_eq!(rate_limited, (org, destination_id));

    let metrics = engine
        .metrics()
        .daily(org, chrono::Utc::now().date_naive())
        .await;
    assert_eq!(metrics.rate_limited, 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let summary = engine
        .send(org, EVENT_TYPE, serde_json::json!({}), None)
        .await
        .unwrap();
    assert_eq!(summary.scheduled.len(), 1);
}

#[tokio::test]
async fn test_only_subscribed_active_destinations_receive_event() {
    let server = MockServer::start().await;
    let store = Arc::new(InMemoryStore::new());
    let engine = build_engine(&store, fast_config());
    let org = OrganizationId::new();

    let subscribed = destination_for(&server, org);
    let wildcard = WebhookDestination::new(org, format!("{}/all", server.uri())).with_event_type("*");
    let other_event = WebhookDestination::new(org, format!("{}/deals", server.uri()))
        .with_event_type("deal.closed");
    let inactive = destination_for(&server, org).with_active(false);
    let other_org = destination_for(&server, OrganizationId::new());
    for destination in [
        subscribed.clone(),
        wildcard.clone(),
        other_event,
        inactive,
        other_org,
    ] {
        store.put_destination(destination).await;
    }

    let summary = engine
        .send(org, EVENT_TYPE, serde_json::json!({"id": 1}), None)
        .await
        .unwrap();
    assert_eq!(summary.scheduled.len(), 2);

    let mut targeted: Vec<_> = store
        .attempts()
        .await
        .into_iter()
        .map(|a| a.destination_id)
        .collect();
    targeted.sort();
    let mut expected = vec![subscribed.id, wildcard.id];
    expected.sort();
    assert_eq!(targeted, expected);

    for attempt in store.attempts().await {
        assert_eq!(attempt.status, DeliveryStatus::Pending);
        assert_eq!(attempt.attempt_number, 1);
        assert_eq!(attempt.event_id, summary.event_id);
    }
}

#[tokio::test]
async fn test_send_to_single_destination() {
    let server = MockServer::start().await;
    let store = Arc::new(InMemoryStore::new());
    let engine = build_engine(&store, fast_config());
    let org = OrganizationId::new();

    let first = destination_for(&server, org);
    let second = destination_for(&server, org);
    store.put_destination(first.clone()).await;
    store.put_destination(second).await;

    let summary = engine
        .send(org, EVENT_TYPE, serde_json::json!({}), Some(first.id))
        .await
        .unwrap();
    assert_eq!(summary.scheduled.len(), 1);
    let attempt = store.attempt(summary.scheduled[0]).await.unwrap();
    assert_eq!(attempt.destination_id, first.id);
}

#[tokio::test]
async fn test_invalid_destination_is_skipped_others_proceed() {
    let server = MockServer::start().await;
    let store = Arc::new(InMemoryStore::new());
    let engine = build_engine(&store, fast_config());
    let org = OrganizationId::new();

    let broken = WebhookDestination::new(org, "ftp://files.example.com/hook").with_event_type(EVENT_TYPE);
    let healthy = destination_for(&server, org);
    store.put_destination(broken.clone()).await;
    store.put_destination(healthy).await;

    let summary = engine
        .send(org, EVENT_TYPE, serde_json::json!({}), None)
        .await
        .unwrap();

    assert_eq!(summary.skipped, vec![broken.id]);
    assert_eq!(summary.scheduled.len(), 1);
    assert_eq!(store.attempts().await.len(), 1);
}

#[tokio::test]
async fn test_no_destinations_schedules_nothing() {
    let store = Arc::new(InMemoryStore::new());
    let engine = build_engine(&store, fast_config());

    let summary = engine
        .send(OrganizationId::new(), EVENT_TYPE, serde_json::json!({}), None)
        .await
        .unwrap();

    assert!(summary.scheduled.is_empty());
    assert!(summary.rate_limited.is_empty());
    assert!(summary.skipped.is_empty());
    assert!(engine.queue().is_empty());
}
