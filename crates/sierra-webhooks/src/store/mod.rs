//! Persistence seams.
//!
//! The engine only sees these traits. [`InMemoryStore`] backs tests and
//! embedded setups; [`postgres::PgWebhookStore`] is the durable
//! implementation.

pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use sierra_core::{AttemptId, DestinationId, OrganizationId};
use tokio::sync::RwLock;

use crate::error::{WebhookError, WebhookResult};
use crate::metrics::{DailyDeliveryMetrics, MetricsDelta};
use crate::models::{AttemptRecord, DeliveryAttempt, WebhookDestination};

pub use postgres::PgWebhookStore;

/// Read access to destination configuration.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Active destinations of `organization_id` subscribed to `event_type`,
    /// optionally narrowed to one destination.
    async fn find_active_for_event(
        &self,
        organization_id: OrganizationId,
        event_type: &str,
        destination_id: Option<DestinationId>,
    ) -> WebhookResult<Vec<WebhookDestination>>;

    async fn find_by_id(&self, id: DestinationId) -> WebhookResult<Option<WebhookDestination>>;
}

/// Storage of delivery attempts and their history.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn insert(&self, attempt: &DeliveryAttempt) -> WebhookResult<()>;

    /// Overwrite an existing attempt.
    async fn update(&self, attempt: &DeliveryAttempt) -> WebhookResult<()>;

    async fn find_by_id(&self, id: AttemptId) -> WebhookResult<Option<DeliveryAttempt>>;

    /// Pending attempts, earliest `next_attempt_at` first.
    async fn list_pending(&self, limit: usize) -> WebhookResult<Vec<DeliveryAttempt>>;

    async fn append_record(&self, record: &AttemptRecord) -> WebhookResult<()>;

    /// History of one attempt in recording order.
    async fn list_records(&self, attempt_id: AttemptId) -> WebhookResult<Vec<AttemptRecord>>;
}

/// Durable destination for metrics increments.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn increment(
        &self,
        organization_id: OrganizationId,
        date: NaiveDate,
        delta: &MetricsDelta,
    ) -> WebhookResult<()>;
}

/// Process-local store implementing every persistence trait.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    destinations: RwLock<HashMap<DestinationId, WebhookDestination>>,
    attempts: RwLock<HashMap<AttemptId, DeliveryAttempt>>,
    records: RwLock<HashMap<AttemptId, Vec<AttemptRecord>>>,
    metrics: RwLock<HashMap<(OrganizationId, NaiveDate), DailyDeliveryMetrics>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a destination.
    pub async fn put_destination(&self, destination: WebhookDestination) {
        self.destinations
            .write()
            .await
            .insert(destination.id, destination);
    }

    pub async fn remove_destination(&self, id: DestinationId) -> Option<WebhookDestination> {
        self.destinations.write().await.remove(&id)
    }

    pub async fn attempt(&self, id: AttemptId) -> Option<DeliveryAttempt> {
        self.attempts.read().await.get(&id).cloned()
    }

    /// All attempts, oldest first.
    pub async fn attempts(&self) -> Vec<DeliveryAttempt> {
        let mut all: Vec<DeliveryAttempt> = self.attempts.read().await.values().cloned().collect();
        all.sort_by_key(|a| a.created_at);
        all
    }

    pub async fn records(&self, attempt_id: AttemptId) -> Vec<AttemptRecord> {
        self.records
            .read()
            .await
            .get(&attempt_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Metrics persisted through the sink interface.
    pub async fn persisted_metrics(
        &self,
        organization_id: OrganizationId,
        date: NaiveDate,
    ) -> Option<DailyDeliveryMetrics> {
        self.metrics
            .read()
            .await
            .get(&(organization_id, date))
            .cloned()
    }
}

#[async_trait]
impl DestinationStore for InMemoryStore {
    async fn find_active_for_event(
        &self,
        organization_id: OrganizationId,
        event_type: &str,
        destination_id: Option<DestinationId>,
    ) -> WebhookResult<Vec<WebhookDestination>> {
        let destinations = self.destinations.read().await;
        let mut matching: Vec<WebhookDestination> = destinations
            .values()
            .filter(|d| d.organization_id == organization_id)
            .filter(|d| d.is_active && d.subscribes_to(event_type))
            .filter(|d| destination_id.map_or(true, |id| d.id == id))
            .cloned()
            .collect();
        matching.sort_by_key(|d| (d.created_at, d.id));
        Ok(matching)
    }

    async fn find_by_id(&self, id: DestinationId) -> WebhookResult<Option<WebhookDestination>> {
        Ok(self.destinations.read().await.get(&id).cloned())
    }
}

#[async_trait]
impl DeliveryStore for InMemoryStore {
    async fn insert(&self, attempt: &DeliveryAttempt) -> WebhookResult<()> {
        let mut attempts = self.attempts.write().await;
        if attempts.contains_key(&attempt.id) {
            return Err(WebhookError::Internal(format!(
                "delivery attempt {} already exists",
                attempt.id
            )));
        }
        attempts.insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn update(&self, attempt: &DeliveryAttempt) -> WebhookResult<()> {
        let mut attempts = self.attempts.write().await;
        match attempts.get_mut(&attempt.id) {
            Some(existing) => {
                *existing = attempt.clone();
                Ok(())
            }
            None => Err(WebhookError::AttemptNotFound(attempt.id)),
        }
    }

    async fn find_by_id(&self, id: AttemptId) -> WebhookResult<Option<DeliveryAttempt>> {
        Ok(self.attempts.read().await.get(&id).cloned())
    }

    async fn list_pending(&self, limit: usize) -> WebhookResult<Vec<DeliveryAttempt>> {
        let attempts = self.attempts.read().await;
        let mut pending: Vec<DeliveryAttempt> =
            attempts.values().filter(|a| a.is_pending()).cloned().collect();
        pending.sort_by_key(|a| (a.next_attempt_at, a.created_at));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn append_record(&self, record: &AttemptRecord) -> WebhookResult<()> {
        self.records
            .write()
            .await
            .entry(record.attempt_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn list_records(&self, attempt_id: AttemptId) -> WebhookResult<Vec<AttemptRecord>> {
        Ok(self.records(attempt_id).await)
    }
}

#[async_trait]
impl MetricsSink for InMemoryStore {
    async fn increment(
        &self,
        organization_id: OrganizationId,
        date: NaiveDate,
        delta: &MetricsDelta,
    ) -> WebhookResult<()> {
        self.metrics
            .write()
            .await
            .entry((organization_id, date))
            .or_insert_with(|| DailyDeliveryMetrics::empty(organization_id, date))
            .apply(delta);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use crate::models::{CreateDeliveryAttempt, RecordOutcome};
    use chrono::Utc;
    use sierra_core::EventId;
    use std::collections::BTreeMap;

    fn pending_for(destination: &WebhookDestination) -> DeliveryAttempt {
        DeliveryAttempt::create(
            CreateDeliveryAttempt {
                id: AttemptId::new(),
                destination_id: destination.id,
                organization_id: destination.organization_id,
                event_id: EventId::new(),
                event_type: "deal.won".into(),
                url: destination.url.clone(),
                payload: b"{}".to_vec(),
                headers: BTreeMap::new(),
                max_attempts: 3,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_find_active_for_event_filters() {
        let store = InMemoryStore::new();
        let org = OrganizationId::new();

        let wanted = WebhookDestination::new(org, "https://a.example").with_event_type("deal.won");
        let other_event =
            WebhookDestination::new(org, "https://b.example").with_event_type("deal.lost");
        let inactive = WebhookDestination::new(org, "https://c.example")
            .with_event_type("deal.won")
            .with_active(false);
        let other_org = WebhookDestination::new(OrganizationId::new(), "https://d.example")
            .with_event_type("deal.won");

        for d in [&wanted, &other_event, &inactive, &other_org] {
            store.put_destination(d.clone()).await;
        }

        let found = store.find_active_for_event(org, "deal.won", None).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, wanted.id);

        let narrowed = store
            .find_active_for_event(org, "deal.won", Some(other_event.id))
            .await
            .unwrap();
        assert!(narrowed.is_empty());
    }

    #[tokio::test]
    async fn test_update_requires_existing_attempt() {
        let store = InMemoryStore::new();
        let d = WebhookDestination::new(OrganizationId::new(), "https://a.example");
        let attempt = pending_for(&d);

        assert!(matches!(
            store.update(&attempt).await,
            Err(WebhookError::AttemptNotFound(_))
        ));
        store.insert(&attempt).await.unwrap();
        assert!(store.insert(&attempt).await.is_err());
        store.update(&attempt).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_pending_orders_and_limits() {
        let store = InMemoryStore::new();
        let d = WebhookDestination::new(OrganizationId::new(), "https://a.example");

        let mut late = pending_for(&d);
        late.next_attempt_at = Some(Utc::now() + chrono::Duration::minutes(5));
        let early = pending_for(&d);
        let mut done = pending_for(&d);
        done.mark_failed(&DeliveryError::Timeout { timeout_ms: 1 }, Utc::now())
            .unwrap();

        for a in [&late, &early, &done] {
            store.insert(a).await.unwrap();
        }

        let pending = store.list_pending(10).await.unwrap();
        let ids: Vec<AttemptId> = pending.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![early.id, late.id]);
        assert_eq!(store.list_pending(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_records_keep_order() {
        let store = InMemoryStore::new();
        let attempt_id = AttemptId::new();
        for n in 1..=3 {
            store
                .append_record(&AttemptRecord {
                    attempt_id,
                    attempt_number: n,
                    outcome: RecordOutcome::Failed,
                    http_status: Some(500),
                    error: Some("HTTP 500".into()),
                    duration_ms: 3,
                    next_attempt_at: None,
                    recorded_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let numbers: Vec<u32> = store
            .list_records(attempt_id)
            .await
            .unwrap()
            .iter()
            .map(|r| r.attempt_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_metrics_sink_accumulates() {
        let store = InMemoryStore::new();
        let org = OrganizationId::new();
        let date = Utc::now().date_naive();
        store
            .increment(org, date, &MetricsDelta::rate_limited())
            .await
            .unwrap();
        store
            .increment(org, date, &MetricsDelta::rate_limited())
            .await
            .unwrap();
        assert_eq!(
            store.persisted_metrics(org, date).await.unwrap().rate_limited,
            2
        );
    }
}
