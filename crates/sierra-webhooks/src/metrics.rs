//! Per-organization daily delivery metrics.
//!
//! Counters are kept in memory for `metrics_retention_days` and optionally
//! forwarded to a [`MetricsSink`] for durable storage. Sink failures are
//! logged and never affect delivery.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sierra_core::OrganizationId;
use tokio::sync::RwLock;

use crate::store::MetricsSink;

/// Counters for one organization and UTC day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyDeliveryMetrics {
    pub organization_id: OrganizationId,
    pub date: NaiveDate,
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub rate_limited: u64,
    pub summed_duration_ms: u64,
    /// Attempt number -> tries made at that attempt number.
    pub attempt_histogram: BTreeMap<u32, u64>,
}

impl DailyDeliveryMetrics {
    #[must_use]
    pub fn empty(organization_id: OrganizationId, date: NaiveDate) -> Self {
        Self {
            organization_id,
            date,
            total: 0,
            success: 0,
            failed: 0,
            rate_limited: 0,
            summed_duration_ms: 0,
            attempt_histogram: BTreeMap::new(),
        }
    }

    pub fn apply(&mut self, delta: &MetricsDelta) {
        self.total += delta.total;
        self.success += delta.success;
        self.failed += delta.failed;
        self.rate_limited += delta.rate_limited;
        self.summed_duration_ms += delta.duration_ms;
        if let Some(attempt) = delta.attempt_number {
            *self.attempt_histogram.entry(attempt).or_insert(0) += 1;
        }
    }

    #[must_use]
    pub fn average_duration_ms(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.summed_duration_ms as f64 / self.total as f64
        }
    }
}

/// A single increment applied to a day's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsDelta {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub rate_limited: u64,
    pub duration_ms: u64,
    pub attempt_number: Option<u32>,
}

impl MetricsDelta {
    #[must_use]
    pub fn attempt(success: bool, duration: Duration, attempt_number: u32) -> Self {
        Self {
            total: 1,
            success: u64::from(success),
            failed: u64::from(!success),
            rate_limited: 0,
            duration_ms: duration.as_millis() as u64,
            attempt_number: Some(attempt_number),
        }
    }

    #[must_use]
    pub fn rate_limited() -> Self {
        Self {
            rate_limited: 1,
            ..Self::default()
        }
    }
}

/// Totals across a reporting window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsTotals {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub rate_limited: u64,
    pub average_duration_ms: f64,
    pub success_rate: f64,
}

/// N-day metrics window, oldest day first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub organization_id: OrganizationId,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub daily: Vec<DailyDeliveryMetrics>,
    pub totals: MetricsTotals,
}

/// In-memory daily counters with an optional durable sink.
pub struct MetricsRecorder {
    days: RwLock<HashMap<(OrganizationId, NaiveDate), DailyDeliveryMetrics>>,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl MetricsRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            days: RwLock::new(HashMap::new()),
            sink: None,
        }
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Count one HTTP try.
    pub async fn record_attempt(
        &self,
        organization_id: OrganizationId,
        at: DateTime<Utc>,
        success: bool,
        duration: Duration,
        attempt_number: u32,
    ) {
        let delta = MetricsDelta::attempt(success, duration, attempt_number);
        self.apply(organization_id, at.date_naive(), delta).await;
    }

    /// Count one scheduling rejection.
    pub async fn record_rate_limited(&self, organization_id: OrganizationId, at: DateTime<Utc>) {
        self.apply(organization_id, at.date_naive(), MetricsDelta::rate_limited())
            .await;
    }

    async fn apply(&self, organization_id: OrganizationId, date: NaiveDate, delta: MetricsDelta) {
        {
            let mut days = self.days.write().await;
            days.entry((organization_id, date))
                .or_insert_with(|| DailyDeliveryMetrics::empty(organization_id, date))
                .apply(&delta);
        }

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.increment(organization_id, date, &delta).await {
                tracing::error!(
                    target: "webhook_delivery",
                    organization_id = %organization_id,
                    date = %date,
                    error = %e,
                    "Failed to persist delivery metrics"
                );
            }
        }
    }

    /// Counters for one day; zeroes if nothing was recorded.
    pub async fn daily(&self, organization_id: OrganizationId, date: NaiveDate) -> DailyDeliveryMetrics {
        self.days
            .read()
            .await
            .get(&(organization_id, date))
            .cloned()
            .unwrap_or_else(|| DailyDeliveryMetrics::empty(organization_id, date))
    }

    /// The `days`-day window ending at `today`, zero-filled.
    pub async fn query(
        &self,
        organization_id: OrganizationId,
        days: u32,
        today: NaiveDate,
    ) -> MetricsReport {
        let days = days.max(1);
        let from = today - chrono::Duration::days(i64::from(days) - 1);

        let store = self.days.read().await;
        let daily: Vec<DailyDeliveryMetrics> = from
            .iter_days()
            .take(days as usize)
            .map(|date| {
                store
                    .get(&(organization_id, date))
                    .cloned()
                    .unwrap_or_else(|| DailyDeliveryMetrics::empty(organization_id, date))
            })
            .collect();
        drop(store);

        let mut totals = MetricsTotals::default();
        let mut duration_ms = 0u64;
        for day in &daily {
            totals.total += day.total;
            totals.success += day.success;
            totals.failed += day.failed;
            totals.rate_limited += day.rate_limited;
            duration_ms += day.summed_duration_ms;
        }
        if totals.total > 0 {
            totals.average_duration_ms = duration_ms as f64 / totals.total as f64;
            totals.success_rate = totals.success as f64 * 100.0 / totals.total as f64;
        }

        MetricsReport {
            organization_id,
            from,
            to: today,
            daily,
            totals,
        }
    }

    /// Drop days strictly before `before`. Returns how many were removed.
    pub async fn prune(&self, before: NaiveDate) -> usize {
        let mut days = self.days.write().await;
        let len = days.len();
        days.retain(|(_, date), _| *date >= before);
        len - days.len()
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}
