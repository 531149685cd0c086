//! Event fan-out into pending delivery attempts.
//!
//! `send` resolves the destinations subscribed to an event, applies the rate
//! limiter, persists one pending attempt per destination and queues it for
//! the scheduler. Delivery itself happens later on the scheduler's workers.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sierra_core::{AttemptId, DestinationId, EventId, OrganizationId};

use crate::config::DeliveryConfig;
use crate::crypto::{SignatureSigner, SIGNATURE_HEADER};
use crate::error::WebhookResult;
use crate::events::{DeliveryNotification, DeliveryNotifier};
use crate::metrics::MetricsRecorder;
use crate::models::{CreateDeliveryAttempt, DeliveryAttempt, WebhookDestination, WebhookPayload};
use crate::queue::RetryQueue;
use crate::rate_limiter::RateLimiter;
use crate::store::{DeliveryStore, DestinationStore};

pub const EVENT_HEADER: &str = "X-Sierra-Event";
pub const TIMESTAMP_HEADER: &str = "X-Sierra-Timestamp";
pub const DELIVERY_HEADER: &str = "X-Sierra-Delivery";

/// What happened to each matching destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchSummary {
    pub event_id: EventId,
    /// Attempts persisted and queued.
    pub scheduled: Vec<AttemptId>,
    /// Destinations dropped by the rate limiter.
    pub rate_limited: Vec<DestinationId>,
    /// Destinations skipped because of bad configuration or a store error.
    pub skipped: Vec<DestinationId>,
}

/// Entry point for business events.
pub struct WebhookDispatcher {
    destinations: Arc<dyn DestinationStore>,
    deliveries: Arc<dyn DeliveryStore>,
    rate_limiter: Arc<RateLimiter>,
    queue: Arc<RetryQueue>,
    metrics: Arc<MetricsRecorder>,
    notifier: DeliveryNotifier,
    config: DeliveryConfig,
}

impl WebhookDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        destinations: Arc<dyn DestinationStore>,
        deliveries: Arc<dyn DeliveryStore>,
        rate_limiter: Arc<RateLimiter>,
        queue: Arc<RetryQueue>,
        metrics: Arc<MetricsRecorder>,
        notifier: DeliveryNotifier,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            destinations,
            deliveries,
            rate_limiter,
            queue,
            metrics,
            notifier,
            config,
        }
    }

    /// Schedule delivery of `data` as `event_type` to every active destination
    /// of `organization_id` subscribed to it, or only to `destination_id`.
    ///
    /// # Errors
    ///
    /// Fails only if destinations cannot be resolved or the payload cannot be
    /// serialized. Per-destination problems are reported in the summary.
    pub async fn send(
        &self,
        organization_id: OrganizationId,
        event_type: &str,
        data: serde_json::Value,
        destination_id: Option<DestinationId>,
    ) -> WebhookResult<DispatchSummary> {
        let destinations = self
            .destinations
            .find_active_for_event(organization_id, event_type, destination_id)
            .await?;

        let payload = WebhookPayload {
            event_id: EventId::new(),
            event_type: event_type.to_string(),
            organization_id,
            timestamp: Utc::now(),
            data,
        };
        let mut summary = DispatchSummary {
            event_id: payload.event_id,
            ..DispatchSummary::default()
        };

        if destinations.is_empty() {
            tracing::debug!(
                target: "webhook_dispatch",
                event_id = %payload.event_id,
                event_type = %event_type,
                organization_id = %organization_id,
                "No active destinations subscribed to event"
            );
            return Ok(summary);
        }

        let body = serde_json::to_vec(&payload)?;

        tracing::info!(
            target: "webhook_dispatch",
            event_id = %payload.event_id,
            event_type = %event_type,
            organization_id = %organization_id,
            destination_count = destinations.len(),
            "Dispatching event to destinations"
        );

        for destination in &destinations {
            if let Err(e) = destination.breaker_key() {
                tracing::error!(
                    target: "webhook_dispatch",
                    destination_id = %destination.id,
                    organization_id = %organization_id,
                    error = %e,
                    "Skipping destination with invalid configuration"
                );
                summary.skipped.push(destination.id);
                continue;
            }

            if let Err(e) = self.rate_limiter.try_acquire(organization_id, destination.id) {
                tracing::warn!(
                    target: "webhook_dispatch",
                    destination_id = %destination.id,
                    organization_id = %organization_id,
                    event_id = %payload.event_id,
                    error = %e,
                    "Delivery dropped by rate limiter"
                );
                self.metrics
                    .record_rate_limited(organization_id, Utc::now())
                    .await;
                self.notifier.notify(DeliveryNotification::RateLimited {
                    organization_id,
                    destination_id: destination.id,
                });
                summary.rate_limited.push(destination.id);
                continue;
            }

            let attempt_id = AttemptId::new();
            let attempt = DeliveryAttempt::create(
                CreateDeliveryAttempt {
                    id: attempt_id,
                    destination_id: destination.id,
                    organization_id,
                    event_id: payload.event_id,
                    event_type: payload.event_type.clone(),
                    url: destination.url.clone(),
                    payload: body.clone(),
                    headers: build_headers(destination, &payload, attempt_id, &body, &self.config),
                    max_attempts: destination
                        .effective_max_attempts(self.config.default_max_attempts),
                },
                Utc::now(),
            );

            if let Err(e) = self.deliveries.insert(&attempt).await {
                tracing::error!(
                    target: "webhook_dispatch",
                    destination_id = %destination.id,
                    attempt_id = %attempt_id,
                    error = %e,
                    "Failed to persist delivery attempt"
                );
                summary.skipped.push(destination.id);
                continue;
            }

            let due = attempt.next_attempt_at.unwrap_or(attempt.created_at);
            self.queue.push(attempt_id, due);
            summary.scheduled.push(attempt_id);

            tracing::debug!(
                target: "webhook_dispatch",
                attempt_id = %attempt_id,
                destination_id = %destination.id,
                max_attempts = attempt.max_attempts,
                "Delivery attempt scheduled"
            );
        }

        Ok(summary)
    }
}

/// Outbound headers for one attempt. Destination headers go in first so the
/// engine's own headers replace them, compared case-insensitively.
fn build_headers(
    destination: &WebhookDestination,
    payload: &WebhookPayload,
    attempt_id: AttemptId,
    body: &[u8],
    config: &DeliveryConfig,
) -> BTreeMap<String, String> {
    let mut headers = destination.headers.clone();

    set_header(&mut headers, "Content-Type", "application/json".to_string());
    set_header(&mut headers, "User-Agent", config.user_agent.clone());
    set_header(&mut headers, EVENT_HEADER, payload.event_type.clone());
    set_header(
        &mut headers,
        TIMESTAMP_HEADER,
        payload.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
    );
    set_header(&mut headers, DELIVERY_HEADER, attempt_id.to_string());

    match &destination.secret {
        Some(secret) if !secret.is_empty() => {
            set_header(&mut headers, SIGNATURE_HEADER, SignatureSigner::sign(body, secret));
        }
        _ => {
            headers.retain(|name, _| !name.eq_ignore_ascii_case(SIGNATURE_HEADER));
        }
    }

    headers
}

fn set_header(headers: &mut BTreeMap<String, String>, name: &str, value: String) {
    headers.retain(|existing, _| !existing.eq_ignore_ascii_case(name));
    headers.insert(name.to_string(), value);
}
