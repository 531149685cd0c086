//! Single-try delivery execution.
//!
//! The executor loads a pending attempt, POSTs it through the destination
//! host's circuit breaker and then decides between success, another retry
//! or terminal failure. Every try is persisted as an [`AttemptRecord`] and
//! counted in the metrics.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use sierra_core::AttemptId;
use tokio::time::Instant;

use crate::circuit_breaker::{BreakerError, CircuitBreakerRegistry};
use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, WebhookResult};
use crate::events::{DeliveryNotification, DeliveryNotifier};
use crate::metrics::MetricsRecorder;
use crate::models::{breaker_key_for, AttemptRecord, DeliveryAttempt, RecordOutcome};
use crate::queue::RetryQueue;
use crate::store::{DeliveryStore, DestinationStore};
use crate::transport::{OutboundRequest, Transport, TransportResponse};

/// Delay before attempt `attempt_number + 1`, clamped to the last entry.
///
/// `attempt_number` is the 1-based number of the try that just failed.
#[must_use]
pub fn retry_delay(delays: &[Duration], attempt_number: u32) -> Duration {
    if delays.is_empty() {
        return Duration::ZERO;
    }
    let index = (attempt_number.saturating_sub(1) as usize).min(delays.len() - 1);
    delays[index]
}

/// Scale `delay` by a uniform factor in `[1 - ratio, 1 + ratio]`.
#[must_use]
pub fn apply_jitter(delay: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 || delay.is_zero() {
        return delay;
    }
    let ratio = ratio.min(1.0);
    let factor = rand::thread_rng().gen_range((1.0 - ratio)..=(1.0 + ratio));
    delay.mul_f64(factor)
}

fn add_duration(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(at)
}

fn excerpt(body: &str, limit: usize) -> Option<String> {
    if body.is_empty() {
        None
    } else {
        Some(body.chars().take(limit).collect())
    }
}

/// Result of one `execute` call.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// 2xx received; delivery complete.
    Succeeded { attempt_number: u32, http_status: u16 },
    /// Failed with attempts left; `attempt_number` is the next try.
    Retrying {
        attempt_number: u32,
        next_attempt_at: DateTime<Utc>,
        error: DeliveryError,
    },
    /// Breaker rejected the call and the slot was not consumed.
    Deferred {
        attempt_number: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Terminal failure.
    Failed {
        total_attempts: u32,
        error: DeliveryError,
    },
    /// Attempt missing or no longer pending; nothing was done.
    Skipped,
}

impl AttemptOutcome {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }
}

/// Executes delivery attempts.
pub struct AttemptExecutor {
    deliveries: Arc<dyn DeliveryStore>,
    destinations: Arc<dyn DestinationStore>,
    transport: Arc<dyn Transport>,
    breakers: CircuitBreakerRegistry,
    queue: Arc<RetryQueue>,
    metrics: Arc<MetricsRecorder>,
    notifier: DeliveryNotifier,
    config: DeliveryConfig,
}

impl AttemptExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        deliveries: Arc<dyn DeliveryStore>,
        destinations: Arc<dyn DestinationStore>,
        transport: Arc<dyn Transport>,
        breakers: CircuitBreakerRegistry,
        queue: Arc<RetryQueue>,
        metrics: Arc<MetricsRecorder>,
        notifier: DeliveryNotifier,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            deliveries,
            destinations,
            transport,
            breakers,
            queue,
            metrics,
            notifier,
            config,
        }
    }

    /// Run one try of `attempt_id`.
    ///
    /// # Errors
    ///
    /// Returns an error only when the store fails; delivery failures are
    /// reported through [`AttemptOutcome`].
    pub async fn execute(&self, attempt_id: AttemptId) -> WebhookResult<AttemptOutcome> {
        let Some(mut attempt) = self.deliveries.find_by_id(attempt_id).await? else {
            tracing::debug!(
                target: "webhook_delivery",
                attempt_id = %attempt_id,
                "Attempt no longer exists, discarding"
            );
            self.queue.remove(attempt_id);
            return Ok(AttemptOutcome::Skipped);
        };

        if !attempt.is_pending() {
            tracing::debug!(
                target: "webhook_delivery",
                attempt_id = %attempt_id,
                status = attempt.status.as_str(),
                "Attempt is no longer pending, discarding"
            );
            self.queue.remove(attempt_id);
            return Ok(AttemptOutcome::Skipped);
        }

        let resolved = self.resolve(&attempt).await?;
        let (breaker_key, timeout, delays) = match resolved {
            Ok(resolved) => resolved,
            Err(error) => return self.fail_fatal(&mut attempt, error).await,
        };

        let breaker = self.breakers.get_or_create(&breaker_key, None).await;
        let request = OutboundRequest {
            url: attempt.url.clone(),
            headers: attempt.headers.clone(),
            body: attempt.payload.clone(),
            timeout,
        };

        let limit = self.config.response_excerpt_limit;
        let transport = Arc::clone(&self.transport);
        let started = Instant::now();
        let result = breaker
            .execute_filtered_with_timeout(
                || async move {
                    let response = transport.post(request).await?;
                    if response.is_success() {
                        Ok::<TransportResponse, DeliveryError>(response)
                    } else {
                        Err(DeliveryError::Http {
                            status: response.status,
                            body: response.body.chars().take(limit).collect(),
                        })
                    }
                },
                |_| true,
                timeout,
            )
            .await;
        let duration = started.elapsed();

        let result = result.map_err(|e| match e {
            BreakerError::Inner(err) => err,
            BreakerError::Timeout { timeout, .. } => DeliveryError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            },
            BreakerError::Open { name, retry_at } => DeliveryError::CircuitOpen { name, retry_at },
        });

        match result {
            Ok(response) => self.succeed(&mut attempt, response, duration).await,
            Err(error) => self.fail(&mut attempt, error, duration, &delays).await,
        }
    }

    /// Breaker key, timeout and retry schedule for the attempt's destination.
    async fn resolve(
        &self,
        attempt: &DeliveryAttempt,
    ) -> WebhookResult<Result<(String, Duration, Vec<Duration>), DeliveryError>> {
        let destination = match self.destinations.find_by_id(attempt.destination_id).await? {
            Some(d) => d,
            None => {
                return Ok(Err(DeliveryError::Configuration(format!(
                    "destination {} no longer exists",
                    attempt.destination_id
                ))));
            }
        };

        if !destination.is_active {
            return Ok(Err(DeliveryError::Configuration(format!(
                "destination {} is inactive",
                destination.id
            ))));
        }

        let key = match breaker_key_for(&attempt.url) {
            Ok(key) => key,
            Err(e) => return Ok(Err(e)),
        };

        Ok(Ok((
            key,
            destination.effective_timeout(self.config.default_timeout),
            destination.effective_retry_delays(&self.config.default_retry_delays),
        )))
    }

    async fn succeed(
        &self,
        attempt: &mut DeliveryAttempt,
        response: TransportResponse,
        duration: Duration,
    ) -> WebhookResult<AttemptOutcome> {
        let now = Utc::now();
        let attempt_number = attempt.attempt_number;
        attempt.mark_success(
            response.status,
            excerpt(&response.body, self.config.response_excerpt_limit),
            now,
        )?;
        self.deliveries.update(attempt).await?;
        self.queue.remove(attempt.id);

        self.deliveries
            .append_record(&AttemptRecord {
                attempt_id: attempt.id,
                attempt_number,
                outcome: RecordOutcome::Success,
                http_status: Some(response.status),
                error: None,
                duration_ms: duration.as_millis() as u64,
                next_attempt_at: None,
                recorded_at: now,
            })
            .await?;
        self.metrics
            .record_attempt(attempt.organization_id, now, true, duration, attempt_number)
            .await;

        tracing::info!(
            target: "webhook_delivery",
            attempt_id = %attempt.id,
            destination_id = %attempt.destination_id,
            organization_id = %attempt.organization_id,
            event_type = %attempt.event_type,
            attempt_number,
            http_status = response.status,
            duration_ms = duration.as_millis() as u64,
            "Webhook delivered"
        );

        self.notifier.notify(DeliveryNotification::WebhookSuccess {
            attempt_id: attempt.id,
            destination_id: attempt.destination_id,
            organization_id: attempt.organization_id,
            attempt_number,
            duration_ms: duration.as_millis() as u64,
        });

        Ok(AttemptOutcome::Succeeded {
            attempt_number,
            http_status: response.status,
        })
    }

    async fn fail(
        &self,
        attempt: &mut DeliveryAttempt,
        error: DeliveryError,
        duration: Duration,
        delays: &[Duration],
    ) -> WebhookResult<AttemptOutcome> {
        let now = Utc::now();
        let tried = attempt.attempt_number;

        if let DeliveryError::CircuitOpen { retry_at, .. } = &error {
            if !self.config.circuit_open_consumes_attempt {
                let next_attempt_at = retry_at.unwrap_or_else(|| {
                    add_duration(
                        now,
                        apply_jitter(retry_delay(delays, tried), self.config.jitter_ratio),
                    )
                });
                attempt.defer(&error, next_attempt_at, now)?;
                self.deliveries.update(attempt).await?;
                self.queue.push(attempt.id, next_attempt_at);
                self.append_failure(attempt.id, tried, &error, duration, Some(next_attempt_at), now)
                    .await?;
                self.metrics
                    .record_attempt(attempt.organization_id, now, false, duration, tried)
                    .await;

                tracing::warn!(
                    target: "webhook_delivery",
                    attempt_id = %attempt.id,
                    destination_id = %attempt.destination_id,
                    attempt_number = tried,
                    next_attempt_at = %next_attempt_at,
                    "Circuit open, delivery deferred"
                );
                return Ok(AttemptOutcome::Deferred {
                    attempt_number: tried,
                    next_attempt_at,
                });
            }
        }

        if attempt.has_attempts_remaining() {
            let delay = apply_jitter(retry_delay(delays, tried), self.config.jitter_ratio);
            let next_attempt_at = add_duration(now, delay);
            attempt.schedule_retry(&error, next_attempt_at, now)?;
            self.deliveries.update(attempt).await?;
            self.queue.push(attempt.id, next_attempt_at);
            self.append_failure(attempt.id, tried, &error, duration, Some(next_attempt_at), now)
                .await?;
            self.metrics
                .record_attempt(attempt.organization_id, now, false, duration, tried)
                .await;

            tracing::warn!(
                target: "webhook_delivery",
                attempt_id = %attempt.id,
                destination_id = %attempt.destination_id,
                attempt_number = tried,
                max_attempts = attempt.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Delivery failed, retry scheduled"
            );
            return Ok(AttemptOutcome::Retrying {
                attempt_number: attempt.attempt_number,
                next_attempt_at,
                error,
            });
        }

        attempt.mark_failed(&error, now)?;
        self.deliveries.update(attempt).await?;
        self.queue.remove(attempt.id);
        self.append_failure(attempt.id, tried, &error, duration, None, now)
            .await?;
        self.metrics
            .record_attempt(attempt.organization_id, now, false, duration, tried)
            .await;

        tracing::error!(
            target: "webhook_delivery",
            attempt_id = %attempt.id,
            destination_id = %attempt.destination_id,
            organization_id = %attempt.organization_id,
            total_attempts = tried,
            error = %error,
            "Delivery failed permanently, retries exhausted"
        );
        self.notify_failed(attempt, tried, &error);

        Ok(AttemptOutcome::Failed {
            total_attempts: tried,
            error,
        })
    }

    /// Configuration errors end the delivery without a retry.
    async fn fail_fatal(
        &self,
        attempt: &mut DeliveryAttempt,
        error: DeliveryError,
    ) -> WebhookResult<AttemptOutcome> {
        let now = Utc::now();
        let tried = attempt.attempt_number;

        attempt.mark_failed(&error, now)?;
        self.deliveries.update(attempt).await?;
        self.queue.remove(attempt.id);
        self.append_failure(attempt.id, tried, &error, Duration::ZERO, None, now)
            .await?;
        self.metrics
            .record_attempt(attempt.organization_id, now, false, Duration::ZERO, tried)
            .await;

        tracing::error!(
            target: "webhook_delivery",
            attempt_id = %attempt.id,
            destination_id = %attempt.destination_id,
            organization_id = %attempt.organization_id,
            error = %error,
            "Delivery failed with configuration error, not retrying"
        );
        self.notify_failed(attempt, tried, &error);

        Ok(AttemptOutcome::Failed {
            total_attempts: tried,
            error,
        })
    }

    async fn append_failure(
        &self,
        attempt_id: AttemptId,
        attempt_number: u32,
        error: &DeliveryError,
        duration: Duration,
        next_attempt_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> WebhookResult<()> {
        self.deliveries
            .append_record(&AttemptRecord {
                attempt_id,
                attempt_number,
                outcome: RecordOutcome::Failed,
                http_status: error.http_status(),
                error: Some(error.to_string()),
                duration_ms: duration.as_millis() as u64,
                next_attempt_at,
                recorded_at: now,
            })
            .await
    }

    fn notify_failed(&self, attempt: &DeliveryAttempt, total_attempts: u32, error: &DeliveryError) {
        self.notifier.notify(DeliveryNotification::WebhookFailed {
            attempt_id: attempt.id,
            destination_id: attempt.destination_id,
            organization_id: attempt.organization_id,
            total_attempts,
            final_error: error.to_string(),
        });
    }
}
