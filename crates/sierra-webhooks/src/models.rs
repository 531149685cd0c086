//! Domain records: destinations, delivery attempts and their history.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sierra_core::{AttemptId, DestinationId, EventId, OrganizationId, OrganizationScoped};

use crate::error::{DeliveryError, WebhookError, WebhookResult};

/// Event type matching every event.
pub const WILDCARD_EVENT: &str = "*";

/// A customer-configured HTTP endpoint receiving event notifications.
///
/// Zero `max_attempts`, an empty `retry_delays_secs` or zero `timeout_ms`
/// mean "use the engine default".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDestination {
    pub id: DestinationId,
    pub organization_id: OrganizationId,
    pub url: String,
    pub event_types: BTreeSet<String>,
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    pub is_active: bool,
    pub max_attempts: u32,
    pub retry_delays_secs: Vec<u64>,
    pub timeout_ms: u64,
    pub headers: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookDestination {
    /// Active destination with engine defaults and no subscriptions.
    pub fn new(organization_id: OrganizationId, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: DestinationId::new(),
            organization_id,
            url: url.into(),
            event_types: BTreeSet::new(),
            secret: None,
            is_active: true,
            max_attempts: 0,
            retry_delays_secs: Vec::new(),
            timeout_ms: 0,
            headers: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types.insert(event_type.into());
        self
    }

    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_retry_delays_secs(mut self, delays: Vec<u64>) -> Self {
        self.retry_delays_secs = delays;
        self
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }

    /// Returns true if this destination wants `event_type`.
    #[must_use]
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.event_types.contains(event_type) || self.event_types.contains(WILDCARD_EVENT)
    }

    /// Circuit breaker name for this destination: `host` or `host:port`.
    ///
    /// Destinations sharing a host share a breaker.
    pub fn breaker_key(&self) -> Result<String, DeliveryError> {
        breaker_key_for(&self.url)
    }

    #[must_use]
    pub fn effective_max_attempts(&self, default: u32) -> u32 {
        if self.max_attempts == 0 {
            default
        } else {
            self.max_attempts
        }
    }

    #[must_use]
    pub fn effective_retry_delays(&self, default: &[Duration]) -> Vec<Duration> {
        if self.retry_delays_secs.is_empty() {
            default.to_vec()
        } else {
            self.retry_delays_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect()
        }
    }

    #[must_use]
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        if self.timeout_ms == 0 {
            default
        } else {
            Duration::from_millis(self.timeout_ms)
        }
    }
}

/// Breaker name for an http(s) URL: lowercase host, plus the port if explicit.
pub fn breaker_key_for(url: &str) -> Result<String, DeliveryError> {
    let parsed = url::Url::parse(url)
        .map_err(|e| DeliveryError::Configuration(format!("invalid destination URL {url:?}: {e}")))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(DeliveryError::Configuration(format!(
            "unsupported URL scheme {:?} in {url:?}",
            parsed.scheme()
        )));
    }

    let host = parsed.host_str().ok_or_else(|| {
        DeliveryError::Configuration(format!("destination URL {url:?} has no host"))
    })?;

    Ok(match parsed.port() {
        Some(port) => format!("{}:{port}", host.to_ascii_lowercase()),
        None => host.to_ascii_lowercase(),
    })
}

impl OrganizationScoped for WebhookDestination {
    fn organization_id(&self) -> OrganizationId {
        self.organization_id
    }
}

/// Delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
}

impl DeliveryStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Input for a new pending delivery.
#[derive(Debug, Clone)]
pub struct CreateDeliveryAttempt {
    pub id: AttemptId,
    pub destination_id: DestinationId,
    pub organization_id: OrganizationId,
    pub event_id: EventId,
    pub event_type: String,
    pub url: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub max_attempts: u32,
}

/// One event delivery to one destination, carried across all of its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: AttemptId,
    pub destination_id: DestinationId,
    pub organization_id: OrganizationId,
    pub event_id: EventId,
    pub event_type: String,
    pub url: String,
    #[serde(skip)]
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub status: DeliveryStatus,
    pub http_status: Option<u16>,
    pub response_excerpt: Option<String>,
    pub error_message: Option<String>,
    /// Set only while pending.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    /// Build the first attempt, due immediately.
    #[must_use]
    pub fn create(input: CreateDeliveryAttempt, now: DateTime<Utc>) -> Self {
        Self {
            id: input.id,
            destination_id: input.destination_id,
            organization_id: input.organization_id,
            event_id: input.event_id,
            event_type: input.event_type,
            url: input.url,
            payload: input.payload,
            headers: input.headers,
            attempt_number: 1,
            max_attempts: input.max_attempts.max(1),
            status: DeliveryStatus::Pending,
            http_status: None,
            response_excerpt: None,
            error_message: None,
            next_attempt_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == DeliveryStatus::Pending
    }

    #[must_use]
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt_number < self.max_attempts
    }

    /// Payload as JSON, or `None` when it is not valid JSON.
    #[must_use]
    pub fn payload_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }

    fn ensure_pending(&self, action: &str) -> WebhookResult<()> {
        if self.is_pending() {
            Ok(())
        } else {
            Err(WebhookError::InvalidTransition {
                attempt_id: self.id,
                reason: format!("cannot {action} a {} delivery", self.status.as_str()),
            })
        }
    }

    /// `pending -> success`.
    pub fn mark_success(
        &mut self,
        http_status: u16,
        response_excerpt: Option<String>,
        now: DateTime<Utc>,
    ) -> WebhookResult<()> {
        self.ensure_pending("complete")?;
        self.status = DeliveryStatus::Success;
        self.http_status = Some(http_status);
        self.response_excerpt = response_excerpt;
        self.error_message = None;
        self.next_attempt_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// `pending -> pending` with the next attempt number.
    pub fn schedule_retry(
        &mut self,
        error: &DeliveryError,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> WebhookResult<()> {
        self.ensure_pending("retry")?;
        if !self.has_attempts_remaining() {
            return Err(WebhookError::InvalidTransition {
                attempt_id: self.id,
                reason: format!(
                    "attempt {} already reached max_attempts {}",
                    self.attempt_number, self.max_attempts
                ),
            });
        }
        self.record_error(error);
        self.attempt_number += 1;
        self.next_attempt_at = Some(next_attempt_at);
        self.updated_at = now;
        Ok(())
    }

    /// Push the current attempt back without spending a retry slot.
    pub fn defer(
        &mut self,
        error: &DeliveryError,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> WebhookResult<()> {
        self.ensure_pending("defer")?;
        self.record_error(error);
        self.next_attempt_at = Some(next_attempt_at);
        self.updated_at = now;
        Ok(())
    }

    /// `pending -> failed`.
    pub fn mark_failed(&mut self, error: &DeliveryError, now: DateTime<Utc>) -> WebhookResult<()> {
        self.ensure_pending("fail")?;
        self.record_error(error);
        self.status = DeliveryStatus::Failed;
        self.next_attempt_at = None;
        self.updated_at = now;
        Ok(())
    }

    fn record_error(&mut self, error: &DeliveryError) {
        self.http_status = error.http_status();
        self.response_excerpt = error.response_excerpt().map(str::to_string);
        self.error_message = Some(error.to_string());
    }
}

impl OrganizationScoped for DeliveryAttempt {
    fn organization_id(&self) -> OrganizationId {
        self.organization_id
    }
}

/// Outcome of a single try.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Success,
    Failed,
}

impl RecordOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// History row written for every try of a delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_id: AttemptId,
    pub attempt_number: u32,
    pub outcome: RecordOutcome,
    pub http_status: Option<u16>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

/// JSON envelope sent to destinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event_id: EventId,
    pub event_type: String,
    pub organization_id: OrganizationId,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}
