//! Error types for the webhook engine.
//!
//! [`DeliveryError`] classifies why a single delivery try did not succeed and
//! drives the retry decision. [`WebhookError`] covers everything else: store
//! failures, configuration problems and operator API errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use sierra_core::{AttemptId, DestinationId, OrganizationId};

/// Why a delivery try failed, or why it was never made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// No response was received.
    #[error("Network error: {0}")]
    Network(String),

    /// The destination answered with a non-2xx status.
    #[error("HTTP {status}")]
    Http { status: u16, body: String },

    /// The request did not complete within the allotted time.
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The destination's circuit breaker rejected the call; no request was sent.
    #[error("Circuit breaker open for {name}")]
    CircuitOpen {
        name: String,
        retry_at: Option<chrono::DateTime<chrono::Utc>>,
    },

    /// Scheduling was rejected by the rate limiter.
    #[error("Rate limit exceeded for destination {destination_id} of organization {organization_id}")]
    RateLimitExceeded {
        organization_id: OrganizationId,
        destination_id: DestinationId,
    },

    /// Destination missing or invalid. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl DeliveryError {
    /// Returns true if the failure should consume a retry slot and reschedule.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Http { .. } | Self::Timeout { .. } | Self::CircuitOpen { .. }
        )
    }

    /// HTTP status code, if a response was received.
    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Truncated response body, if a response was received.
    #[must_use]
    pub fn response_excerpt(&self) -> Option<&str> {
        match self {
            Self::Http { body, .. } if !body.is_empty() => Some(body.as_str()),
            _ => None,
        }
    }
}

/// Webhook engine error variants.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Delivery attempt not found: {0}")]
    AttemptNotFound(AttemptId),

    #[error("Destination not found: {0}")]
    DestinationNotFound(DestinationId),

    #[error("Circuit breaker not found: {0}")]
    CircuitBreakerNotFound(String),

    #[error("Invalid state transition for attempt {attempt_id}: {reason}")]
    InvalidTransition { attempt_id: AttemptId, reason: String },

    #[error("Configuration missing: {var}")]
    ConfigMissing { var: String },

    #[error("Configuration invalid for {var}: {reason}")]
    ConfigInvalid { var: String, reason: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// JSON error response returned by operator API endpoints.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            WebhookError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            WebhookError::Migration(_) => (StatusCode::INTERNAL_SERVER_ERROR, "migration_error"),
            WebhookError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "serialization_error")
            }
            WebhookError::AttemptNotFound(_) => (StatusCode::NOT_FOUND, "attempt_not_found"),
            WebhookError::DestinationNotFound(_) => {
                (StatusCode::NOT_FOUND, "destination_not_found")
            }
            WebhookError::CircuitBreakerNotFound(_) => {
                (StatusCode::NOT_FOUND, "circuit_breaker_not_found")
            }
            WebhookError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            WebhookError::ConfigMissing { .. } | WebhookError::ConfigInvalid { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "configuration_error")
            }
            WebhookError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            WebhookError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
            status: status.as_u16(),
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type WebhookResult<T> = Result<T, WebhookError>;
