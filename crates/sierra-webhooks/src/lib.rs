//! Resilient outbound webhook delivery for Sierra.
//!
//! Business events are fanned out to subscribed destinations as signed
//! HTTP POSTs. Each delivery is persisted as an attempt, retried with
//! jittered backoff, guarded by a per-host circuit breaker and a
//! per-destination rate limiter, and recorded in daily metrics.
//!
//! # Modules
//!
//! - [`dispatcher`] - Event fan-out into pending attempts
//! - [`executor`] - Single-attempt execution and retry policy
//! - [`scheduler`] - Periodic worker pool for due attempts
//! - [`circuit_breaker`] - Per-host breakers and their registry
//! - [`rate_limiter`] - Fixed-window limits per destination
//! - [`store`] - Storage traits with in-memory and PostgreSQL backends
//! - [`router`] - Operator HTTP API

pub mod circuit_breaker;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod rate_limiter;
pub mod router;
pub mod scheduler;
pub mod store;
pub mod transport;

pub use circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerStats, CircuitState,
};
pub use config::{DeliveryConfig, SchedulerConfig, WebhookConfig};
pub use crypto::SignatureSigner;
pub use dispatcher::{DispatchSummary, WebhookDispatcher};
pub use engine::{WebhookEngine, WebhookEngineBuilder};
pub use error::{DeliveryError, WebhookError, WebhookResult};
pub use events::{DeliveryNotification, DeliveryNotifier};
pub use executor::{AttemptExecutor, AttemptOutcome};
pub use metrics::{DailyDeliveryMetrics, MetricsRecorder, MetricsReport};
pub use models::{AttemptRecord, DeliveryAttempt, DeliveryStatus, WebhookDestination, WebhookPayload};
pub use queue::RetryQueue;
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use router::{webhooks_router, WebhooksState};
pub use scheduler::RetryScheduler;
pub use store::{DeliveryStore, DestinationStore, InMemoryStore, MetricsSink, PgWebhookStore};
pub use transport::{HttpTransport, OutboundRequest, Transport, TransportResponse};
