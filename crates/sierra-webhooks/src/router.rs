//! Axum router setup for the operator API.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::handlers::{circuit_breakers, deliveries, health, metrics};
use crate::metrics::MetricsRecorder;
use crate::queue::RetryQueue;
use crate::store::DeliveryStore;

/// Shared state for operator handlers.
#[derive(Clone)]
pub struct WebhooksState {
    pub registry: CircuitBreakerRegistry,
    pub deliveries: Arc<dyn DeliveryStore>,
    pub metrics: Arc<MetricsRecorder>,
    pub queue: Arc<RetryQueue>,
}

impl WebhooksState {
    pub fn new(
        registry: CircuitBreakerRegistry,
        deliveries: Arc<dyn DeliveryStore>,
        metrics: Arc<MetricsRecorder>,
        queue: Arc<RetryQueue>,
    ) -> Self {
        Self {
            registry,
            deliveries,
            metrics,
            queue,
        }
    }
}

/// Creates the operator router with all routes.
pub fn webhooks_router(state: WebhooksState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Circuit breakers
        .route(
            "/webhooks/circuit-breakers",
            get(circuit_breakers::list_circuit_breakers_handler),
        )
        .route(
            "/webhooks/circuit-breakers/:name",
            get(circuit_breakers::get_circuit_breaker_handler),
        )
        .route(
            "/webhooks/circuit-breakers/:name/reset",
            post(circuit_breakers::reset_circuit_breaker_handler),
        )
        // Delivery history
        .route(
            "/webhooks/organizations/:org_id/deliveries/:attempt_id",
            get(deliveries::get_delivery_handler),
        )
        // Metrics
        .route(
            "/webhooks/organizations/:org_id/metrics",
            get(metrics::get_metrics_handler),
        )
        .with_state(state)
}
