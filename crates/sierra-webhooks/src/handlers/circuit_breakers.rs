//! HTTP handlers for circuit breaker status and reset.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerStats;
use crate::error::{WebhookError, WebhookResult};
use crate::router::WebhooksState;

/// Response containing every registered breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerListResponse {
    pub circuit_breakers: Vec<CircuitBreakerStats>,
    pub total: usize,
}

/// List all circuit breakers, sorted by name.
pub async fn list_circuit_breakers_handler(
    State(state): State<WebhooksState>,
) -> WebhookResult<Json<CircuitBreakerListResponse>> {
    let circuit_breakers = state.registry.statuses().await;
    let total = circuit_breakers.len();

    Ok(Json(CircuitBreakerListResponse {
        circuit_breakers,
        total,
    }))
}

/// Status of a single breaker, keyed by destination host.
pub async fn get_circuit_breaker_handler(
    State(state): State<WebhooksState>,
    Path(name): Path<String>,
) -> WebhookResult<Json<CircuitBreakerStats>> {
    let breaker = state
        .registry
        .get(&name)
        .await
        .ok_or(WebhookError::CircuitBreakerNotFound(name))?;

    Ok(Json(breaker.stats()))
}

/// Force a breaker back to closed with cleared counters.
pub async fn reset_circuit_breaker_handler(
    State(state): State<WebhooksState>,
    Path(name): Path<String>,
) -> WebhookResult<Json<CircuitBreakerStats>> {
    let stats = state.registry.reset(&name).await?;

    tracing::info!(
        target: "circuit_breaker",
        breaker = %name,
        "Circuit breaker reset by operator"
    );

    Ok(Json(stats))
}
