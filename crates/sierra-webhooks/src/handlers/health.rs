//! Liveness probe.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::router::WebhooksState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub queue_depth: usize,
}

pub async fn health_handler(State(state): State<WebhooksState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        queue_depth: state.queue.len(),
    })
}
