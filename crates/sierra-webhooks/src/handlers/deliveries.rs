//! Delivery attempt inspection.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use sierra_core::{AttemptId, OrganizationId};

use crate::error::{WebhookError, WebhookResult};
use crate::models::{AttemptRecord, DeliveryAttempt};
use crate::router::WebhooksState;

/// An attempt with its parsed payload and full attempt history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryDetailResponse {
    #[serde(flatten)]
    pub attempt: DeliveryAttempt,
    pub payload: Option<serde_json::Value>,
    pub records: Vec<AttemptRecord>,
}

pub async fn get_delivery_handler(
    State(state): State<WebhooksState>,
    Path((organization_id, attempt_id)): Path<(OrganizationId, AttemptId)>,
) -> WebhookResult<Json<DeliveryDetailResponse>> {
    // Attempts of other organizations are reported as missing.
    let attempt = state
        .deliveries
        .find_by_id(attempt_id)
        .await?
        .filter(|a| a.organization_id == organization_id)
        .ok_or(WebhookError::AttemptNotFound(attempt_id))?;

    let records = state.deliveries.list_records(attempt_id).await?;
    let payload = attempt.payload_json();

    Ok(Json(DeliveryDetailResponse {
        attempt,
        payload,
        records,
    }))
}
