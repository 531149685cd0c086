//! Per-organization delivery metrics.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use sierra_core::OrganizationId;

use crate::error::WebhookResult;
use crate::metrics::MetricsReport;
use crate::router::WebhooksState;

pub const DEFAULT_METRICS_DAYS: u32 = 7;
pub const MAX_METRICS_DAYS: u32 = 90;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsQuery {
    pub days: Option<u32>,
}

/// Daily counters for the last `days` days (default 7, clamped to 1..=90).
pub async fn get_metrics_handler(
    State(state): State<WebhooksState>,
    Path(organization_id): Path<OrganizationId>,
    Query(query): Query<MetricsQuery>,
) -> WebhookResult<Json<MetricsReport>> {
    let days = query
        .days
        .unwrap_or(DEFAULT_METRICS_DAYS)
        .clamp(1, MAX_METRICS_DAYS);

    let report = state
        .metrics
        .query(organization_id, days, Utc::now().date_naive())
        .await;

    Ok(Json(report))
}
