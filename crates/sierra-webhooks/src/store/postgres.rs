//! PostgreSQL persistence.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sierra_core::{AttemptId, DestinationId, EventId, OrganizationId};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{DeliveryStore, DestinationStore, MetricsSink};
use crate::error::{WebhookError, WebhookResult};
use crate::metrics::MetricsDelta;
use crate::models::{
    AttemptRecord, DeliveryAttempt, DeliveryStatus, RecordOutcome, WebhookDestination,
};

/// Run all pending migrations embedded from `migrations/`.
///
/// # Errors
///
/// Returns `WebhookError::Migration` if any migration fails to apply.
pub async fn run_migrations(pool: &PgPool) -> WebhookResult<()> {
    tracing::info!("Running webhook database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Webhook migrations completed successfully");
    Ok(())
}

/// Store backed by a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PgWebhookStore {
    pool: PgPool,
}

impl PgWebhookStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, FromRow)]
struct DestinationRow {
    id: Uuid,
    organization_id: Uuid,
    url: String,
    event_types: Vec<String>,
    secret: Option<String>,
    is_active: bool,
    max_attempts: i32,
    retry_delays_secs: Vec<i64>,
    timeout_ms: i64,
    headers: Json<BTreeMap<String, String>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DestinationRow> for WebhookDestination {
    fn from(row: DestinationRow) -> Self {
        Self {
            id: DestinationId::from_uuid(row.id),
            organization_id: OrganizationId::from_uuid(row.organization_id),
            url: row.url,
            event_types: row.event_types.into_iter().collect::<BTreeSet<_>>(),
            secret: row.secret,
            is_active: row.is_active,
            max_attempts: u32::try_from(row.max_attempts).unwrap_or(0),
            retry_delays_secs: row
                .retry_delays_secs
                .into_iter()
                .filter_map(|s| u64::try_from(s).ok())
                .collect(),
            timeout_ms: u64::try_from(row.timeout_ms).unwrap_or(0),
            headers: row.headers.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct AttemptRow {
    id: Uuid,
    destination_id: Uuid,
    organization_id: Uuid,
    event_id: Uuid,
    event_type: String,
    url: String,
    payload: Vec<u8>,
    headers: Json<BTreeMap<String, String>>,
    attempt_number: i32,
    max_attempts: i32,
    status: String,
    http_status: Option<i32>,
    response_excerpt: Option<String>,
    error_message: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AttemptRow> for DeliveryAttempt {
    type Error = WebhookError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        let status = DeliveryStatus::parse(&row.status).ok_or_else(|| {
            WebhookError::Internal(format!(
                "unknown delivery status {:?} for attempt {}",
                row.status, row.id
            ))
        })?;

        Ok(Self {
            id: AttemptId::from_uuid(row.id),
            destination_id: DestinationId::from_uuid(row.destination_id),
            organization_id: OrganizationId::from_uuid(row.organization_id),
            event_id: EventId::from_uuid(row.event_id),
            event_type: row.event_type,
            url: row.url,
            payload: row.payload,
            headers: row.headers.0,
            attempt_number: u32::try_from(row.attempt_number).unwrap_or(1),
            max_attempts: u32::try_from(row.max_attempts).unwrap_or(1),
            status,
            http_status: row.http_status.and_then(|s| u16::try_from(s).ok()),
            response_excerpt: row.response_excerpt,
            error_message: row.error_message,
            next_attempt_at: row.next_attempt_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct RecordRow {
    attempt_id: Uuid,
    attempt_number: i32,
    outcome: String,
    http_status: Option<i32>,
    error: Option<String>,
    duration_ms: i64,
    next_attempt_at: Option<DateTime<Utc>>,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<RecordRow> for AttemptRecord {
    type Error = WebhookError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let outcome = RecordOutcome::parse(&row.outcome).ok_or_else(|| {
            WebhookError::Internal(format!("unknown attempt outcome {:?}", row.outcome))
        })?;

        Ok(Self {
            attempt_id: AttemptId::from_uuid(row.attempt_id),
            attempt_number: u32::try_from(row.attempt_number).unwrap_or(1),
            outcome,
            http_status: row.http_status.and_then(|s| u16::try_from(s).ok()),
            error: row.error,
            duration_ms: u64::try_from(row.duration_ms).unwrap_or(0),
            next_attempt_at: row.next_attempt_at,
            recorded_at: row.recorded_at,
        })
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl DestinationStore for PgWebhookStore {
    async fn find_active_for_event(
        &self,
        organization_id: OrganizationId,
        event_type: &str,
        destination_id: Option<DestinationId>,
    ) -> WebhookResult<Vec<WebhookDestination>> {
        let rows: Vec<DestinationRow> = sqlx::query_as(
            r#"
            SELECT * FROM webhook_destinations
            WHERE organization_id = $1
              AND is_active
              AND ($2 = ANY(event_types) OR '*' = ANY(event_types))
              AND ($3::uuid IS NULL OR id = $3)
            ORDER BY created_at, id
            "#,
        )
        .bind(organization_id.into_uuid())
        .bind(event_type)
        .bind(destination_id.map(DestinationId::into_uuid))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(WebhookDestination::from).collect())
    }

    async fn find_by_id(&self, id: DestinationId) -> WebhookResult<Option<WebhookDestination>> {
        let row: Option<DestinationRow> =
            sqlx::query_as("SELECT * FROM webhook_destinations WHERE id = $1")
                .bind(id.into_uuid())
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(WebhookDestination::from))
    }
}

#[async_trait]
impl DeliveryStore for PgWebhookStore {
    async fn insert(&self, attempt: &DeliveryAttempt) -> WebhookResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_delivery_attempts (
                id, destination_id, organization_id, event_id, event_type, url,
                payload, headers, attempt_number, max_attempts, status,
                http_status, response_excerpt, error_message, next_attempt_at,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(attempt.id.into_uuid())
        .bind(attempt.destination_id.into_uuid())
        .bind(attempt.organization_id.into_uuid())
        .bind(attempt.event_id.into_uuid())
        .bind(&attempt.event_type)
        .bind(&attempt.url)
        .bind(&attempt.payload)
        .bind(Json(&attempt.headers))
        .bind(to_i32(attempt.attempt_number))
        .bind(to_i32(attempt.max_attempts))
        .bind(attempt.status.as_str())
        .bind(attempt.http_status.map(i32::from))
        .bind(&attempt.response_excerpt)
        .bind(&attempt.error_message)
        .bind(attempt.next_attempt_at)
        .bind(attempt.created_at)
        .bind(attempt.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, attempt: &DeliveryAttempt) -> WebhookResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_delivery_attempts
            SET attempt_number = $2,
                status = $3,
                http_status = $4,
                response_excerpt = $5,
                error_message = $6,
                next_attempt_at = $7,
                updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(attempt.id.into_uuid())
        .bind(to_i32(attempt.attempt_number))
        .bind(attempt.status.as_str())
        .bind(attempt.http_status.map(i32::from))
        .bind(&attempt.response_excerpt)
        .bind(&attempt.error_message)
        .bind(attempt.next_attempt_at)
        .bind(attempt.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WebhookError::AttemptNotFound(attempt.id));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: AttemptId) -> WebhookResult<Option<DeliveryAttempt>> {
        let row: Option<AttemptRow> =
            sqlx::query_as("SELECT * FROM webhook_delivery_attempts WHERE id = $1")
                .bind(id.into_uuid())
                .fetch_optional(&self.pool)
                .await?;

        row.map(DeliveryAttempt::try_from).transpose()
    }

    async fn list_pending(&self, limit: usize) -> WebhookResult<Vec<DeliveryAttempt>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(
            r#"
            SELECT * FROM webhook_delivery_attempts
            WHERE status = 'pending'
            ORDER BY next_attempt_at ASC, created_at ASC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeliveryAttempt::try_from).collect()
    }

    async fn append_record(&self, record: &AttemptRecord) -> WebhookResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_attempt_records (
                attempt_id, attempt_number, outcome, http_status, error,
                duration_ms, next_attempt_at, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.attempt_id.into_uuid())
        .bind(to_i32(record.attempt_number))
        .bind(record.outcome.as_str())
        .bind(record.http_status.map(i32::from))
        .bind(&record.error)
        .bind(to_i64(record.duration_ms))
        .bind(record.next_attempt_at)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_records(&self, attempt_id: AttemptId) -> WebhookResult<Vec<AttemptRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            r#"
            SELECT attempt_id, attempt_number, outcome, http_status, error,
                   duration_ms, next_attempt_at, recorded_at
            FROM webhook_attempt_records
            WHERE attempt_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(attempt_id.into_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AttemptRecord::try_from).collect()
    }
}

#[async_trait]
impl MetricsSink for PgWebhookStore {
    async fn increment(
        &self,
        organization_id: OrganizationId,
        date: NaiveDate,
        delta: &MetricsDelta,
    ) -> WebhookResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_delivery_metrics_daily (
                organization_id, day, total, success, failed, rate_limited,
                summed_duration_ms, attempt_histogram
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7,
                CASE WHEN $8::int IS NULL THEN '{}'::jsonb
                     ELSE jsonb_build_object($8::int::text, 1) END
            )
            ON CONFLICT (organization_id, day)
            DO UPDATE SET
                total = webhook_delivery_metrics_daily.total + EXCLUDED.total,
                success = webhook_delivery_metrics_daily.success + EXCLUDED.success,
                failed = webhook_delivery_metrics_daily.failed + EXCLUDED.failed,
                rate_limited = webhook_delivery_metrics_daily.rate_limited + EXCLUDED.rate_limited,
                summed_duration_ms = webhook_delivery_metrics_daily.summed_duration_ms
                    + EXCLUDED.summed_duration_ms,
                attempt_histogram = CASE
                    WHEN $8::int IS NULL THEN webhook_delivery_metrics_daily.attempt_histogram
                    ELSE jsonb_set(
                        webhook_delivery_metrics_daily.attempt_histogram,
                        ARRAY[$8::int::text],
                        to_jsonb(
                            COALESCE(
                                (webhook_delivery_metrics_daily.attempt_histogram ->> ($8::int::text))::bigint,
                                0
                            ) + 1
                        )
                    )
                END
            "#,
        )
        .bind(organization_id.into_uuid())
        .bind(date)
        .bind(to_i64(delta.total))
        .bind(to_i64(delta.success))
        .bind(to_i64(delta.failed))
        .bind(to_i64(delta.rate_limited))
        .bind(to_i64(delta.duration_ms))
        .bind(delta.attempt_number.map(to_i32))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_row_conversion() {
        let now = Utc::now();
        let row = DestinationRow {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            url: "https://hooks.example.com".into(),
            event_types: vec!["deal.won".into(), "deal.won".into(), "*".into()],
            secret: Some("s".into()),
            is_active: true,
            max_attempts: -1,
            retry_delays_secs: vec![1, -5, 25],
            timeout_ms: 2500,
            headers: Json(BTreeMap::from([("X-Team".to_string(), "crm".to_string())])),
            created_at: now,
            updated_at: now,
        };

        let d = WebhookDestination::from(row);
        assert_eq!(d.event_types.len(), 2);
        assert_eq!(d.max_attempts, 0);
        assert_eq!(d.retry_delays_secs, vec![1, 25]);
        assert_eq!(d.timeout_ms, 2500);
        assert_eq!(d.headers.get("X-Team").map(String::as_str), Some("crm"));
    }

    #[test]
    fn test_attempt_row_rejects_unknown_status() {
        let now = Utc::now();
        let row = AttemptRow {
            id: Uuid::new_v4(),
            destination_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            event_type: "deal.won".into(),
            url: "https://hooks.example.com".into(),
            payload: b"{}".to_vec(),
            headers: Json(BTreeMap::new()),
            attempt_number: 1,
            max_attempts: 3,
            status: "archived".into(),
            http_status: None,
            response_excerpt: None,
            error_message: None,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
        };
        assert!(DeliveryAttempt::try_from(row).is_err());
    }

    #[test]
    fn test_integer_conversions_saturate() {
        assert_eq!(to_i32(u32::MAX), i32::MAX);
        assert_eq!(to_i64(7), 7);
    }
}
