//! Database query functions for the `metrics` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{AlertSeverity, MetricType, SystemMetric};

/// Parameters for inserting a new system metric sample.
#[derive(Debug, Clone)]
pub struct NewSystemMetric {
    pub system_id: String,
    pub metric_name: String,
    pub metric_type: MetricType,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub unit: String,
    pub data_quality_score: f64,
    pub warning_threshold: Option<f64>,
    pub critical_threshold: Option<f64>,
    pub threshold_breached: bool,
    pub alert_severity: Option<AlertSeverity>,
    pub is_outlier: bool,
    pub service_name: Option<String>,
    pub environment: Option<String>,
}

/// Insert a single metric sample.
pub async fn insert(pool: &PgPool, m: &NewSystemMetric) -> Result<SystemMetric> {
    let row = sqlx::query_as::<_, SystemMetric>(
        "INSERT INTO metrics \
            (system_id, metric_name, metric_type, \"timestamp\", value, unit, \
             data_quality_score, warning_threshold, critical_threshold, \
             threshold_breached, alert_severity, is_outlier, service_name, environment) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
         RETURNING *",
    )
    .bind(&m.system_id)
    .bind(&m.metric_name)
    .bind(m.metric_type)
    .bind(m.timestamp)
    .bind(m.value)
    .bind(&m.unit)
    .bind(m.data_quality_score)
    .bind(m.warning_threshold)
    .bind(m.critical_threshold)
    .bind(m.threshold_breached)
    .bind(m.alert_severity)
    .bind(m.is_outlier)
    .bind(&m.service_name)
    .bind(&m.environment)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert metric for system {}", m.system_id))?;

    Ok(row)
}

/// Insert a batch of metric samples in one round trip. Order of the
/// returned rows matches the input order.
pub async fn insert_batch(pool: &PgPool, metrics: &[NewSystemMetric]) -> Result<Vec<SystemMetric>> {
    let mut rows = Vec::with_capacity(metrics.len());
    for m in metrics {
        rows.push(insert(pool, m).await?);
    }
    Ok(rows)
}

/// The most recent `n` values recorded for `(system_id, metric_name)` in the
/// last 24 hours, newest first -- the sample an outlier check draws its
/// baseline from.
pub async fn recent_values(
    pool: &PgPool,
    system_id: &str,
    metric_name: &str,
    since: DateTime<Utc>,
    n: i64,
) -> Result<Vec<f64>> {
    let rows: Vec<(f64,)> = sqlx::query_as(
        "SELECT value FROM metrics \
         WHERE system_id = $1 AND metric_name = $2 AND \"timestamp\" >= $3 \
         ORDER BY \"timestamp\" DESC \
         LIMIT $4",
    )
    .bind(system_id)
    .bind(metric_name)
    .bind(since)
    .bind(n)
    .fetch_all(pool)
    .await
    .context("failed to fetch recent metric values")?;
    Ok(rows.into_iter().map(|(v,)| v).collect())
}

/// Fetch samples for an agent/system in `[since, until]`, ordered oldest
/// first.
pub async fn list_in_range(
    pool: &PgPool,
    system_id: &str,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<SystemMetric>> {
    let rows = sqlx::query_as::<_, SystemMetric>(
        "SELECT * FROM metrics \
         WHERE system_id = $1 AND \"timestamp\" BETWEEN $2 AND $3 \
         ORDER BY \"timestamp\" ASC",
    )
    .bind(system_id)
    .bind(since)
    .bind(until)
    .fetch_all(pool)
    .await
    .context("failed to list metrics in range")?;
    Ok(rows)
}
