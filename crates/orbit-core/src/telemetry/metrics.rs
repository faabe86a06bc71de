//! System Metrics Ingestor (C12): validation, data-quality scoring, outlier
//! detection, and threshold-breach alerting for a single inbound metric
//! sample.
//!
//! Default warning/critical thresholds are only defined for the metric
//! kinds the distilled contract names explicitly; kinds without a default
//! (`disk_io`, `network_io`, `throughput`, `uptime`, `custom`) are recorded
//! without a threshold check unless the caller supplies its own.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

use orbit_db::models::{AlertSeverity, MetricType};
use orbit_db::queries::metrics::{self, NewSystemMetric};

use crate::clock::Clock;
use crate::error::{CoreError, ErrCtx};

/// How far back an outlier check's sample window reaches.
pub const OUTLIER_LOOKBACK: Duration = Duration::hours(24);
/// How many recent same-name samples an outlier check draws from.
pub const OUTLIER_SAMPLE_SIZE: i64 = 100;
/// Minimum sample size below which an outlier verdict can't be trusted.
pub const OUTLIER_MIN_SAMPLES: usize = 10;

/// `(warning, critical)` default thresholds for the metric kinds this
/// system reasons about out of the box. Percentages are in `0..=100`;
/// `response_time` is in milliseconds.
fn default_thresholds(metric_type: MetricType) -> Option<(f64, f64)> {
    match metric_type {
        MetricType::CpuUsage => Some((80.0, 95.0)),
        MetricType::MemoryUsage => Some((85.0, 95.0)),
        MetricType::DiskUsage => Some((85.0, 95.0)),
        MetricType::ResponseTime => Some((2000.0, 5000.0)),
        _ => None,
    }
}

/// Completeness/sanity-based data quality score, starting at `1.0` and
/// deducted for specific defects, floored at `0.0`:
/// - `-0.5` if a `cpu_usage` value falls outside `[0, 100]`
/// - `-0.3` if a `memory_usage` value is negative
/// - `-0.2` if the sample's timestamp is more than an hour old
pub fn quality_score(metric_type: MetricType, value: f64, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let mut score = 1.0_f64;
    if metric_type == MetricType::CpuUsage && !(0.0..=100.0).contains(&value) {
        score -= 0.5;
    }
    if metric_type == MetricType::MemoryUsage && value < 0.0 {
        score -= 0.3;
    }
    if now - timestamp > Duration::hours(1) {
        score -= 0.2;
    }
    score.max(0.0)
}

/// Threshold check result: whether the default warning/critical threshold
/// for this metric kind was breached, and at what severity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdCheck {
    pub breached: bool,
    pub severity: Option<AlertSeverity>,
    pub warning_threshold: Option<f64>,
    pub critical_threshold: Option<f64>,
}

/// Compare a value against this metric kind's default thresholds.
/// Breached at `Warning` once `value >= warning`, escalated to `Critical`
/// once it also clears `critical`. Metric kinds without a default
/// threshold never breach.
pub fn check_thresholds(metric_type: MetricType, value: f64) -> ThresholdCheck {
    let Some((warning, critical)) = default_thresholds(metric_type) else {
        return ThresholdCheck {
            breached: false,
            severity: None,
            warning_threshold: None,
            critical_threshold: None,
        };
    };

    if value >= critical {
        ThresholdCheck {
            breached: true,
            severity: Some(AlertSeverity::Critical),
            warning_threshold: Some(warning),
            critical_threshold: Some(critical),
        }
    } else if value >= warning {
        ThresholdCheck {
            breached: true,
            severity: Some(AlertSeverity::Warning),
            warning_threshold: Some(warning),
            critical_threshold: Some(critical),
        }
    } else {
        ThresholdCheck {
            breached: false,
            severity: None,
            warning_threshold: Some(warning),
            critical_threshold: Some(critical),
        }
    }
}

/// IQR-based outlier check over up to [`OUTLIER_SAMPLE_SIZE`] same-name
/// samples from the last [`OUTLIER_LOOKBACK`]. Returns `false` with fewer
/// than [`OUTLIER_MIN_SAMPLES`] points -- too thin a baseline to call.
pub fn is_outlier(value: f64, recent: &[f64]) -> bool {
    if recent.len() < OUTLIER_MIN_SAMPLES {
        return false;
    }
    let mut sorted = recent.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("metric values are never NaN"));

    let q1 = percentile(&sorted, 0.25);
    let q3 = percentile(&sorted, 0.75);
    let iqr = q3 - q1;
    let lower = q1 - 1.5 * iqr;
    let upper = q3 + 1.5 * iqr;
    value < lower || value > upper
}

/// Linear-interpolation percentile over an already-sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p * (sorted.len() - 1) as f64;
    let lower_idx = rank.floor() as usize;
    let upper_idx = rank.ceil() as usize;
    if lower_idx == upper_idx {
        sorted[lower_idx]
    } else {
        let frac = rank - lower_idx as f64;
        sorted[lower_idx] + frac * (sorted[upper_idx] - sorted[lower_idx])
    }
}

/// A single metric sample pending ingestion.
#[derive(Debug, Clone)]
pub struct NewMetricSample {
    pub system_id: String,
    pub metric_name: String,
    pub metric_type: MetricType,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub unit: Option<String>,
    pub service_name: Option<String>,
    pub environment: Option<String>,
}

/// Result of ingesting one metric sample.
#[derive(Debug, Clone)]
pub struct MetricIngestResult {
    pub metric_id: i64,
    pub data_quality_score: f64,
    pub threshold_breached: bool,
    pub alert_severity: Option<AlertSeverity>,
    pub is_outlier: bool,
}

/// Score, threshold-check, outlier-check, and persist a single metric
/// sample.
pub async fn ingest(pool: &PgPool, clock: &dyn Clock, sample: NewMetricSample) -> Result<MetricIngestResult, CoreError> {
    let now = clock.now();
    let unit = sample.unit.clone().unwrap_or_else(|| sample.metric_type.default_unit().to_string());

    let since = now - OUTLIER_LOOKBACK;
    let recent = metrics::recent_values(pool, &sample.system_id, &sample.metric_name, since, OUTLIER_SAMPLE_SIZE)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::default()))?;
    let outlier = is_outlier(sample.value, &recent);

    let quality = quality_score(sample.metric_type, sample.value, sample.timestamp, now);
    let thresholds = check_thresholds(sample.metric_type, sample.value);

    let row = metrics::insert(
        pool,
        &NewSystemMetric {
            system_id: sample.system_id,
            metric_name: sample.metric_name,
            metric_type: sample.metric_type,
            timestamp: sample.timestamp,
            value: sample.value,
            unit,
            data_quality_score: quality,
            warning_threshold: thresholds.warning_threshold,
            critical_threshold: thresholds.critical_threshold,
            threshold_breached: thresholds.breached,
            alert_severity: thresholds.severity,
            is_outlier: outlier,
            service_name: sample.service_name,
            environment: sample.environment,
        },
    )
    .await
    .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::default()))?;

    Ok(MetricIngestResult {
        metric_id: row.id,
        data_quality_score: quality,
        threshold_breached: thresholds.breached,
        alert_severity: thresholds.severity,
        is_outlier: outlier,
    })
}

/// Maximum samples accepted in one `POST /telemetry/batch` request.
pub const MAX_BATCH_METRICS: usize = 5000;

/// Ingest a batch of metric samples, rejecting the whole batch up front if
/// it exceeds [`MAX_BATCH_METRICS`].
pub async fn ingest_batch(
    pool: &PgPool,
    clock: &dyn Clock,
    samples: Vec<NewMetricSample>,
) -> Result<Vec<MetricIngestResult>, CoreError> {
    if samples.len() > MAX_BATCH_METRICS {
        return Err(CoreError::validation(
            format!("batch of {} metrics exceeds the limit of {MAX_BATCH_METRICS}", samples.len()),
            ErrCtx::default(),
        ));
    }
    let mut results = Vec::with_capacity(samples.len());
    for sample in samples {
        results.push(ingest(pool, clock, sample).await?);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_score_starts_perfect() {
        let now: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().unwrap();
        assert_eq!(quality_score(MetricType::Throughput, 500.0, now, now), 1.0);
    }

    #[test]
    fn quality_score_penalizes_cpu_out_of_range() {
        let now: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().unwrap();
        assert_eq!(quality_score(MetricType::CpuUsage, 150.0, now, now), 0.5);
    }

    #[test]
    fn quality_score_penalizes_negative_memory() {
        let now: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().unwrap();
        assert_eq!(quality_score(MetricType::MemoryUsage, -1.0, now, now), 0.7);
    }

    #[test]
    fn quality_score_penalizes_stale_timestamp() {
        let ts: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().unwrap();
        let now = ts + Duration::hours(2);
        assert_eq!(quality_score(MetricType::Throughput, 1.0, ts, now), 0.8);
    }

    #[test]
    fn quality_score_penalties_stack() {
        let ts: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().unwrap();
        let now = ts + Duration::hours(2);
        assert_eq!(quality_score(MetricType::CpuUsage, -10.0, ts, now), 0.3);
    }

    #[test]
    fn cpu_thresholds_escalate_to_critical() {
        assert_eq!(check_thresholds(MetricType::CpuUsage, 50.0).severity, None);
        assert!(!check_thresholds(MetricType::CpuUsage, 50.0).breached);
        assert_eq!(
            check_thresholds(MetricType::CpuUsage, 80.0).severity,
            Some(AlertSeverity::Warning)
        );
        assert_eq!(
            check_thresholds(MetricType::CpuUsage, 95.0).severity,
            Some(AlertSeverity::Critical)
        );
    }

    #[test]
    fn metric_kinds_without_defaults_never_breach() {
        let check = check_thresholds(MetricType::Throughput, 1_000_000.0);
        assert!(!check.breached);
        assert_eq!(check.severity, None);
    }

    #[test]
    fn outlier_requires_minimum_sample_size() {
        let recent = vec![1.0; 5];
        assert!(!is_outlier(1000.0, &recent));
    }

    #[test]
    fn outlier_detects_value_outside_iqr_fence() {
        let mut recent: Vec<f64> = (0..20).map(|i| i as f64).collect();
        assert!(!is_outlier(10.0, &recent));
        recent.push(10.0);
        assert!(is_outlier(1000.0, &recent));
    }
}
