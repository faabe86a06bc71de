//! Heartbeat Ingestor (C10): validation, derived health scoring, adaptive
//! timeout, and alerting for a single inbound heartbeat.
//!
//! Subscore thresholds and the adaptive timeout formula are reproduced
//! verbatim from the distilled contract; boundary inclusivity (`<=` at
//! every stated cut point) follows the convention used throughout the
//! original Python service's threshold checks, documented per function
//! below where it isn't self-evident from the formula.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

pub use orbit_db::models::AlertSeverity;
use orbit_db::models::{Heartbeat, HealthStatus};
use orbit_db::queries::heartbeats::{self, NewHeartbeat};

use crate::clock::Clock;
use crate::error::{CoreError, ErrCtx};

/// How many recent heartbeats feed the adaptive timeout's inter-arrival
/// sample.
pub const ADAPTIVE_TIMEOUT_SAMPLE_SIZE: i64 = 10;

/// Per-metric subscores feeding the weighted-mean composite health score.
#[derive(Debug, Clone, Copy)]
pub struct Subscores {
    pub cpu: f64,
    pub memory: f64,
    pub net_latency: f64,
    pub error_rate: Option<f64>,
}

impl Subscores {
    /// The subset of subscores that are actually available (`error_rate`
    /// is absent when `request_count == 0`, since the ratio is undefined).
    fn available(&self) -> Vec<f64> {
        let mut v = vec![self.cpu, self.memory, self.net_latency];
        if let Some(er) = self.error_rate {
            v.push(er);
        }
        v
    }

    /// `score = 100 * mean(available subscores)`.
    pub fn composite_score(&self) -> f64 {
        let values = self.available();
        100.0 * values.iter().sum::<f64>() / values.len() as f64
    }
}

/// `cpu`: 1.0 if `<=80%`, 0.5 if `80-95%`, 0.0 if `>95%`.
pub fn cpu_subscore(cpu_usage_percent: f64) -> f64 {
    if cpu_usage_percent <= 80.0 {
        1.0
    } else if cpu_usage_percent <= 95.0 {
        0.5
    } else {
        0.0
    }
}

/// `memory`: 1.0 if `<=85%`, 0.5 if `85-95%`, 0.0 if `>95%`.
pub fn memory_subscore(memory_usage_percent: f64) -> f64 {
    if memory_usage_percent <= 85.0 {
        1.0
    } else if memory_usage_percent <= 95.0 {
        0.5
    } else {
        0.0
    }
}

/// `net_latency`: 1.0 if `<=300ms`, 0.5 if `300-1000ms`, 0.0 if `>1000ms`.
pub fn net_latency_subscore(network_latency_ms: f64) -> f64 {
    if network_latency_ms <= 300.0 {
        1.0
    } else if network_latency_ms <= 1000.0 {
        0.5
    } else {
        0.0
    }
}

/// `error_rate` (errors/requests over the heartbeat window): 1.0 if
/// `<=1%`, 0.5 if `1-5%`, 0.0 if `>5%`. `None` when `request_count == 0`,
/// since the ratio is undefined -- excluded from the mean rather than
/// treated as a perfect or zero score.
pub fn error_rate_subscore(request_count: i64, error_count: i64) -> Option<f64> {
    if request_count <= 0 {
        return None;
    }
    let rate_percent = 100.0 * error_count as f64 / request_count as f64;
    Some(if rate_percent <= 1.0 {
        1.0
    } else if rate_percent <= 5.0 {
        0.5
    } else {
        0.0
    })
}

/// `status = healthy if score >= 85, degraded if 70-85, critical if <70`.
/// `offline` is never returned here -- it is set externally by the Uptime
/// Analyzer when no heartbeat has arrived within the adaptive timeout.
pub fn health_status_for_score(score: f64) -> HealthStatus {
    if score >= 85.0 {
        HealthStatus::Healthy
    } else if score >= 70.0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Critical
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub subscore: Option<&'static str>,
    pub message: String,
}

/// One alert per subscore that bottomed out at `0.0`, plus one alert if
/// the composite score crosses into `critical`.
pub fn generate_alerts(subscores: &Subscores, status: HealthStatus) -> Vec<Alert> {
    let mut alerts = Vec::new();

    let zeroed = [
        ("cpu", subscores.cpu),
        ("memory", subscores.memory),
        ("net_latency", subscores.net_latency),
    ];
    for (name, value) in zeroed {
        if value == 0.0 {
            alerts.push(Alert {
                severity: AlertSeverity::Error,
                subscore: Some(name),
                message: format!("{name} subscore dropped to 0.0"),
            });
        }
    }
    if subscores.error_rate == Some(0.0) {
        alerts.push(Alert {
            severity: AlertSeverity::Error,
            subscore: Some("error_rate"),
            message: "error_rate subscore dropped to 0.0".to_string(),
        });
    }

    if status == HealthStatus::Critical {
        alerts.push(Alert {
            severity: AlertSeverity::Critical,
            subscore: None,
            message: "composite health score crossed into critical".to_string(),
        });
    }

    alerts
}

/// Adaptive timeout from precomputed sample statistics:
/// `clamp(mean + 2*stddev + 0.3*stddev, 2*declared_interval, 10*declared_interval)`,
/// or `3*declared_interval` with fewer than 2 samples.
pub fn adaptive_timeout_ms(mean_ms: f64, stddev_ms: f64, sample_count: usize, declared_interval_ms: i64) -> i64 {
    if sample_count < 2 {
        return declared_interval_ms * 3;
    }
    let raw = mean_ms + 2.3 * stddev_ms;
    let lower = (declared_interval_ms * 2) as f64;
    let upper = (declared_interval_ms * 10) as f64;
    raw.clamp(lower, upper).round() as i64
}

/// Adaptive timeout derived from a set of recent heartbeat timestamps
/// (any order; sorted internally), consecutive differences forming the
/// inter-arrival sample.
pub fn adaptive_timeout_from_timestamps(timestamps: &[DateTime<Utc>], declared_interval_ms: i64) -> i64 {
    let mut sorted: Vec<DateTime<Utc>> = timestamps.to_vec();
    sorted.sort();
    let intervals_ms: Vec<f64> = sorted
        .windows(2)
        .map(|w| (w[1] - w[0]).num_milliseconds() as f64)
        .collect();

    if intervals_ms.len() < 2 {
        return adaptive_timeout_ms(0.0, 0.0, intervals_ms.len(), declared_interval_ms);
    }

    let mean = intervals_ms.iter().sum::<f64>() / intervals_ms.len() as f64;
    let variance = intervals_ms.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (intervals_ms.len() - 1) as f64;
    let stddev = variance.sqrt();
    adaptive_timeout_ms(mean, stddev, intervals_ms.len(), declared_interval_ms)
}

/// Completeness-based data quality score: the fraction of optional
/// fields present, clamped to `[0, 1]`. Generalizes the original
/// service's 12-field completeness ratio to this schema's single
/// genuinely optional payload field (`response_time_ms`) plus whether a
/// request volume was reported at all (needed for `error_rate` to mean
/// anything).
pub fn quality_score(response_time_ms: Option<f64>, request_count: i64) -> f64 {
    let total = 2.0;
    let mut present = 0.0;
    if response_time_ms.is_some() {
        present += 1.0;
    }
    if request_count > 0 {
        present += 1.0;
    }
    (present / total).min(1.0)
}

/// Result of [`ingest`].
#[derive(Debug, Clone)]
pub struct IngestResult {
    pub heartbeat_id: i64,
    pub derived_health: HealthStatus,
    pub health_score: f64,
    pub adaptive_timeout_ms: i64,
    pub alerts: Vec<Alert>,
    pub quality_score: f64,
}

/// Validate, score, and persist a single heartbeat.
///
/// Validation beyond the storage layer's range `CHECK` constraints: the
/// timestamp must be within ten minutes of `clock.now()`, and the
/// sequence number must be strictly greater than the last one seen for
/// this agent (non-decreasing per agent; an equal or lesser sequence is
/// rejected as a conflict rather than silently applied).
pub async fn ingest(pool: &PgPool, clock: &dyn Clock, new: NewHeartbeat) -> Result<IngestResult, CoreError> {
    let now = clock.now();
    let age = now - new.timestamp;
    if age > Duration::minutes(10) || age < Duration::minutes(-10) {
        return Err(CoreError::validation(
            "heartbeat timestamp is more than 10 minutes from server clock",
            ErrCtx::default(),
        ));
    }

    for (name, value) in [
        ("cpu_usage_percent", new.cpu_usage_percent),
        ("memory_usage_percent", new.memory_usage_percent),
        ("disk_usage_percent", new.disk_usage_percent),
        ("packet_loss_percent", new.packet_loss_percent),
    ] {
        if !(0.0..=100.0).contains(&value) {
            return Err(CoreError::validation(
                format!("{name} must be between 0 and 100, got {value}"),
                ErrCtx::default(),
            ));
        }
    }

    let last_seq = heartbeats::last_sequence_number(pool, &new.agent_id)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::default()))?;
    if let Some(last) = last_seq {
        if new.sequence_number <= last {
            return Err(CoreError::conflict(
                format!(
                    "sequence_number {} is not greater than the last seen {last} for agent {}",
                    new.sequence_number, new.agent_id
                ),
                ErrCtx::default(),
            ));
        }
    }

    let subscores = Subscores {
        cpu: cpu_subscore(new.cpu_usage_percent),
        memory: memory_subscore(new.memory_usage_percent),
        net_latency: net_latency_subscore(new.network_latency_ms),
        error_rate: error_rate_subscore(new.request_count, new.error_count),
    };
    let health_score = subscores.composite_score();
    let derived_health = health_status_for_score(health_score);
    let alerts = generate_alerts(&subscores, derived_health);
    let quality = quality_score(new.response_time_ms, new.request_count);

    let recent: Vec<Heartbeat> = heartbeats::recent_n(pool, &new.agent_id, ADAPTIVE_TIMEOUT_SAMPLE_SIZE)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::default()))?;
    let mut timestamps: Vec<DateTime<Utc>> = recent.iter().map(|h| h.timestamp).collect();
    timestamps.push(new.timestamp);
    let adaptive_timeout = adaptive_timeout_from_timestamps(&timestamps, new.interval_ms as i64);

    let mut new = new;
    new.health_status = derived_health;
    let row = heartbeats::insert(pool, &new)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::default()))?;

    Ok(IngestResult {
        heartbeat_id: row.id,
        derived_health,
        health_score,
        adaptive_timeout_ms: adaptive_timeout,
        alerts,
        quality_score: quality,
    })
}

/// Result of an on-demand [`health_check`], independent of any inbound
/// heartbeat: whatever status the last heartbeat reported, downgraded to
/// `offline` if it has gone silent past its own adaptive timeout.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub agent_id: String,
    pub status: HealthStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub seconds_since_last_heartbeat: Option<f64>,
    pub adaptive_timeout_ms: i64,
}

/// Assess an agent's current liveness without waiting for its next
/// heartbeat: reuse the last reported status unless it has been silent
/// longer than its own adaptive timeout, in which case it reads `offline`.
pub async fn health_check(pool: &PgPool, clock: &dyn Clock, agent_id: &str) -> Result<HealthCheckResult, CoreError> {
    let now = clock.now();
    let latest = heartbeats::latest_for_agent(pool, agent_id)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::default()))?;
    let recent = heartbeats::recent_n(pool, agent_id, ADAPTIVE_TIMEOUT_SAMPLE_SIZE)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::default()))?;

    let Some(latest) = latest else {
        return Ok(HealthCheckResult {
            agent_id: agent_id.to_string(),
            status: HealthStatus::Offline,
            last_heartbeat_at: None,
            seconds_since_last_heartbeat: None,
            adaptive_timeout_ms: adaptive_timeout_ms(0.0, 0.0, 0, 30_000),
        });
    };

    let timestamps: Vec<DateTime<Utc>> = recent.iter().map(|h| h.timestamp).collect();
    let adaptive_timeout = adaptive_timeout_from_timestamps(&timestamps, latest.interval_ms as i64);
    let age_ms = (now - latest.timestamp).num_milliseconds().max(0);
    let status = if age_ms as i64 > adaptive_timeout {
        HealthStatus::Offline
    } else {
        latest.health_status
    };

    Ok(HealthCheckResult {
        agent_id: agent_id.to_string(),
        status,
        last_heartbeat_at: Some(latest.timestamp),
        seconds_since_last_heartbeat: Some(age_ms as f64 / 1000.0),
        adaptive_timeout_ms: adaptive_timeout,
    })
}
