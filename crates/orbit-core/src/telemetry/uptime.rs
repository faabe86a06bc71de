//! Uptime Analyzer (C11): derives up/down sessions from an ordered
//! heartbeat stream and summarizes them into an uptime report.
//!
//! Sessions are derived on demand from stored heartbeats, never
//! persisted -- the only durable input is the `heartbeats` table.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use orbit_db::models::Heartbeat;
use orbit_db::queries::heartbeats;

use crate::error::{CoreError, ErrCtx};
use crate::telemetry::heartbeat::adaptive_timeout_from_timestamps;

/// The kind of a derived uptime session. `Maintenance` is part of the
/// data model but has no heartbeat-derived signal yet -- it is reserved
/// for a future explicit maintenance-window input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UptimeSession {
    pub kind: SessionKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl UptimeSession {
    fn duration_seconds(&self, report_end: DateTime<Utc>) -> f64 {
        let end = self.ended_at.unwrap_or(report_end);
        (end - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreachRisk {
    Low,
    Medium,
    High,
}

/// `slack = uptime_percentage - target`. `slack >= 5` is low risk,
/// `slack >= 0` is medium, a target already missed is high. These exact
/// cut points are a judgment call (the contract only fixes the three
/// risk labels, not their boundaries) recorded alongside the rest of the
/// open-question decisions.
fn classify_breach_risk(slack: f64) -> BreachRisk {
    if slack >= 5.0 {
        BreachRisk::Low
    } else if slack >= 0.0 {
        BreachRisk::Medium
    } else {
        BreachRisk::High
    }
}

#[derive(Debug, Clone)]
pub struct UptimeReport {
    pub agent_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub sessions: Vec<UptimeSession>,
    pub uptime_percentage: f64,
    pub mttr_seconds: Option<f64>,
    pub mtbf_seconds: Option<f64>,
    pub sla_target_percentage: Option<f64>,
    pub sla_met: Option<bool>,
    pub breach_risk: Option<BreachRisk>,
}

/// Derive sessions from a heartbeat stream already ordered by timestamp
/// ascending within `[period_start, period_end]`.
///
/// A gap between consecutive heartbeats (or between `period_start` and
/// the first heartbeat, or the last heartbeat and `period_end`) that
/// exceeds `gap_threshold_ms` is treated as downtime. The agent's final
/// state (based on whether a heartbeat landed close enough to
/// `period_end`) determines whether the trailing session is still active.
fn derive_sessions(
    heartbeats_sorted: &[Heartbeat],
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    gap_threshold_ms: i64,
) -> Vec<UptimeSession> {
    let gap_threshold = chrono::Duration::milliseconds(gap_threshold_ms);
    let mut sessions = Vec::new();

    if heartbeats_sorted.is_empty() {
        sessions.push(UptimeSession {
            kind: SessionKind::Down,
            started_at: period_start,
            ended_at: Some(period_end),
            is_active: true,
        });
        return sessions;
    }

    let mut cursor = period_start;
    let mut up_since: Option<DateTime<Utc>> = None;

    let close_up = |sessions: &mut Vec<UptimeSession>, since: DateTime<Utc>, at: DateTime<Utc>| {
        sessions.push(UptimeSession {
            kind: SessionKind::Up,
            started_at: since,
            ended_at: Some(at),
            is_active: false,
        });
    };

    for hb in heartbeats_sorted {
        let gap = hb.timestamp - cursor;
        if gap > gap_threshold {
            if let Some(since) = up_since.take() {
                close_up(&mut sessions, since, cursor);
            }
            sessions.push(UptimeSession {
                kind: SessionKind::Down,
                started_at: cursor,
                ended_at: Some(hb.timestamp),
                is_active: false,
            });
            up_since = Some(hb.timestamp);
        } else if up_since.is_none() {
            up_since = Some(cursor);
        }
        cursor = hb.timestamp;
    }

    let trailing_gap = period_end - cursor;
    if trailing_gap > gap_threshold {
        if let Some(since) = up_since.take() {
            close_up(&mut sessions, since, cursor);
        }
        sessions.push(UptimeSession {
            kind: SessionKind::Down,
            started_at: cursor,
            ended_at: Some(period_end),
            is_active: true,
        });
    } else if let Some(since) = up_since {
        sessions.push(UptimeSession {
            kind: SessionKind::Up,
            started_at: since,
            ended_at: Some(period_end),
            is_active: true,
        });
    }

    sessions
}

/// `MTTR` = mean duration of *closed* down sessions; `None` when there
/// are none.
fn mean_time_to_recovery(sessions: &[UptimeSession], period_end: DateTime<Utc>) -> Option<f64> {
    let closed: Vec<f64> = sessions
        .iter()
        .filter(|s| s.kind == SessionKind::Down && !s.is_active)
        .map(|s| s.duration_seconds(period_end))
        .collect();
    if closed.is_empty() {
        None
    } else {
        Some(closed.iter().sum::<f64>() / closed.len() as f64)
    }
}

/// `MTBF` = mean distance between consecutive down-session start times;
/// `None` when fewer than two down sessions exist.
fn mean_time_between_failures(sessions: &[UptimeSession]) -> Option<f64> {
    let starts: Vec<DateTime<Utc>> = sessions
        .iter()
        .filter(|s| s.kind == SessionKind::Down)
        .map(|s| s.started_at)
        .collect();
    if starts.len() < 2 {
        return None;
    }
    let gaps: Vec<f64> = starts
        .windows(2)
        .map(|w| (w[1] - w[0]).num_milliseconds() as f64 / 1000.0)
        .collect();
    Some(gaps.iter().sum::<f64>() / gaps.len() as f64)
}

/// Summarize an already-derived session list into an uptime report.
pub fn summarize(
    agent_id: &str,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    sessions: Vec<UptimeSession>,
    sla_target_percentage: Option<f64>,
) -> UptimeReport {
    let total_period_seconds = (period_end - period_start).num_milliseconds() as f64 / 1000.0;
    let total_down_seconds: f64 = sessions
        .iter()
        .filter(|s| s.kind == SessionKind::Down)
        .map(|s| s.duration_seconds(period_end))
        .sum();

    let uptime_percentage = if total_period_seconds <= 0.0 {
        100.0
    } else {
        (100.0 * (1.0 - total_down_seconds / total_period_seconds)).clamp(0.0, 100.0)
    };

    let mttr_seconds = mean_time_to_recovery(&sessions, period_end);
    let mtbf_seconds = mean_time_between_failures(&sessions);

    let (sla_met, breach_risk) = match sla_target_percentage {
        Some(target) => {
            let slack = uptime_percentage - target;
            (Some(uptime_percentage >= target), Some(classify_breach_risk(slack)))
        }
        None => (None, None),
    };

    UptimeReport {
        agent_id: agent_id.to_string(),
        period_start,
        period_end,
        sessions,
        uptime_percentage,
        mttr_seconds,
        mtbf_seconds,
        sla_target_percentage,
        sla_met,
        breach_risk,
    }
}

/// Load an agent's heartbeats over `[period_start, period_end]`, derive
/// sessions using the same adaptive-timeout gap threshold the ingestor
/// computes, and summarize into a report.
pub async fn analyze(
    pool: &PgPool,
    agent_id: &str,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    sla_target_percentage: Option<f64>,
) -> Result<UptimeReport, CoreError> {
    if period_end <= period_start {
        return Err(CoreError::validation(
            "period_end must be after period_start",
            ErrCtx::default(),
        ));
    }

    let rows = heartbeats::list_in_range(pool, agent_id, period_start, period_end)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::default()))?;

    let declared_interval_ms = rows.last().map(|h| h.interval_ms as i64).unwrap_or(30_000);
    let timestamps: Vec<DateTime<Utc>> = rows.iter().map(|h| h.timestamp).collect();
    let adaptive = adaptive_timeout_from_timestamps(&timestamps, declared_interval_ms);
    let gap_threshold_ms = (2 * declared_interval_ms).max(adaptive);

    let sessions = derive_sessions(&rows, period_start, period_end, gap_threshold_ms);
    Ok(summarize(agent_id, period_start, period_end, sessions, sla_target_percentage))
}
