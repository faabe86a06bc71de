use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The kind of a trigger -- determines which scheduling inputs apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    TimeBased,
    Interval,
    Event,
    Dependency,
    Manual,
    Conditional,
    Webhook,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TimeBased => "time_based",
            Self::Interval => "interval",
            Self::Event => "event",
            Self::Dependency => "dependency",
            Self::Manual => "manual",
            Self::Conditional => "conditional",
            Self::Webhook => "webhook",
        };
        f.write_str(s)
    }
}

impl FromStr for TriggerKind {
    type Err = TriggerKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "time_based" => Ok(Self::TimeBased),
            "interval" => Ok(Self::Interval),
            "event" => Ok(Self::Event),
            "dependency" => Ok(Self::Dependency),
            "manual" => Ok(Self::Manual),
            "conditional" => Ok(Self::Conditional),
            "webhook" => Ok(Self::Webhook),
            other => Err(TriggerKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TriggerKind`] string.
#[derive(Debug, Clone)]
pub struct TriggerKindParseError(pub String);

impl fmt::Display for TriggerKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid trigger kind: {:?}", self.0)
    }
}

impl std::error::Error for TriggerKindParseError {}

// ---------------------------------------------------------------------------

/// Lifecycle status of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Active,
    Paused,
    Disabled,
    Archived,
}

impl TriggerStatus {
    /// Valid targets for a transition out of this status.
    pub fn valid_transitions(self) -> &'static [TriggerStatus] {
        match self {
            Self::Active => &[Self::Paused, Self::Disabled, Self::Archived],
            Self::Paused => &[Self::Active, Self::Disabled, Self::Archived],
            Self::Disabled => &[Self::Active, Self::Paused, Self::Archived],
            Self::Archived => &[],
        }
    }

    pub fn can_transition_to(self, target: TriggerStatus) -> bool {
        self.valid_transitions().contains(&target)
    }
}

impl fmt::Display for TriggerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Disabled => "disabled",
            Self::Archived => "archived",
        };
        f.write_str(s)
    }
}

impl FromStr for TriggerStatus {
    type Err = TriggerStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "disabled" => Ok(Self::Disabled),
            "archived" => Ok(Self::Archived),
            other => Err(TriggerStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TriggerStatus`] string.
#[derive(Debug, Clone)]
pub struct TriggerStatusParseError(pub String);

impl fmt::Display for TriggerStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid trigger status: {:?}", self.0)
    }
}

impl std::error::Error for TriggerStatusParseError {}

// ---------------------------------------------------------------------------

/// Predicate used to evaluate a `dependency` trigger against its upstream
/// triggers' latest runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DependencyPredicate {
    AllSuccess,
    AnySuccess,
    AllComplete,
}

impl fmt::Display for DependencyPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AllSuccess => "all_success",
            Self::AnySuccess => "any_success",
            Self::AllComplete => "all_complete",
        };
        f.write_str(s)
    }
}

impl FromStr for DependencyPredicate {
    type Err = DependencyPredicateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all_success" => Ok(Self::AllSuccess),
            "any_success" => Ok(Self::AnySuccess),
            "all_complete" => Ok(Self::AllComplete),
            other => Err(DependencyPredicateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`DependencyPredicate`] string.
#[derive(Debug, Clone)]
pub struct DependencyPredicateParseError(pub String);

impl fmt::Display for DependencyPredicateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid dependency predicate: {:?}", self.0)
    }
}

impl std::error::Error for DependencyPredicateParseError {}

// ---------------------------------------------------------------------------

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
    Retrying,
    Aborted,
}

impl RunStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Retrying => "retrying",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

impl FromStr for RunStatus {
    type Err = RunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            "retrying" => Ok(Self::Retrying),
            "aborted" => Ok(Self::Aborted),
            other => Err(RunStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RunStatus`] string.
#[derive(Debug, Clone)]
pub struct RunStatusParseError(pub String);

impl fmt::Display for RunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run status: {:?}", self.0)
    }
}

impl std::error::Error for RunStatusParseError {}

// ---------------------------------------------------------------------------

/// Classification of a run failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Forbidden,
    Conflict,
    NoneAvailable,
    Unavailable,
    Timeout,
    HandlerError,
    NoHandler,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::Conflict => "conflict",
            Self::NoneAvailable => "none_available",
            Self::Unavailable => "unavailable",
            Self::Timeout => "timeout",
            Self::HandlerError => "handler_error",
            Self::NoHandler => "no_handler",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl FromStr for ErrorKind {
    type Err = ErrorKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation" => Ok(Self::Validation),
            "not_found" => Ok(Self::NotFound),
            "forbidden" => Ok(Self::Forbidden),
            "conflict" => Ok(Self::Conflict),
            "none_available" => Ok(Self::NoneAvailable),
            "unavailable" => Ok(Self::Unavailable),
            "timeout" => Ok(Self::Timeout),
            "handler_error" => Ok(Self::HandlerError),
            "no_handler" => Ok(Self::NoHandler),
            "internal" => Ok(Self::Internal),
            other => Err(ErrorKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ErrorKind`] string.
#[derive(Debug, Clone)]
pub struct ErrorKindParseError(pub String);

impl fmt::Display for ErrorKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid error kind: {:?}", self.0)
    }
}

impl std::error::Error for ErrorKindParseError {}

// ---------------------------------------------------------------------------

/// Health status derived from a heartbeat's metric subscores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
    Offline,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

impl FromStr for HealthStatus {
    type Err = HealthStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(Self::Healthy),
            "degraded" => Ok(Self::Degraded),
            "critical" => Ok(Self::Critical),
            "offline" => Ok(Self::Offline),
            other => Err(HealthStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`HealthStatus`] string.
#[derive(Debug, Clone)]
pub struct HealthStatusParseError(pub String);

impl fmt::Display for HealthStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid health status: {:?}", self.0)
    }
}

impl std::error::Error for HealthStatusParseError {}

// ---------------------------------------------------------------------------

/// The kind of an uptime session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Up,
    Down,
    Maintenance,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

impl FromStr for SessionKind {
    type Err = SessionKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            "maintenance" => Ok(Self::Maintenance),
            other => Err(SessionKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SessionKind`] string.
#[derive(Debug, Clone)]
pub struct SessionKindParseError(pub String);

impl fmt::Display for SessionKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid session kind: {:?}", self.0)
    }
}

impl std::error::Error for SessionKindParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A trigger -- a persisted definition of when and how to run a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Trigger {
    pub id: Uuid,
    pub name: String,
    pub organization_id: String,
    pub created_by: String,
    pub kind: TriggerKind,
    pub status: TriggerStatus,

    pub cron_expression: Option<String>,
    pub timezone: Option<String>,
    pub interval_seconds: Option<i64>,
    pub event_types: Option<Vec<String>>,
    pub dependency_trigger_ids: Option<Vec<Uuid>>,
    pub dependency_predicate: Option<DependencyPredicate>,
    pub condition_expression: Option<String>,
    pub window_start: Option<String>,
    pub window_end: Option<String>,

    pub task_type: String,
    pub task_config: serde_json::Value,
    pub task_parameters: serde_json::Value,

    pub priority: i32,
    pub max_concurrent_runs: i32,
    pub current_runs: i32,
    pub max_exec_seconds: i32,

    pub max_retries: i32,
    pub base_delay_seconds: i32,
    pub backoff_multiplier: f64,
    pub max_delay_seconds: Option<i32>,

    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fire_at: Option<DateTime<Utc>>,

    pub total_runs: i64,
    pub success_runs: i64,
    pub failure_runs: i64,
    pub avg_exec_seconds: Option<f64>,

    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single attempt to execute the task described by a trigger.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Run {
    pub id: Uuid,
    pub trigger_id: Uuid,
    pub status: RunStatus,

    pub scheduled_for: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    pub worker_id: Option<String>,
    pub task_parameters_snapshot: serde_json::Value,
    pub result_data: Option<serde_json::Value>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,

    pub attempt: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub retry_history: serde_json::Value,

    pub lease_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Run {
    /// `duration = ended_at - started_at` when both are set.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(s), Some(e)) => Some(e - s),
            _ => None,
        }
    }
}

/// A single entry of a run's append-only retry history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryHistoryEntry {
    pub attempt: i32,
    pub scheduled_for: DateTime<Utc>,
    pub reason: String,
    pub delay_seconds: f64,
}

/// A distributed lease: an exclusive, time-bounded claim on a resource
/// identified by `(resource_type, resource_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Lease {
    pub lease_id: Uuid,
    pub resource_type: String,
    pub resource_id: String,

    pub worker_id: String,
    pub process_id: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    pub duration_seconds: i32,
    pub auto_extend: bool,
    pub max_extensions: i32,
    pub current_extensions: i32,

    pub last_heartbeat: Option<DateTime<Utc>>,
    pub heartbeat_interval_seconds: Option<i32>,
    pub heartbeat_failures: i32,
}

impl Lease {
    /// A lease is alive iff it has not expired and its owner has heartbeat
    /// within `3 * heartbeat_interval` of `now`.
    pub fn is_alive(&self, now: DateTime<Utc>) -> bool {
        if now >= self.expires_at {
            return false;
        }
        match (self.last_heartbeat, self.heartbeat_interval_seconds) {
            (Some(hb), Some(interval)) if interval > 0 => {
                (now - hb).num_seconds() <= 3 * interval as i64
            }
            _ => true,
        }
    }
}

/// A single agent heartbeat sample (time-series, append-only).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Heartbeat {
    pub id: i64,
    pub agent_id: String,
    pub environment: String,
    pub availability_zone: String,
    pub agent_version: String,
    pub timestamp: DateTime<Utc>,
    pub sequence_number: i64,

    pub health_status: HealthStatus,
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub disk_usage_percent: f64,
    pub network_latency_ms: f64,
    pub packet_loss_percent: f64,
    pub request_count: i64,
    pub error_count: i64,
    pub response_time_ms: Option<f64>,
    pub interval_ms: i32,

    pub recorded_at: DateTime<Utc>,
}

/// Severity ordering `info < warning < error < critical < emergency`, shared
/// by heartbeat alerting and metric threshold breaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
    Emergency,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
            Self::Emergency => "emergency",
        };
        f.write_str(s)
    }
}

/// The kind of system measurement a [`SystemMetric`] sample carries,
/// determining which default warning/critical thresholds apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    CpuUsage,
    MemoryUsage,
    DiskUsage,
    DiskIo,
    NetworkIo,
    ResponseTime,
    Throughput,
    ErrorRate,
    Uptime,
    Custom,
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CpuUsage => "cpu_usage",
            Self::MemoryUsage => "memory_usage",
            Self::DiskUsage => "disk_usage",
            Self::DiskIo => "disk_io",
            Self::NetworkIo => "network_io",
            Self::ResponseTime => "response_time",
            Self::Throughput => "throughput",
            Self::ErrorRate => "error_rate",
            Self::Uptime => "uptime",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

impl FromStr for MetricType {
    type Err = MetricTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu_usage" => Ok(Self::CpuUsage),
            "memory_usage" => Ok(Self::MemoryUsage),
            "disk_usage" => Ok(Self::DiskUsage),
            "disk_io" => Ok(Self::DiskIo),
            "network_io" => Ok(Self::NetworkIo),
            "response_time" => Ok(Self::ResponseTime),
            "throughput" => Ok(Self::Throughput),
            "error_rate" => Ok(Self::ErrorRate),
            "uptime" => Ok(Self::Uptime),
            "custom" => Ok(Self::Custom),
            other => Err(MetricTypeParseError(other.to_owned())),
        }
    }
}

impl MetricType {
    /// The default unit assumed when a caller doesn't supply one, matching
    /// the convention of each metric kind.
    pub fn default_unit(&self) -> &'static str {
        match self {
            Self::CpuUsage | Self::MemoryUsage | Self::DiskUsage | Self::ErrorRate => "percent",
            Self::DiskIo | Self::NetworkIo | Self::Throughput => "bytes_per_second",
            Self::ResponseTime => "milliseconds",
            Self::Uptime => "seconds",
            Self::Custom => "unit",
        }
    }
}

/// Error returned when parsing an invalid [`MetricType`] string.
#[derive(Debug, Clone)]
pub struct MetricTypeParseError(pub String);

impl fmt::Display for MetricTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid metric type: {:?}", self.0)
    }
}

impl std::error::Error for MetricTypeParseError {}

/// A single system metric sample (time-series, append-only).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SystemMetric {
    pub id: i64,
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

    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
