//! `orbit serve`: the Scheduler and Telemetry HTTP surfaces plus the
//! worker's orchestrator loop and priority queue filler, all started from
//! one resolved [`OrbitConfig`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use orbit_core::clock::{Clock, SystemClock};
use orbit_core::error::CoreError;
use orbit_core::handler::registry::HandlerRegistry;
use orbit_core::handler::{http_call::HttpCallHandler, llm_call::LlmCallHandler};
use orbit_core::orchestrator::{self, Orchestrator, OrchestratorConfig};
use orbit_core::priority_queue::PriorityQueue;
use orbit_core::telemetry::heartbeat;
use orbit_core::telemetry::metrics::{self, NewMetricSample, MAX_BATCH_METRICS};
use orbit_core::telemetry::uptime;
use orbit_core::trigger_store::{self, NewTrigger, TriggerPatch};
use orbit_db::models::{DependencyPredicate, HealthStatus, MetricType, Trigger, TriggerKind, TriggerStatus};
use orbit_db::queries::heartbeats::NewHeartbeat;

use crate::config::OrbitConfig;

const MAX_BATCH_HEARTBEATS: usize = 1000;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, message)
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::Validation { .. } => StatusCode::BAD_REQUEST,
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::Forbidden { .. } => StatusCode::FORBIDDEN,
            CoreError::Conflict { .. } => StatusCode::CONFLICT,
            CoreError::NoneAvailable { .. } => StatusCode::NOT_FOUND,
            CoreError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            CoreError::HandlerError { .. } => StatusCode::BAD_GATEWAY,
            CoreError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

type AppResult<T> = Result<T, AppError>;

// ---------------------------------------------------------------------------
// DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct TriggerDto {
    #[serde(flatten)]
    trigger: Trigger,
    is_due: bool,
}

impl TriggerDto {
    fn new(trigger: Trigger, now: DateTime<Utc>) -> Self {
        let is_due = trigger.status == TriggerStatus::Active
            && trigger.next_fire_at.is_some_and(|t| t <= now);
        Self { trigger, is_due }
    }
}

#[derive(Debug, Deserialize)]
struct TriggerConfigPayload {
    kind: String,
    cron_expression: Option<String>,
    timezone: Option<String>,
    interval_seconds: Option<i64>,
    event_types: Option<Vec<String>>,
    dependency_trigger_ids: Option<Vec<Uuid>>,
    dependency_predicate: Option<String>,
    condition_expression: Option<String>,
    window_start: Option<String>,
    window_end: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecutionConfigPayload {
    task_type: String,
    task_config: Option<serde_json::Value>,
    task_parameters: Option<serde_json::Value>,
    #[serde(default)]
    priority: i32,
    #[serde(default = "default_max_concurrent_runs")]
    max_concurrent_runs: i32,
    #[serde(default = "default_max_exec_seconds")]
    max_exec_seconds: i32,
}

fn default_max_concurrent_runs() -> i32 {
    1
}

fn default_max_exec_seconds() -> i32 {
    300
}

#[derive(Debug, Deserialize, Default)]
struct RetryPolicyPayload {
    #[serde(default = "default_max_retries")]
    max_retries: i32,
    #[serde(default = "default_base_delay_seconds")]
    base_delay_seconds: i32,
    #[serde(default = "default_backoff_multiplier")]
    backoff_multiplier: f64,
    max_delay_seconds: Option<i32>,
}

fn default_max_retries() -> i32 {
    3
}

fn default_base_delay_seconds() -> i32 {
    30
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Deserialize)]
struct CreateTriggerRequest {
    name: String,
    organization_id: String,
    created_by: String,
    trigger_config: TriggerConfigPayload,
    execution_config: ExecutionConfigPayload,
    #[serde(default)]
    retry_policy: Option<RetryPolicyPayload>,
}

#[derive(Debug, Deserialize)]
struct UpdateTriggerRequest {
    /// Required: the version this update is conditioned on (optimistic
    /// concurrency -- a stale value is reported as a 409 conflict).
    expected_version: i32,
    task_config: Option<serde_json::Value>,
    task_parameters: Option<serde_json::Value>,
    priority: Option<i32>,
    max_concurrent_runs: Option<i32>,
    max_exec_seconds: Option<i32>,
    max_retries: Option<i32>,
    base_delay_seconds: Option<i32>,
    backoff_multiplier: Option<f64>,
    max_delay_seconds: Option<i32>,
    cron_expression: Option<String>,
    timezone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_page_size")]
    page_size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    20
}

#[derive(Debug, Deserialize)]
struct UptimeQuery {
    #[serde(default = "default_time_range_hours")]
    time_range_hours: i64,
    sla_target_percentage: Option<f64>,
}

fn default_time_range_hours() -> i64 {
    24
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    agent_id: String,
    environment: String,
    availability_zone: String,
    agent_version: String,
    /// Agent-reported event time; defaults to ingestion time when omitted.
    /// The ingestor independently validates this against its own clock
    /// (rejecting anything more than 10 minutes skewed).
    timestamp: Option<DateTime<Utc>>,
    sequence_number: i64,
    cpu_usage_percent: f64,
    memory_usage_percent: f64,
    disk_usage_percent: f64,
    network_latency_ms: f64,
    #[serde(default)]
    packet_loss_percent: f64,
    #[serde(default)]
    request_count: i64,
    #[serde(default)]
    error_count: i64,
    response_time_ms: Option<f64>,
    #[serde(default = "default_interval_ms")]
    interval_ms: i32,
}

fn default_interval_ms() -> i32 {
    30_000
}

impl HeartbeatRequest {
    fn into_new(self, ingested_at: DateTime<Utc>) -> NewHeartbeat {
        let r = self;
        NewHeartbeat {
            agent_id: r.agent_id,
            environment: r.environment,
            availability_zone: r.availability_zone,
            agent_version: r.agent_version,
            timestamp: r.timestamp.unwrap_or(ingested_at),
            sequence_number: r.sequence_number,
            health_status: HealthStatus::Healthy,
            cpu_usage_percent: r.cpu_usage_percent,
            memory_usage_percent: r.memory_usage_percent,
            disk_usage_percent: r.disk_usage_percent,
            network_latency_ms: r.network_latency_ms,
            packet_loss_percent: r.packet_loss_percent,
            request_count: r.request_count,
            error_count: r.error_count,
            response_time_ms: r.response_time_ms,
            interval_ms: r.interval_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MetricRequest {
    system_id: String,
    metric_name: String,
    metric_type: String,
    value: f64,
    unit: Option<String>,
    service_name: Option<String>,
    environment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    #[serde(default)]
    heartbeats: Vec<HeartbeatRequest>,
    #[serde(default)]
    metrics: Vec<MetricRequest>,
}

#[derive(Debug, Deserialize)]
struct HealthCheckRequest {
    agent_id: String,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

pub fn build_router(pool: PgPool, clock: Arc<dyn Clock>) -> Router {
    let state = AppState { pool, clock };

    Router::new()
        .route("/health", get(health_probe))
        .route("/triggers", post(create_trigger))
        .route("/triggers/{id}", put(update_trigger).delete(archive_trigger))
        .route("/triggers/{id}/execute", post(execute_trigger))
        .route("/triggers/{id}/history", get(trigger_history))
        .route("/telemetry/heartbeat", post(ingest_heartbeat))
        .route("/telemetry/system-metrics", post(ingest_metric))
        .route("/telemetry/batch", post(ingest_batch))
        .route("/telemetry/uptime-status/{agent_id}", get(uptime_status))
        .route("/telemetry/health-check", post(health_check))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Start the HTTP surface, the orchestrator loop, and the priority queue
/// filler under one `CancellationToken`, shutting all three down together
/// on `ctrl_c`.
pub async fn run_serve(resolved: OrbitConfig) -> Result<()> {
    let pool = orbit_db::pool::create_pool(&resolved.db_config).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let mut handlers = HandlerRegistry::new();
    handlers.register(HttpCallHandler::new());
    handlers.register(LlmCallHandler::new());
    let handlers = Arc::new(handlers);

    let queue = Arc::new(PriorityQueue::new(pool.clone(), 50, 100));
    let _filler = queue.spawn_filler(Arc::clone(&clock), StdDuration::from_secs(2));

    let orchestrator_config = OrchestratorConfig {
        tick_interval: resolved.tick_interval,
        max_concurrent_runs_per_worker: resolved.max_concurrent_runs_per_worker,
        lease_duration: resolved.lease_duration,
        worker_id: resolved.worker_id.clone(),
        shutdown_grace: resolved.shutdown_grace,
    };
    let orchestrator = Orchestrator::new(pool.clone(), Arc::clone(&clock), Arc::clone(&queue), Arc::clone(&handlers), orchestrator_config);

    let cancel = CancellationToken::new();
    let orchestrator_cancel = cancel.clone();
    let orchestrator_task = tokio::spawn(async move {
        if let Err(e) = orchestrator.run(orchestrator_cancel).await {
            tracing::error!(error = %e, "orchestrator loop exited with error");
        }
    });

    let app = build_router(pool.clone(), clock);
    let addr: SocketAddr = format!("{}:{}", resolved.bind, resolved.port).parse()?;
    tracing::info!(worker_id = %resolved.worker_id, %addr, "orbit serve listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_cancel.cancel();
        })
        .await?;

    orchestrator_task.await.ok();
    pool.close().await;
    tracing::info!("orbit serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers -- Scheduler surface
// ---------------------------------------------------------------------------

async fn health_probe() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn create_trigger(State(state): State<AppState>, Json(req): Json<CreateTriggerRequest>) -> AppResult<axum::response::Response> {
    let kind: TriggerKind = req
        .trigger_config
        .kind
        .parse()
        .map_err(|_| AppError::bad_request(format!("invalid trigger kind: {}", req.trigger_config.kind)))?;

    let dependency_predicate = req
        .trigger_config
        .dependency_predicate
        .map(|p| p.parse::<DependencyPredicate>())
        .transpose()
        .map_err(|_| AppError::bad_request("invalid dependency_predicate"))?;

    let retry = req.retry_policy.unwrap_or_default();

    let now = state.clock.now();
    let next_fire_at = match kind {
        TriggerKind::TimeBased | TriggerKind::Interval => Some(now),
        _ => None,
    };

    let new = NewTrigger {
        name: req.name,
        organization_id: req.organization_id,
        created_by: req.created_by,
        kind,
        status: TriggerStatus::Active,
        cron_expression: req.trigger_config.cron_expression,
        timezone: req.trigger_config.timezone,
        interval_seconds: req.trigger_config.interval_seconds,
        event_types: req.trigger_config.event_types,
        dependency_trigger_ids: req.trigger_config.dependency_trigger_ids,
        dependency_predicate,
        condition_expression: req.trigger_config.condition_expression,
        window_start: req.trigger_config.window_start,
        window_end: req.trigger_config.window_end,
        task_type: req.execution_config.task_type,
        task_config: req.execution_config.task_config.unwrap_or_else(|| serde_json::json!({})),
        task_parameters: req.execution_config.task_parameters.unwrap_or_else(|| serde_json::json!({})),
        priority: req.execution_config.priority,
        max_concurrent_runs: req.execution_config.max_concurrent_runs,
        max_exec_seconds: req.execution_config.max_exec_seconds,
        max_retries: retry.max_retries,
        base_delay_seconds: retry.base_delay_seconds,
        backoff_multiplier: retry.backoff_multiplier,
        max_delay_seconds: retry.max_delay_seconds,
        next_fire_at,
    };

    let trigger = trigger_store::create(&state.pool, &new).await?;
    Ok((StatusCode::CREATED, Json(TriggerDto::new(trigger, now))).into_response())
}

async fn update_trigger(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateTriggerRequest>,
) -> AppResult<axum::response::Response> {
    let patch = TriggerPatch {
        task_config: req.task_config,
        task_parameters: req.task_parameters,
        priority: req.priority,
        max_concurrent_runs: req.max_concurrent_runs,
        max_exec_seconds: req.max_exec_seconds,
        max_retries: req.max_retries,
        base_delay_seconds: req.base_delay_seconds,
        backoff_multiplier: req.backoff_multiplier,
        max_delay_seconds: req.max_delay_seconds,
        cron_expression: req.cron_expression,
        timezone: req.timezone,
        ..TriggerPatch::default()
    };
    let trigger = trigger_store::update(&state.pool, id, req.expected_version, &patch).await?;
    Ok((StatusCode::OK, Json(TriggerDto::new(trigger, state.clock.now()))).into_response())
}

async fn archive_trigger(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<axum::response::Response> {
    let trigger = trigger_store::soft_delete(&state.pool, id).await?;
    Ok((StatusCode::OK, Json(TriggerDto::new(trigger, state.clock.now()))).into_response())
}

async fn execute_trigger(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<axum::response::Response> {
    let run = orchestrator::manual_fire(&state.pool, state.clock.as_ref(), id).await?;
    Ok((StatusCode::ACCEPTED, Json(run)).into_response())
}

async fn trigger_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<HistoryQuery>,
) -> AppResult<axum::response::Response> {
    let runs = orbit_core::run_store::list_by_trigger(&state.pool, id, q.page, q.page_size).await?;
    Ok((StatusCode::OK, Json(runs)).into_response())
}

// ---------------------------------------------------------------------------
// Handlers -- Telemetry surface
// ---------------------------------------------------------------------------

async fn ingest_heartbeat(State(state): State<AppState>, Json(req): Json<HeartbeatRequest>) -> AppResult<axum::response::Response> {
    let new = req.into_new(state.clock.now());
    let result = heartbeat::ingest(&state.pool, state.clock.as_ref(), new).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({
        "heartbeat_id": result.heartbeat_id,
        "derived_health": result.derived_health,
        "health_score": result.health_score,
        "adaptive_timeout_ms": result.adaptive_timeout_ms,
        "alerts": result.alerts.iter().map(|a| serde_json::json!({"subscore": a.subscore, "message": a.message, "severity": a.severity})).collect::<Vec<_>>(),
        "quality_score": result.quality_score,
    }))).into_response())
}

fn metric_request_to_sample(req: MetricRequest, now: DateTime<Utc>) -> AppResult<NewMetricSample> {
    let metric_type: MetricType = req
        .metric_type
        .parse()
        .map_err(|_| AppError::bad_request(format!("invalid metric_type: {}", req.metric_type)))?;
    Ok(NewMetricSample {
        system_id: req.system_id,
        metric_name: req.metric_name,
        metric_type,
        timestamp: now,
        value: req.value,
        unit: req.unit,
        service_name: req.service_name,
        environment: req.environment,
    })
}

fn metric_result_json(result: &metrics::MetricIngestResult) -> serde_json::Value {
    serde_json::json!({
        "metric_id": result.metric_id,
        "data_quality_score": result.data_quality_score,
        "threshold_breached": result.threshold_breached,
        "alert_severity": result.alert_severity,
        "is_outlier": result.is_outlier,
    })
}

async fn ingest_metric(State(state): State<AppState>, Json(req): Json<MetricRequest>) -> AppResult<axum::response::Response> {
    let now = state.clock.now();
    let sample = metric_request_to_sample(req, now)?;
    let result = metrics::ingest(&state.pool, state.clock.as_ref(), sample).await?;
    Ok((StatusCode::CREATED, Json(metric_result_json(&result))).into_response())
}

async fn ingest_batch(State(state): State<AppState>, Json(req): Json<BatchRequest>) -> AppResult<axum::response::Response> {
    if req.heartbeats.len() > MAX_BATCH_HEARTBEATS {
        return Err(AppError::payload_too_large(format!(
            "batch of {} heartbeats exceeds the limit of {MAX_BATCH_HEARTBEATS}",
            req.heartbeats.len()
        )));
    }
    if req.metrics.len() > MAX_BATCH_METRICS {
        return Err(AppError::payload_too_large(format!(
            "batch of {} metrics exceeds the limit of {MAX_BATCH_METRICS}",
            req.metrics.len()
        )));
    }

    let now = state.clock.now();

    let mut heartbeat_results = Vec::with_capacity(req.heartbeats.len());
    for hb in req.heartbeats {
        let new = hb.into_new(now);
        let result = heartbeat::ingest(&state.pool, state.clock.as_ref(), new).await?;
        heartbeat_results.push(serde_json::json!({
            "heartbeat_id": result.heartbeat_id,
            "derived_health": result.derived_health,
        }));
    }

    let mut metric_samples = Vec::with_capacity(req.metrics.len());
    for m in req.metrics {
        metric_samples.push(metric_request_to_sample(m, now)?);
    }
    let metric_results = metrics::ingest_batch(&state.pool, state.clock.as_ref(), metric_samples).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "heartbeats": heartbeat_results,
            "metrics": metric_results.iter().map(metric_result_json).collect::<Vec<_>>(),
        })),
    )
        .into_response())
}

async fn uptime_status(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(q): Query<UptimeQuery>,
) -> AppResult<axum::response::Response> {
    let now = state.clock.now();
    let period_start = now - Duration::hours(q.time_range_hours);
    let report = uptime::analyze(&state.pool, &agent_id, period_start, now, q.sla_target_percentage).await?;
    Ok((StatusCode::OK, Json(serde_json::json!({
        "agent_id": report.agent_id,
        "period_start": report.period_start,
        "period_end": report.period_end,
        "session_count": report.sessions.len(),
        "uptime_percentage": report.uptime_percentage,
        "mttr_seconds": report.mttr_seconds,
        "mtbf_seconds": report.mtbf_seconds,
        "sla_target_percentage": report.sla_target_percentage,
        "sla_met": report.sla_met,
        "breach_risk": report.breach_risk.map(|r| format!("{r:?}").to_lowercase()),
    }))).into_response())
}

async fn health_check(State(state): State<AppState>, Json(req): Json<HealthCheckRequest>) -> AppResult<axum::response::Response> {
    let result = heartbeat::health_check(&state.pool, state.clock.as_ref(), &req.agent_id).await?;
    Ok((StatusCode::OK, Json(serde_json::json!({
        "agent_id": result.agent_id,
        "status": result.status,
        "last_heartbeat_at": result.last_heartbeat_at,
        "seconds_since_last_heartbeat": result.seconds_since_last_heartbeat,
        "adaptive_timeout_ms": result.adaptive_timeout_ms,
    }))).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
