//! Run Store (C5): CRUD for per-execution run records, retry accounting,
//! and the run status transition graph.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use orbit_db::models::{ErrorKind, Run, RunStatus};
use orbit_db::queries::runs;

use crate::error::{CoreError, ErrCtx};

/// Validates the run status transition graph described in the data model:
/// terminal states (`completed`, `aborted`, `cancelled`) are absorbing, and
/// `failed` may only move to `retrying`, which moves back to `pending`.
pub struct RunStateMachine;

impl RunStateMachine {
    pub fn is_valid_transition(from: RunStatus, to: RunStatus) -> bool {
        use RunStatus::*;
        if from.is_terminal() {
            return false;
        }
        matches!(
            (from, to),
            (Pending, Queued)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Timeout)
                | (Running, Cancelled)
                | (Failed, Retrying)
                | (Timeout, Retrying)
                | (Retrying, Pending)
                | (Failed, Aborted)
                | (Timeout, Aborted)
        )
    }
}

pub async fn create(
    pool: &PgPool,
    trigger_id: Uuid,
    scheduled_for: DateTime<Utc>,
    task_parameters_snapshot: serde_json::Value,
    max_retries: i32,
) -> Result<Run, CoreError> {
    runs::create_run(pool, trigger_id, scheduled_for, task_parameters_snapshot, max_retries)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::trigger(trigger_id)))
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Run, CoreError> {
    runs::get_run(pool, id)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::run(id)))?
        .ok_or_else(|| CoreError::not_found("run not found", ErrCtx::run(id)))
}

pub async fn list_by_trigger(
    pool: &PgPool,
    trigger_id: Uuid,
    page: i64,
    page_size: i64,
) -> Result<Vec<Run>, CoreError> {
    if page < 1 {
        return Err(CoreError::validation("page must be >= 1", ErrCtx::default()));
    }
    if !(1..=100).contains(&page_size) {
        return Err(CoreError::validation(
            "page_size must be between 1 and 100",
            ErrCtx::default(),
        ));
    }
    runs::list_by_trigger(pool, trigger_id, page, page_size)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::trigger(trigger_id)))
}

pub async fn mark_queued(pool: &PgPool, id: Uuid, lease_id: Uuid) -> Result<(), CoreError> {
    let ok = runs::mark_queued(pool, id, lease_id)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::run(id)))?;
    if ok {
        Ok(())
    } else {
        Err(CoreError::conflict(
            "run is not in a state that can be queued",
            ErrCtx::run(id),
        ))
    }
}

pub async fn mark_started(pool: &PgPool, id: Uuid, worker_id: &str) -> Result<(), CoreError> {
    let ok = runs::mark_started(pool, id, worker_id)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::run(id)))?;
    if ok {
        Ok(())
    } else {
        Err(CoreError::conflict(
            "run is not queued, cannot start",
            ErrCtx::run(id),
        ))
    }
}

pub async fn mark_completed(pool: &PgPool, id: Uuid, result_data: serde_json::Value) -> Result<(), CoreError> {
    let ok = runs::mark_completed(pool, id, result_data)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::run(id)))?;
    if ok {
        Ok(())
    } else {
        Err(CoreError::conflict(
            "run is not running, cannot complete",
            ErrCtx::run(id),
        ))
    }
}

pub async fn mark_failed(
    pool: &PgPool,
    id: Uuid,
    kind: ErrorKind,
    message: &str,
    details: Option<serde_json::Value>,
) -> Result<(), CoreError> {
    let ok = runs::mark_failed(pool, id, kind, message, details)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::run(id)))?;
    if ok {
        Ok(())
    } else {
        Err(CoreError::conflict(
            "run cannot be marked failed from its current status",
            ErrCtx::run(id),
        ))
    }
}

pub async fn mark_cancelled(pool: &PgPool, id: Uuid) -> Result<(), CoreError> {
    let ok = runs::mark_cancelled(pool, id)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::run(id)))?;
    if ok {
        Ok(())
    } else {
        Err(CoreError::conflict(
            "run is already in a terminal state",
            ErrCtx::run(id),
        ))
    }
}

pub async fn mark_aborted(pool: &PgPool, id: Uuid, kind: ErrorKind, message: &str) -> Result<(), CoreError> {
    let ok = runs::mark_aborted(pool, id, kind, message)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::run(id)))?;
    if ok {
        Ok(())
    } else {
        Err(CoreError::conflict(
            "run is already in a terminal state",
            ErrCtx::run(id),
        ))
    }
}

pub async fn schedule_retry(
    pool: &PgPool,
    id: Uuid,
    next_retry_at: DateTime<Utc>,
    reason: &str,
    delay_seconds: f64,
) -> Result<(), CoreError> {
    let ok = runs::schedule_retry(pool, id, next_retry_at, reason, delay_seconds)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::run(id)))?;
    if ok {
        Ok(())
    } else {
        Err(CoreError::conflict(
            "run cannot be retried from its current status or attempt count",
            ErrCtx::run(id),
        ))
    }
}

pub async fn fetch_ready_retries(pool: &PgPool, now: DateTime<Utc>, limit: i64) -> Result<Vec<Run>, CoreError> {
    runs::fetch_ready_retries(pool, now, limit)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::default()))
}

pub async fn fetch_pending_unleased(pool: &PgPool, now: DateTime<Utc>, limit: i64) -> Result<Vec<Run>, CoreError> {
    runs::fetch_pending_unleased(pool, now, limit)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::default()))
}

pub async fn fetch_stalled(pool: &PgPool, now: DateTime<Utc>, limit: i64) -> Result<Vec<Run>, CoreError> {
    runs::fetch_stalled(pool, now, limit)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::default()))
}
