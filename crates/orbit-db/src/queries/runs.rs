//! Database query functions for the `runs` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ErrorKind, Run, RunStatus};

/// Insert a new run in `pending` status for a trigger's fire at `scheduled_for`.
pub async fn create_run(
    pool: &PgPool,
    trigger_id: Uuid,
    scheduled_for: DateTime<Utc>,
    task_parameters_snapshot: serde_json::Value,
    max_retries: i32,
) -> Result<Run> {
    let run = sqlx::query_as::<_, Run>(
        "INSERT INTO runs (trigger_id, status, scheduled_for, task_parameters_snapshot, max_retries) \
         VALUES ($1, 'pending', $2, $3, $4) \
         RETURNING *",
    )
    .bind(trigger_id)
    .bind(scheduled_for)
    .bind(task_parameters_snapshot)
    .bind(max_retries)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to create run for trigger {trigger_id}"))?;

    Ok(run)
}

/// Fetch a run by id.
pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<Option<Run>> {
    let run = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch run")?;
    Ok(run)
}

/// List runs for a trigger, most recent first.
pub async fn list_by_trigger(
    pool: &PgPool,
    trigger_id: Uuid,
    page: i64,
    page_size: i64,
) -> Result<Vec<Run>> {
    let offset = (page.max(1) - 1) * page_size;
    let runs = sqlx::query_as::<_, Run>(
        "SELECT * FROM runs WHERE trigger_id = $1 \
         ORDER BY scheduled_for DESC \
         LIMIT $2 OFFSET $3",
    )
    .bind(trigger_id)
    .bind(page_size)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("failed to list runs for trigger")?;

    Ok(runs)
}

/// Mark a run `queued`, recording the lease that claimed it.
pub async fn mark_queued(pool: &PgPool, id: Uuid, lease_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE runs SET status = 'queued', queued_at = now(), lease_id = $1 \
         WHERE id = $2 AND status IN ('pending', 'retrying')",
    )
    .bind(lease_id)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark run queued")?;

    Ok(result.rows_affected() > 0)
}

/// Mark a run `running`, recording the worker that picked it up.
///
/// Guarded to only transition out of `queued` -- a terminal or already-running
/// run cannot be restarted by a racing worker.
pub async fn mark_started(pool: &PgPool, id: Uuid, worker_id: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE runs SET status = 'running', started_at = now(), worker_id = $1, attempt = attempt + 1 \
         WHERE id = $2 AND status = 'queued'",
    )
    .bind(worker_id)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark run started")?;

    Ok(result.rows_affected() > 0)
}

/// Mark a run ended successfully.
pub async fn mark_completed(pool: &PgPool, id: Uuid, result_data: serde_json::Value) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE runs SET status = 'completed', ended_at = now(), result_data = $1 \
         WHERE id = $2 AND status = 'running'",
    )
    .bind(result_data)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark run completed")?;

    Ok(result.rows_affected() > 0)
}

/// Mark a run failed (terminal, no further retries).
pub async fn mark_failed(
    pool: &PgPool,
    id: Uuid,
    kind: ErrorKind,
    message: &str,
    details: Option<serde_json::Value>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE runs SET status = 'failed', ended_at = now(), \
                error_kind = $1, error_message = $2, error_details = $3 \
         WHERE id = $4 AND status IN ('running', 'queued')",
    )
    .bind(kind)
    .bind(message)
    .bind(details)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark run failed")?;

    Ok(result.rows_affected() > 0)
}

/// Mark a run cancelled (caller-initiated, cooperative).
pub async fn mark_cancelled(pool: &PgPool, id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE runs SET status = 'cancelled', ended_at = now() \
         WHERE id = $1 AND status NOT IN ('completed', 'cancelled', 'aborted')",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark run cancelled")?;

    Ok(result.rows_affected() > 0)
}

/// Mark a run aborted (max retries exhausted, or non-retriable failure).
pub async fn mark_aborted(
    pool: &PgPool,
    id: Uuid,
    kind: ErrorKind,
    message: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE runs SET status = 'aborted', ended_at = now(), \
                error_kind = $1, error_message = $2 \
         WHERE id = $3 AND status NOT IN ('completed', 'cancelled', 'aborted')",
    )
    .bind(kind)
    .bind(message)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark run aborted")?;

    Ok(result.rows_affected() > 0)
}

/// Schedule a retry: append to `retry_history`, bump `next_retry_at`, and
/// move the run to `retrying`. The caller computes the delay (exponential
/// backoff with jitter) before calling this.
pub async fn schedule_retry(
    pool: &PgPool,
    id: Uuid,
    next_retry_at: DateTime<Utc>,
    reason: &str,
    delay_seconds: f64,
) -> Result<bool> {
    let history_entry = serde_json::json!({
        "scheduled_for": next_retry_at,
        "reason": reason,
        "delay_seconds": delay_seconds,
    });

    let result = sqlx::query(
        "UPDATE runs SET status = 'retrying', next_retry_at = $1, \
                retry_history = retry_history || $2::jsonb \
         WHERE id = $3 AND status IN ('running', 'queued') AND attempt <= max_retries",
    )
    .bind(next_retry_at)
    .bind(history_entry)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to schedule run retry")?;

    Ok(result.rows_affected() > 0)
}

/// Return runs in `retrying` status whose `next_retry_at` has elapsed, ready
/// to be requeued by the Retry Coordinator.
pub async fn fetch_ready_retries(pool: &PgPool, now: DateTime<Utc>, limit: i64) -> Result<Vec<Run>> {
    let runs = sqlx::query_as::<_, Run>(
        "SELECT * FROM runs \
         WHERE status = 'retrying' AND next_retry_at <= $1 \
         ORDER BY next_retry_at ASC \
         LIMIT $2",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to fetch ready retries")?;

    Ok(runs)
}

/// Return runs in `pending` status with no lease yet, ordered oldest first.
/// Sourced by manual trigger fires, which insert a run directly rather than
/// going through the Priority Queue's due-trigger scan.
pub async fn fetch_pending_unleased(pool: &PgPool, now: DateTime<Utc>, limit: i64) -> Result<Vec<Run>> {
    let runs = sqlx::query_as::<_, Run>(
        "SELECT * FROM runs \
         WHERE status = 'pending' AND lease_id IS NULL AND scheduled_for <= $1 \
         ORDER BY scheduled_for ASC \
         LIMIT $2",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to fetch pending unleased runs")?;

    Ok(runs)
}

/// Return runs that are past their deadline (`started_at + max_exec_seconds`)
/// and still `running`, for the stall detector to time out.
pub async fn fetch_stalled(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Run>> {
    let runs = sqlx::query_as::<_, Run>(
        "SELECT runs.* FROM runs \
         JOIN triggers ON triggers.id = runs.trigger_id \
         WHERE runs.status = 'running' \
           AND runs.started_at IS NOT NULL \
           AND runs.started_at + (triggers.max_exec_seconds || ' seconds')::interval <= $1 \
         ORDER BY runs.started_at ASC \
         LIMIT $2",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to fetch stalled runs")?;

    Ok(runs)
}

/// Count runs by status for a trigger, used by uptime/health rollups.
pub async fn count_by_status(pool: &PgPool, trigger_id: Uuid, status: RunStatus) -> Result<i64> {
    let count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM runs WHERE trigger_id = $1 AND status = $2",
    )
    .bind(trigger_id)
    .bind(status)
    .fetch_one(pool)
    .await
    .context("failed to count runs by status")?;

    Ok(count.0)
}
