//! Database query functions for the `triggers` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{DependencyPredicate, Trigger, TriggerKind, TriggerStatus};

/// Parameters for inserting a new trigger.
#[derive(Debug, Clone)]
pub struct NewTrigger {
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
    pub max_exec_seconds: i32,

    pub max_retries: i32,
    pub base_delay_seconds: i32,
    pub backoff_multiplier: f64,
    pub max_delay_seconds: Option<i32>,

    pub next_fire_at: Option<DateTime<Utc>>,
}

/// Insert a new trigger. Returns the inserted row with server-generated
/// defaults (id, version, created_at, updated_at).
pub async fn create_trigger(pool: &PgPool, new: &NewTrigger) -> Result<Trigger> {
    let trigger = sqlx::query_as::<_, Trigger>(
        "INSERT INTO triggers \
         (name, organization_id, created_by, kind, status, \
          cron_expression, timezone, interval_seconds, event_types, \
          dependency_trigger_ids, dependency_predicate, condition_expression, \
          window_start, window_end, task_type, task_config, task_parameters, \
          priority, max_concurrent_runs, max_exec_seconds, max_retries, base_delay_seconds, \
          backoff_multiplier, max_delay_seconds, next_fire_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, \
                 $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25) \
         RETURNING *",
    )
    .bind(&new.name)
    .bind(&new.organization_id)
    .bind(&new.created_by)
    .bind(new.kind)
    .bind(new.status)
    .bind(&new.cron_expression)
    .bind(&new.timezone)
    .bind(new.interval_seconds)
    .bind(&new.event_types)
    .bind(&new.dependency_trigger_ids)
    .bind(new.dependency_predicate)
    .bind(&new.condition_expression)
    .bind(&new.window_start)
    .bind(&new.window_end)
    .bind(&new.task_type)
    .bind(&new.task_config)
    .bind(&new.task_parameters)
    .bind(new.priority)
    .bind(new.max_concurrent_runs)
    .bind(new.max_exec_seconds)
    .bind(new.max_retries)
    .bind(new.base_delay_seconds)
    .bind(new.backoff_multiplier)
    .bind(new.max_delay_seconds)
    .bind(new.next_fire_at)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert trigger {:?}", new.name))?;

    Ok(trigger)
}

/// Fetch a trigger by id.
pub async fn get_trigger(pool: &PgPool, id: Uuid) -> Result<Option<Trigger>> {
    let trigger = sqlx::query_as::<_, Trigger>("SELECT * FROM triggers WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch trigger")?;
    Ok(trigger)
}

/// List triggers for an organization, optionally filtered by status, newest first.
pub async fn list_triggers(
    pool: &PgPool,
    organization_id: &str,
    status: Option<TriggerStatus>,
    page: i64,
    page_size: i64,
) -> Result<Vec<Trigger>> {
    let offset = (page.max(1) - 1) * page_size;
    let triggers = match status {
        Some(status) => {
            sqlx::query_as::<_, Trigger>(
                "SELECT * FROM triggers \
                 WHERE organization_id = $1 AND status = $2 \
                 ORDER BY created_at DESC \
                 LIMIT $3 OFFSET $4",
            )
            .bind(organization_id)
            .bind(status)
            .bind(page_size)
            .bind(offset)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Trigger>(
                "SELECT * FROM triggers \
                 WHERE organization_id = $1 \
                 ORDER BY created_at DESC \
                 LIMIT $2 OFFSET $3",
            )
            .bind(organization_id)
            .bind(page_size)
            .bind(offset)
            .fetch_all(pool)
            .await
        }
    }
    .context("failed to list triggers")?;

    Ok(triggers)
}

/// Patch for a partial trigger update (`PUT /triggers/{id}`). Every field is
/// optional; `None` leaves the column untouched. Status transitions go
/// through [`transition_status`] instead, which validates the transition
/// graph -- this patch never touches `status`.
#[derive(Debug, Clone, Default)]
pub struct TriggerPatch {
    pub name: Option<String>,
    pub cron_expression: Option<String>,
    pub timezone: Option<String>,
    pub interval_seconds: Option<i64>,
    pub event_types: Option<Vec<String>>,
    pub dependency_trigger_ids: Option<Vec<Uuid>>,
    pub dependency_predicate: Option<DependencyPredicate>,
    pub condition_expression: Option<String>,
    pub window_start: Option<String>,
    pub window_end: Option<String>,
    pub task_config: Option<serde_json::Value>,
    pub task_parameters: Option<serde_json::Value>,
    pub priority: Option<i32>,
    pub max_concurrent_runs: Option<i32>,
    pub max_exec_seconds: Option<i32>,
    pub max_retries: Option<i32>,
    pub base_delay_seconds: Option<i32>,
    pub backoff_multiplier: Option<f64>,
    pub max_delay_seconds: Option<i32>,
    pub next_fire_at: Option<DateTime<Utc>>,
}

/// Apply a partial update, guarded by the optimistic `version` column.
/// `COALESCE` leaves untouched any column whose patch field is `NULL`.
/// Returns `None` if the row is gone or `expected_version` is stale.
pub async fn update_trigger(
    pool: &PgPool,
    id: Uuid,
    expected_version: i32,
    patch: &TriggerPatch,
) -> Result<Option<Trigger>> {
    let trigger = sqlx::query_as::<_, Trigger>(
        "UPDATE triggers SET \
            name = COALESCE($1, name), \
            cron_expression = COALESCE($2, cron_expression), \
            timezone = COALESCE($3, timezone), \
            interval_seconds = COALESCE($4, interval_seconds), \
            event_types = COALESCE($5, event_types), \
            dependency_trigger_ids = COALESCE($6, dependency_trigger_ids), \
            dependency_predicate = COALESCE($7, dependency_predicate), \
            condition_expression = COALESCE($8, condition_expression), \
            window_start = COALESCE($9, window_start), \
            window_end = COALESCE($10, window_end), \
            task_config = COALESCE($11, task_config), \
            task_parameters = COALESCE($12, task_parameters), \
            priority = COALESCE($13, priority), \
            max_concurrent_runs = COALESCE($14, max_concurrent_runs), \
            max_exec_seconds = COALESCE($15, max_exec_seconds), \
            max_retries = COALESCE($16, max_retries), \
            base_delay_seconds = COALESCE($17, base_delay_seconds), \
            backoff_multiplier = COALESCE($18, backoff_multiplier), \
            max_delay_seconds = COALESCE($19, max_delay_seconds), \
            next_fire_at = COALESCE($20, next_fire_at), \
            version = version + 1, \
            updated_at = now() \
         WHERE id = $21 AND version = $22 \
         RETURNING *",
    )
    .bind(&patch.name)
    .bind(&patch.cron_expression)
    .bind(&patch.timezone)
    .bind(patch.interval_seconds)
    .bind(&patch.event_types)
    .bind(&patch.dependency_trigger_ids)
    .bind(patch.dependency_predicate)
    .bind(&patch.condition_expression)
    .bind(&patch.window_start)
    .bind(&patch.window_end)
    .bind(&patch.task_config)
    .bind(&patch.task_parameters)
    .bind(patch.priority)
    .bind(patch.max_concurrent_runs)
    .bind(patch.max_exec_seconds)
    .bind(patch.max_retries)
    .bind(patch.base_delay_seconds)
    .bind(patch.backoff_multiplier)
    .bind(patch.max_delay_seconds)
    .bind(patch.next_fire_at)
    .bind(id)
    .bind(expected_version)
    .fetch_optional(pool)
    .await
    .context("failed to update trigger")?;

    Ok(trigger)
}

/// Result of a status transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Ok,
    NotFound,
    InvalidTransition,
}

/// Transition a trigger's status, validating the transition graph and using
/// an optimistic version check so concurrent administrative updates cannot
/// silently clobber each other.
pub async fn transition_status(
    pool: &PgPool,
    id: Uuid,
    expected: TriggerStatus,
    target: TriggerStatus,
) -> Result<TransitionOutcome> {
    if !expected.can_transition_to(target) {
        return Ok(TransitionOutcome::InvalidTransition);
    }

    let result = sqlx::query(
        "UPDATE triggers SET status = $1, version = version + 1, updated_at = now() \
         WHERE id = $2 AND status = $3",
    )
    .bind(target)
    .bind(id)
    .bind(expected)
    .execute(pool)
    .await
    .context("failed to transition trigger status")?;

    if result.rows_affected() == 0 {
        // Either the row is gone, or another writer already moved it off
        // `expected` -- distinguish by re-reading.
        let current = get_trigger(pool, id).await?;
        return Ok(match current {
            None => TransitionOutcome::NotFound,
            Some(_) => TransitionOutcome::InvalidTransition,
        });
    }

    Ok(TransitionOutcome::Ok)
}

/// Archive a trigger (soft-delete): `status -> archived` regardless of the
/// current status, as long as it is not already archived.
pub async fn soft_delete(pool: &PgPool, id: Uuid) -> Result<TransitionOutcome> {
    let result = sqlx::query(
        "UPDATE triggers SET status = 'archived', version = version + 1, updated_at = now() \
         WHERE id = $1 AND status <> 'archived'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to archive trigger")?;

    if result.rows_affected() == 0 {
        let current = get_trigger(pool, id).await?;
        return Ok(match current {
            None => TransitionOutcome::NotFound,
            Some(_) => TransitionOutcome::InvalidTransition,
        });
    }
    Ok(TransitionOutcome::Ok)
}

/// Return up to `limit` active triggers due to fire at or before `now`,
/// ordered by `(next_fire_at ASC, priority DESC)`. Triggers already at their
/// concurrency cap are skipped. Ties on both break by trigger id for
/// determinism. See `bump_fire` for the optimistic update half of this
/// contract.
pub async fn fetch_due(pool: &PgPool, now: DateTime<Utc>, limit: i64) -> Result<Vec<Trigger>> {
    let triggers = sqlx::query_as::<_, Trigger>(
        "SELECT * FROM triggers \
         WHERE status = 'active' \
           AND next_fire_at IS NOT NULL \
           AND next_fire_at <= $1 \
           AND current_runs < max_concurrent_runs \
         ORDER BY next_fire_at ASC, priority DESC, id ASC \
         LIMIT $2",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to fetch due triggers")?;

    Ok(triggers)
}

/// Atomically advance a trigger's schedule after a fire.
///
/// Uses the optimistic `version` column so concurrent `bump_fire` calls
/// (e.g. from a crashed-and-restarted filler) cannot lose an update; the
/// caller must re-fetch and retry on `false`.
pub async fn bump_fire(
    pool: &PgPool,
    id: Uuid,
    expected_version: i32,
    new_next_fire_at: Option<DateTime<Utc>>,
    last_fire_at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE triggers \
         SET next_fire_at = $1, last_fire_at = $2, version = version + 1, updated_at = now() \
         WHERE id = $3 AND version = $4",
    )
    .bind(new_next_fire_at)
    .bind(last_fire_at)
    .bind(id)
    .bind(expected_version)
    .execute(pool)
    .await
    .context("failed to bump trigger fire schedule")?;

    Ok(result.rows_affected() > 0)
}

/// Increment `current_runs` when a run starts. Caller must later call
/// [`decrement_current_runs`] when the run ends.
pub async fn increment_current_runs(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE triggers SET current_runs = current_runs + 1, updated_at = now() \
         WHERE id = $1",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to increment current_runs")?;
    Ok(())
}

/// Increment `current_runs` only if doing so would not exceed
/// `max_concurrent_runs`. Used by the retry dispatch path, where a run
/// re-enters the concurrency count outside the `fetch_due` query that
/// already filters on this condition for fresh fires.
pub async fn try_increment_current_runs(pool: &PgPool, id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE triggers SET current_runs = current_runs + 1, updated_at = now() \
         WHERE id = $1 AND current_runs < max_concurrent_runs",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to conditionally increment current_runs")?;
    Ok(result.rows_affected() > 0)
}

/// Decrement `current_runs` when a run ends, and roll the run's outcome
/// into the trigger's aggregate stats.
pub async fn decrement_current_runs(pool: &PgPool, id: Uuid, succeeded: bool) -> Result<()> {
    if succeeded {
        sqlx::query(
            "UPDATE triggers SET \
                current_runs = GREATEST(current_runs - 1, 0), \
                total_runs = total_runs + 1, \
                success_runs = success_runs + 1, \
                updated_at = now() \
             WHERE id = $1",
        )
    } else {
        sqlx::query(
            "UPDATE triggers SET \
                current_runs = GREATEST(current_runs - 1, 0), \
                total_runs = total_runs + 1, \
                failure_runs = failure_runs + 1, \
                updated_at = now() \
             WHERE id = $1",
        )
    }
    .bind(id)
    .execute(pool)
    .await
    .context("failed to decrement current_runs")?;
    Ok(())
}
