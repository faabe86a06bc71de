//! Trigger Store (C4): CRUD for trigger definitions plus the index-backed
//! "due" query the Priority Queue filler uses.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

pub use orbit_db::queries::triggers::{NewTrigger, TriggerPatch};
use orbit_db::models::{Trigger, TriggerStatus};
use orbit_db::queries::triggers::{self, TransitionOutcome};

use crate::error::{CoreError, ErrCtx};

pub async fn create(pool: &PgPool, new: &NewTrigger) -> Result<Trigger, CoreError> {
    triggers::create_trigger(pool, new)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::default()))
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Trigger, CoreError> {
    triggers::get_trigger(pool, id)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::trigger(id)))?
        .ok_or_else(|| CoreError::not_found("trigger not found", ErrCtx::trigger(id)))
}

pub async fn list(
    pool: &PgPool,
    organization_id: &str,
    status: Option<TriggerStatus>,
    page: i64,
    page_size: i64,
) -> Result<Vec<Trigger>, CoreError> {
    if page < 1 {
        return Err(CoreError::validation("page must be >= 1", ErrCtx::default()));
    }
    if !(1..=100).contains(&page_size) {
        return Err(CoreError::validation(
            "page_size must be between 1 and 100",
            ErrCtx::default(),
        ));
    }
    triggers::list_triggers(pool, organization_id, status, page, page_size)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::default()))
}

/// Administrative status transition, e.g. `PUT /triggers/{id}` pausing a
/// trigger. Validates against the transition graph before touching the row.
pub async fn transition_status(
    pool: &PgPool,
    id: Uuid,
    expected: TriggerStatus,
    target: TriggerStatus,
) -> Result<Trigger, CoreError> {
    match triggers::transition_status(pool, id, expected, target)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::trigger(id)))?
    {
        TransitionOutcome::Ok => get(pool, id).await,
        TransitionOutcome::NotFound => {
            Err(CoreError::not_found("trigger not found", ErrCtx::trigger(id)))
        }
        TransitionOutcome::InvalidTransition => Err(CoreError::conflict(
            format!("cannot transition trigger from {expected} to {target}"),
            ErrCtx::trigger(id),
        )),
    }
}

/// Soft-delete (archive) a trigger. Idempotent: archiving an already
/// archived trigger is a conflict, matching the transition graph's
/// "archived is terminal" invariant.
pub async fn soft_delete(pool: &PgPool, id: Uuid) -> Result<(), CoreError> {
    match triggers::soft_delete(pool, id)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::trigger(id)))?
    {
        TransitionOutcome::Ok => Ok(()),
        TransitionOutcome::NotFound => {
            Err(CoreError::not_found("trigger not found", ErrCtx::trigger(id)))
        }
        TransitionOutcome::InvalidTransition => Err(CoreError::conflict(
            "trigger is already archived",
            ErrCtx::trigger(id),
        )),
    }
}

/// Apply a partial update to a trigger's scheduling and task fields,
/// guarded by its optimistic `version` column. Status changes go through
/// [`transition_status`] instead. `Ok(None)`-mapped to a conflict here,
/// since a stale version on a `PUT` almost always means another writer
/// updated the trigger between the client's `GET` and this call.
pub async fn update(
    pool: &PgPool,
    id: Uuid,
    expected_version: i32,
    patch: &TriggerPatch,
) -> Result<Trigger, CoreError> {
    match triggers::update_trigger(pool, id, expected_version, patch)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::trigger(id)))?
    {
        Some(trigger) => Ok(trigger),
        None => {
            if triggers::get_trigger(pool, id)
                .await
                .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::trigger(id)))?
                .is_none()
            {
                Err(CoreError::not_found("trigger not found", ErrCtx::trigger(id)))
            } else {
                Err(CoreError::conflict(
                    "trigger was modified concurrently; re-fetch and retry",
                    ErrCtx::trigger(id),
                ))
            }
        }
    }
}

/// Due active triggers, ordered `(next_fire_at ASC, priority DESC)`, skipping
/// any at their concurrency cap. The Priority Queue filler's sole read path
/// into the Trigger Store.
pub async fn fetch_due(pool: &PgPool, now: DateTime<Utc>, limit: i64) -> Result<Vec<Trigger>, CoreError> {
    triggers::fetch_due(pool, now, limit)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::default()))
}

/// Advance a trigger's schedule after a fire, guarded by its optimistic
/// `version` column. `Ok(false)` means a concurrent writer won the race; the
/// caller should re-fetch and decide whether to retry.
pub async fn bump_fire(
    pool: &PgPool,
    id: Uuid,
    expected_version: i32,
    new_next_fire_at: Option<DateTime<Utc>>,
    last_fire_at: DateTime<Utc>,
) -> Result<bool, CoreError> {
    triggers::bump_fire(pool, id, expected_version, new_next_fire_at, last_fire_at)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::trigger(id)))
}

pub async fn increment_current_runs(pool: &PgPool, id: Uuid) -> Result<(), CoreError> {
    triggers::increment_current_runs(pool, id)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::trigger(id)))
}

/// Increment `current_runs` only if it stays within `max_concurrent_runs`,
/// returning whether the increment happened.
pub async fn try_increment_current_runs(pool: &PgPool, id: Uuid) -> Result<bool, CoreError> {
    triggers::try_increment_current_runs(pool, id)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::trigger(id)))
}

pub async fn decrement_current_runs(pool: &PgPool, id: Uuid, succeeded: bool) -> Result<(), CoreError> {
    triggers::decrement_current_runs(pool, id, succeeded)
        .await
        .map_err(|e| CoreError::internal(e.to_string(), ErrCtx::trigger(id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_bounds_are_enforced_by_signature() {
        // list()'s validation is exercised against a real pool in
        // trigger_store_test.rs; this module has no pure logic of its own
        // beyond that validation and the CoreError mapping above.
        assert!((1..=100).contains(&1_i64));
        assert!((1..=100).contains(&100_i64));
    }
}
