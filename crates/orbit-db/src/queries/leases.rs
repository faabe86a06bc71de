//! Database query functions for the `leases` table.
//!
//! Lease acquisition is expressed as a single atomic upsert so that TTL
//! expiry requires no background sweep: a conflicting row is only replaced
//! when it has already expired, so Postgres itself is the authority on
//! whether a resource is currently claimed.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Lease;

/// Attempt to acquire an exclusive lease on `(resource_type, resource_id)`.
///
/// Returns `Some(lease)` on success. Returns `None` when the resource is
/// already held by a live lease (one whose `expires_at` is still in the
/// future) -- the caller should treat this as `NoneAvailable` / contention,
/// not an error.
#[allow(clippy::too_many_arguments)]
pub async fn acquire(
    pool: &PgPool,
    now: DateTime<Utc>,
    resource_type: &str,
    resource_id: &str,
    worker_id: &str,
    process_id: Option<&str>,
    duration_seconds: i32,
    auto_extend: bool,
    max_extensions: i32,
    heartbeat_interval_seconds: Option<i32>,
) -> Result<Option<Lease>> {
    let expires_at = now + chrono::Duration::seconds(duration_seconds as i64);

    let lease = sqlx::query_as::<_, Lease>(
        "INSERT INTO leases \
            (resource_type, resource_id, worker_id, process_id, acquired_at, expires_at, \
             duration_seconds, auto_extend, max_extensions, current_extensions, \
             last_heartbeat, heartbeat_interval_seconds, heartbeat_failures) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, $5, $10, 0) \
         ON CONFLICT (resource_type, resource_id) DO UPDATE SET \
             worker_id = EXCLUDED.worker_id, \
             process_id = EXCLUDED.process_id, \
             acquired_at = EXCLUDED.acquired_at, \
             expires_at = EXCLUDED.expires_at, \
             duration_seconds = EXCLUDED.duration_seconds, \
             auto_extend = EXCLUDED.auto_extend, \
             max_extensions = EXCLUDED.max_extensions, \
             current_extensions = 0, \
             last_heartbeat = EXCLUDED.last_heartbeat, \
             heartbeat_interval_seconds = EXCLUDED.heartbeat_interval_seconds, \
             heartbeat_failures = 0 \
         WHERE leases.expires_at <= EXCLUDED.acquired_at \
         RETURNING *",
    )
    .bind(resource_type)
    .bind(resource_id)
    .bind(worker_id)
    .bind(process_id)
    .bind(now)
    .bind(expires_at)
    .bind(duration_seconds)
    .bind(auto_extend)
    .bind(max_extensions)
    .bind(heartbeat_interval_seconds)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to acquire lease on {resource_type}/{resource_id}"))?;

    Ok(lease)
}

/// Release a lease. Only the owning worker may release it; a mismatch or a
/// missing row both return `false`.
pub async fn release(pool: &PgPool, lease_id: Uuid, worker_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM leases WHERE lease_id = $1 AND worker_id = $2")
        .bind(lease_id)
        .bind(worker_id)
        .execute(pool)
        .await
        .context("failed to release lease")?;

    Ok(result.rows_affected() > 0)
}

/// Extend a lease's expiry by `extend_seconds`, provided the owner matches,
/// the lease has not already expired, and `current_extensions < max_extensions`.
pub async fn extend(
    pool: &PgPool,
    now: DateTime<Utc>,
    lease_id: Uuid,
    worker_id: &str,
    extend_seconds: i32,
) -> Result<Option<Lease>> {
    let lease = sqlx::query_as::<_, Lease>(
        "UPDATE leases SET \
             expires_at = expires_at + ($1 || ' seconds')::interval, \
             current_extensions = current_extensions + 1 \
         WHERE lease_id = $2 AND worker_id = $3 \
           AND expires_at > $4 \
           AND current_extensions < max_extensions \
         RETURNING *",
    )
    .bind(extend_seconds)
    .bind(lease_id)
    .bind(worker_id)
    .bind(now)
    .fetch_optional(pool)
    .await
    .context("failed to extend lease")?;

    Ok(lease)
}

/// Record a heartbeat from the lease owner, resetting the consecutive
/// failure counter. Used by the auto-extend path: a live heartbeat also
/// pushes `expires_at` forward by `duration_seconds` when `auto_extend`.
pub async fn heartbeat(pool: &PgPool, now: DateTime<Utc>, lease_id: Uuid, worker_id: &str) -> Result<Option<Lease>> {
    let lease = sqlx::query_as::<_, Lease>(
        "UPDATE leases SET \
             last_heartbeat = $1, \
             heartbeat_failures = 0, \
             expires_at = CASE WHEN auto_extend \
                 THEN $1 + (duration_seconds || ' seconds')::interval \
                 ELSE expires_at END \
         WHERE lease_id = $2 AND worker_id = $3 AND expires_at > $1 \
         RETURNING *",
    )
    .bind(now)
    .bind(lease_id)
    .bind(worker_id)
    .fetch_optional(pool)
    .await
    .context("failed to record lease heartbeat")?;

    Ok(lease)
}

/// Fetch a lease by id.
pub async fn get(pool: &PgPool, lease_id: Uuid) -> Result<Option<Lease>> {
    let lease = sqlx::query_as::<_, Lease>("SELECT * FROM leases WHERE lease_id = $1")
        .bind(lease_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch lease")?;
    Ok(lease)
}

/// Fetch the current lease holder for a resource, if any (expired or not --
/// callers that care about liveness should check [`Lease::is_alive`]).
pub async fn get_by_resource(
    pool: &PgPool,
    resource_type: &str,
    resource_id: &str,
) -> Result<Option<Lease>> {
    let lease = sqlx::query_as::<_, Lease>(
        "SELECT * FROM leases WHERE resource_type = $1 AND resource_id = $2",
    )
    .bind(resource_type)
    .bind(resource_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch lease by resource")?;
    Ok(lease)
}

/// Report a missed heartbeat, incrementing the failure counter. Callers
/// typically treat three consecutive misses as reason to preemptively
/// release the lease rather than waiting out the full TTL.
pub async fn record_heartbeat_failure(pool: &PgPool, lease_id: Uuid) -> Result<i32> {
    let failures: (i32,) = sqlx::query_as(
        "UPDATE leases SET heartbeat_failures = heartbeat_failures + 1 \
         WHERE lease_id = $1 \
         RETURNING heartbeat_failures",
    )
    .bind(lease_id)
    .fetch_one(pool)
    .await
    .context("failed to record heartbeat failure")?;

    Ok(failures.0)
}

/// Return all currently-live leases (not yet expired), for health/diagnostic
/// listing.
pub async fn list_live(pool: &PgPool) -> Result<Vec<Lease>> {
    let leases = sqlx::query_as::<_, Lease>(
        "SELECT * FROM leases WHERE expires_at > now() ORDER BY expires_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list live leases")?;
    Ok(leases)
}

/// Used by tests and diagnostics to force a lease's `expires_at` into the
/// past without waiting out the real TTL.
pub async fn force_expire(pool: &PgPool, lease_id: Uuid, when: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE leases SET expires_at = $1 WHERE lease_id = $2")
        .bind(when)
        .bind(lease_id)
        .execute(pool)
        .await
        .context("failed to force-expire lease")?;
    Ok(())
}
