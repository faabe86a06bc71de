//! Lease Manager (C3): acquire/extend/release distributed leases keyed by
//! `(resource_type, resource_id)`.
//!
//! Acquisition is a single atomic upsert (`orbit_db::queries::leases::acquire`)
//! so expiry needs no background sweep: a conflicting row is only replaced
//! once it has expired. This module adds the typed outcomes the orchestrator
//! needs on top of that primitive, following the same optimistic
//! compare-and-swap-turned-typed-outcome pattern used for trigger status
//! transitions.

use chrono::Duration;
use sqlx::PgPool;
use uuid::Uuid;

use orbit_db::models::Lease;
use orbit_db::queries::leases;

use crate::clock::Clock;
use crate::error::{CoreError, ErrCtx};

/// Resource type used for the per-trigger execution lock: leases are keyed
/// by `(scheduled_trigger, trigger_id)`.
pub const SCHEDULED_TRIGGER: &str = "scheduled_trigger";

#[derive(Debug, Clone)]
pub enum LeaseOutcome {
    Acquired(Lease),
    NoneAvailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Ok,
    NotOwner,
    Expired,
}

#[derive(Debug, Clone)]
pub enum ExtendOutcome {
    Ok(Lease),
    NotOwner,
    Expired,
    LimitReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Ok,
    NotOwner,
    Expired,
}

/// Snapshot returned by [`health`].
#[derive(Debug, Clone, Copy)]
pub struct LeaseHealth {
    pub alive: bool,
    pub time_to_expiry: Duration,
    pub extensions_remaining: i32,
}

/// Attempt to acquire an exclusive lease. Never blocks: a losing racer gets
/// `NoneAvailable` immediately (property 2, "lease mutual exclusion").
#[allow(clippy::too_many_arguments)]
pub async fn acquire(
    pool: &PgPool,
    clock: &dyn Clock,
    resource_type: &str,
    resource_id: &str,
    duration: Duration,
    owner: &str,
    process_id: Option<&str>,
    auto_extend: bool,
    max_extensions: i32,
    heartbeat_interval_seconds: Option<i32>,
) -> Result<LeaseOutcome, CoreError> {
    if duration.num_seconds() < 1 || duration.num_seconds() > 3600 {
        return Err(CoreError::validation(
            "lease duration_seconds must be between 1 and 3600",
            ErrCtx::default(),
        ));
    }

    let result = leases::acquire(
        pool,
        clock.now(),
        resource_type,
        resource_id,
        owner,
        process_id,
        duration.num_seconds() as i32,
        auto_extend,
        max_extensions,
        heartbeat_interval_seconds,
    )
    .await
    .map_err(|e| CoreError::unavailable(e.to_string(), ErrCtx::default()))?;

    Ok(match result {
        Some(lease) => LeaseOutcome::Acquired(lease),
        None => LeaseOutcome::NoneAvailable,
    })
}

/// Release a lease. A non-owner release fails without side effects; an
/// already-expired lease is a no-op that reports `Expired`.
pub async fn release(pool: &PgPool, clock: &dyn Clock, lease_id: Uuid, owner: &str) -> Result<ReleaseOutcome, CoreError> {
    let existing = leases::get(pool, lease_id)
        .await
        .map_err(|e| CoreError::unavailable(e.to_string(), ErrCtx::lease(lease_id)))?;

    let Some(lease) = existing else {
        return Ok(ReleaseOutcome::Expired);
    };

    if lease.worker_id != owner {
        return Ok(ReleaseOutcome::NotOwner);
    }

    if lease.expires_at <= clock.now() {
        return Ok(ReleaseOutcome::Expired);
    }

    let released = leases::release(pool, lease_id, owner)
        .await
        .map_err(|e| CoreError::unavailable(e.to_string(), ErrCtx::lease(lease_id)))?;

    Ok(if released {
        ReleaseOutcome::Ok
    } else {
        // Lost a race with expiry/another release between the read above
        // and this delete; treat the same as "already gone".
        ReleaseOutcome::Expired
    })
}

/// Extend a lease's expiry, provided the owner matches, it has not expired,
/// and the extension counter has headroom.
pub async fn extend(
    pool: &PgPool,
    clock: &dyn Clock,
    lease_id: Uuid,
    owner: &str,
    extra: Duration,
) -> Result<ExtendOutcome, CoreError> {
    let existing = leases::get(pool, lease_id)
        .await
        .map_err(|e| CoreError::unavailable(e.to_string(), ErrCtx::lease(lease_id)))?;

    let Some(lease) = existing else {
        return Ok(ExtendOutcome::Expired);
    };

    if lease.worker_id != owner {
        return Ok(ExtendOutcome::NotOwner);
    }
    if lease.expires_at <= clock.now() {
        return Ok(ExtendOutcome::Expired);
    }
    if lease.current_extensions >= lease.max_extensions {
        return Ok(ExtendOutcome::LimitReached);
    }

    let extended = leases::extend(pool, clock.now(), lease_id, owner, extra.num_seconds() as i32)
        .await
        .map_err(|e| CoreError::unavailable(e.to_string(), ErrCtx::lease(lease_id)))?;

    Ok(match extended {
        Some(lease) => ExtendOutcome::Ok(lease),
        None => ExtendOutcome::Expired,
    })
}

/// Record a heartbeat from the lease owner.
pub async fn heartbeat(
    pool: &PgPool,
    clock: &dyn Clock,
    lease_id: Uuid,
    owner: &str,
) -> Result<HeartbeatOutcome, CoreError> {
    let existing = leases::get(pool, lease_id)
        .await
        .map_err(|e| CoreError::unavailable(e.to_string(), ErrCtx::lease(lease_id)))?;

    let Some(lease) = existing else {
        return Ok(HeartbeatOutcome::Expired);
    };
    if lease.worker_id != owner {
        return Ok(HeartbeatOutcome::NotOwner);
    }
    if lease.expires_at <= clock.now() {
        return Ok(HeartbeatOutcome::Expired);
    }

    let updated = leases::heartbeat(pool, clock.now(), lease_id, owner)
        .await
        .map_err(|e| CoreError::unavailable(e.to_string(), ErrCtx::lease(lease_id)))?;

    Ok(if updated.is_some() {
        HeartbeatOutcome::Ok
    } else {
        HeartbeatOutcome::Expired
    })
}

/// Whether `owner` still holds an unexpired `lease_id`. Used to verify
/// ownership survived a long-running handler execution before writing a
/// terminal run status -- a handler that outlives its lease must not
/// clobber whatever the worker that re-acquired it is doing.
pub async fn is_owned_by(pool: &PgPool, clock: &dyn Clock, lease_id: Uuid, owner: &str) -> Result<bool, CoreError> {
    let existing = leases::get(pool, lease_id)
        .await
        .map_err(|e| CoreError::unavailable(e.to_string(), ErrCtx::lease(lease_id)))?;
    Ok(match existing {
        Some(lease) => lease.worker_id == owner && lease.expires_at > clock.now(),
        None => false,
    })
}

/// Point-in-time health snapshot for a lease.
pub async fn health(pool: &PgPool, clock: &dyn Clock, lease_id: Uuid) -> Result<LeaseHealth, CoreError> {
    let lease = leases::get(pool, lease_id)
        .await
        .map_err(|e| CoreError::unavailable(e.to_string(), ErrCtx::lease(lease_id)))?
        .ok_or_else(|| CoreError::not_found("lease not found", ErrCtx::lease(lease_id)))?;

    let now = clock.now();
    Ok(LeaseHealth {
        alive: lease.is_alive(now),
        time_to_expiry: lease.expires_at - now,
        extensions_remaining: (lease.max_extensions - lease.current_extensions).max(0),
    })
}
