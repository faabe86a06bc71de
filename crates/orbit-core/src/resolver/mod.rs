//! Trigger Resolver (C7): computes the next fire time for a trigger after
//! creation or after a run concludes, and evaluates the non-time-based
//! activation rules (`event`, `dependency`, `conditional`).

pub mod conditional;

use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use orbit_db::models::{DependencyPredicate, RunStatus, Trigger};

use crate::error::{CoreError, ErrCtx};

/// `time_based`: parse the cron expression in the trigger's timezone,
/// find the next instant after `after`, then clamp into the configured
/// per-day window if one is set.
///
/// DST handling follows the `cron`/`chrono-tz` interpretation of the named
/// zone: a spring-forward gap skips the missing local time entirely (the
/// next representable instant fires), and a fall-back ambiguity resolves
/// to the earliest of the two valid instants, matching `chrono`'s
/// `LocalResult::Ambiguous` -> earliest convention used throughout.
pub fn next_fire_time_based(
    trigger: &Trigger,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, CoreError> {
    let cron_expr = trigger.cron_expression.as_deref().ok_or_else(|| {
        CoreError::validation(
            "time_based trigger is missing cron_expression",
            ErrCtx::trigger(trigger.id),
        )
    })?;
    let tz_name = trigger.timezone.as_deref().unwrap_or("UTC");
    let tz: Tz = tz_name.parse().map_err(|_| {
        CoreError::validation(
            format!("unrecognized IANA timezone: {tz_name:?}"),
            ErrCtx::trigger(trigger.id),
        )
    })?;

    let schedule = parse_five_field_cron(cron_expr, trigger.id)?;

    let after_in_tz = after.with_timezone(&tz);
    let Some(candidate) = schedule.after(&after_in_tz).next() else {
        return Ok(None);
    };
    let mut candidate = candidate.with_timezone(&Utc);

    if let (Some(start), Some(end)) = (&trigger.window_start, &trigger.window_end) {
        candidate = apply_window(candidate, tz, start, end, trigger.id)?;
    }

    Ok(Some(candidate))
}

/// Parse a standard 5-field cron expression (minute hour day-of-month
/// month day-of-week) by adapting it to the `cron` crate's native 6-field
/// (seconds-first) format. §6's controller-side validation already
/// enforces "exactly five whitespace-separated fields"; this is the
/// resolver's own defense of the same invariant.
fn parse_five_field_cron(
    expr: &str,
    trigger_id: uuid::Uuid,
) -> Result<cron::Schedule, CoreError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(CoreError::validation(
            format!(
                "cron expression must have exactly five fields, got {}",
                fields.len()
            ),
            ErrCtx::trigger(trigger_id),
        ));
    }
    let six_field = format!("0 {expr}");
    cron::Schedule::from_str(&six_field).map_err(|e| {
        CoreError::validation(
            format!("invalid cron expression {expr:?}: {e}"),
            ErrCtx::trigger(trigger_id),
        )
    })
}

/// Advance `candidate` forward to the next instant that falls inside the
/// `[window_start, window_end]` HH:MM window, interpreted in `tz`.
fn apply_window(
    candidate: DateTime<Utc>,
    tz: Tz,
    window_start: &str,
    window_end: &str,
    trigger_id: uuid::Uuid,
) -> Result<DateTime<Utc>, CoreError> {
    let start = parse_hhmm(window_start, trigger_id)?;
    let end = parse_hhmm(window_end, trigger_id)?;

    let local = candidate.with_timezone(&tz);
    let local_time = local.time();
    let local_date = local.date_naive();

    let windowed_local = if local_time < start {
        local_date.and_time(start)
    } else if local_time > end {
        (local_date + Duration::days(1)).and_time(start)
    } else {
        return Ok(candidate);
    };

    let resolved = tz
        .from_local_datetime(&windowed_local)
        .earliest()
        .ok_or_else(|| {
            CoreError::internal(
                "window boundary fell in a non-existent local time",
                ErrCtx::trigger(trigger_id),
            )
        })?;
    Ok(resolved.with_timezone(&Utc))
}

fn parse_hhmm(s: &str, trigger_id: uuid::Uuid) -> Result<NaiveTime, CoreError> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|_| {
        CoreError::validation(
            format!("invalid HH:MM window bound: {s:?}"),
            ErrCtx::trigger(trigger_id),
        )
    })
}

/// `interval`: `last_fire_at + interval`, or `now + interval` on first
/// activation (`last_fire_at` unset).
pub fn next_fire_interval(
    trigger: &Trigger,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, CoreError> {
    let interval_seconds = trigger.interval_seconds.ok_or_else(|| {
        CoreError::validation(
            "interval trigger is missing interval_seconds",
            ErrCtx::trigger(trigger.id),
        )
    })?;
    if interval_seconds <= 0 {
        return Err(CoreError::validation(
            "interval_seconds must be > 0",
            ErrCtx::trigger(trigger.id),
        ));
    }
    let base = trigger.last_fire_at.unwrap_or(now);
    Ok(base + Duration::seconds(interval_seconds))
}

/// `event`/`webhook`: whether an inbound event of `event_type` matches this
/// trigger's filter set. A match means the caller should enqueue a
/// one-shot run; these kinds never set `next_fire_at` from the resolver.
pub fn matches_event(trigger: &Trigger, event_type: &str) -> bool {
    trigger
        .event_types
        .as_deref()
        .is_some_and(|types| types.iter().any(|t| t == event_type))
}

/// `dependency`: evaluate `predicate` against the latest known status of
/// each dependency trigger. `None` means "no run yet" and counts as not
/// satisfied for every predicate.
pub fn evaluate_dependency(
    predicate: DependencyPredicate,
    latest_statuses: &[Option<RunStatus>],
) -> bool {
    if latest_statuses.is_empty() {
        return false;
    }
    match predicate {
        DependencyPredicate::AllSuccess => latest_statuses
            .iter()
            .all(|s| matches!(s, Some(RunStatus::Completed))),
        DependencyPredicate::AnySuccess => latest_statuses
            .iter()
            .any(|s| matches!(s, Some(RunStatus::Completed))),
        DependencyPredicate::AllComplete => latest_statuses
            .iter()
            .all(|s| s.is_some_and(RunStatus::is_terminal)),
    }
}

/// `conditional`: evaluate the trigger's boolean expression against a
/// caller-supplied context. Delegates to [`conditional::evaluate`].
pub fn evaluate_conditional(
    trigger: &Trigger,
    context: &serde_json::Value,
) -> Result<bool, CoreError> {
    let expr = trigger.condition_expression.as_deref().ok_or_else(|| {
        CoreError::validation(
            "conditional trigger is missing condition_expression",
            ErrCtx::trigger(trigger.id),
        )
    })?;
    conditional::evaluate(expr, context)
        .map_err(|e| CoreError::validation(e, ErrCtx::trigger(trigger.id)))
}
