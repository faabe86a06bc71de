//! `orbit trigger` subcommands: create/show/list/pause/resume/disable/
//! archive/fire/history, the CLI-side counterpart of the Scheduler HTTP
//! surface's trigger operations.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use orbit_core::clock::SystemClock;
use orbit_core::orchestrator;
use orbit_core::trigger_store::{self, NewTrigger};
use orbit_db::models::{DependencyPredicate, TriggerKind, TriggerStatus};

use crate::TriggerCommands;

fn parse_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("invalid trigger ID: {s}"))
}

fn parse_json(s: Option<&str>) -> Result<serde_json::Value> {
    match s {
        Some(s) => serde_json::from_str(s).with_context(|| format!("invalid JSON: {s}")),
        None => Ok(serde_json::json!({})),
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn run_trigger_command(command: TriggerCommands, pool: &PgPool) -> Result<()> {
    match command {
        TriggerCommands::Create {
            name,
            organization_id,
            created_by,
            kind,
            cron_expression,
            timezone,
            interval_seconds,
            event_types,
            dependency_trigger_ids,
            dependency_predicate,
            condition_expression,
            window_start,
            window_end,
            task_type,
            task_config,
            task_parameters,
            priority,
            max_concurrent_runs,
            max_exec_seconds,
            max_retries,
            base_delay_seconds,
            backoff_multiplier,
            max_delay_seconds,
        } => {
            let kind: TriggerKind = kind.parse().context("invalid trigger kind")?;
            let dependency_predicate = dependency_predicate
                .map(|p| p.parse::<DependencyPredicate>())
                .transpose()
                .context("invalid dependency predicate")?;
            let dependency_trigger_ids = dependency_trigger_ids
                .map(|ids| ids.iter().map(|s| parse_id(s)).collect::<Result<Vec<_>>>())
                .transpose()?;

            let now = orbit_core::clock::Clock::now(&SystemClock);
            let next_fire_at = match kind {
                TriggerKind::TimeBased | TriggerKind::Interval => Some(now),
                _ => None,
            };

            let new = NewTrigger {
                name,
                organization_id,
                created_by,
                kind,
                status: TriggerStatus::Active,
                cron_expression,
                timezone,
                interval_seconds,
                event_types,
                dependency_trigger_ids,
                dependency_predicate,
                condition_expression,
                window_start,
                window_end,
                task_type,
                task_config: parse_json(task_config.as_deref())?,
                task_parameters: parse_json(task_parameters.as_deref())?,
                priority,
                max_concurrent_runs,
                max_exec_seconds,
                max_retries,
                base_delay_seconds,
                backoff_multiplier,
                max_delay_seconds,
                next_fire_at,
            };

            let trigger = trigger_store::create(pool, &new).await?;
            println!("Created trigger {} ({})", trigger.id, trigger.name);
        }

        TriggerCommands::Show { trigger_id } => {
            let id = parse_id(&trigger_id)?;
            let trigger = trigger_store::get(pool, id).await?;
            println!("{}", serde_json::to_string_pretty(&trigger)?);
        }

        TriggerCommands::List {
            organization_id,
            status,
            page,
            page_size,
        } => {
            let status = status.map(|s| s.parse::<TriggerStatus>()).transpose().context("invalid status")?;
            let triggers = trigger_store::list(pool, &organization_id, status, page, page_size).await?;
            if triggers.is_empty() {
                println!("No triggers found.");
                return Ok(());
            }
            println!("{:<38} {:<24} {:<12} {:<10} {:>12}", "ID", "NAME", "KIND", "STATUS", "NEXT FIRE");
            println!("{}", "-".repeat(100));
            for t in &triggers {
                let next_fire = t
                    .next_fire_at
                    .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<38} {:<24} {:<12} {:<10} {:>12}",
                    t.id, t.name, t.kind, t.status, next_fire
                );
            }
        }

        TriggerCommands::Pause { trigger_id } => transition(pool, &trigger_id, TriggerStatus::Active, TriggerStatus::Paused).await?,
        TriggerCommands::Resume { trigger_id } => transition(pool, &trigger_id, TriggerStatus::Paused, TriggerStatus::Active).await?,
        TriggerCommands::Disable { trigger_id } => {
            let id = parse_id(&trigger_id)?;
            let current = trigger_store::get(pool, id).await?;
            transition(pool, &trigger_id, current.status, TriggerStatus::Disabled).await?;
        }

        TriggerCommands::Archive { trigger_id } => {
            let id = parse_id(&trigger_id)?;
            trigger_store::soft_delete(pool, id).await?;
            println!("Trigger {trigger_id} archived.");
        }

        TriggerCommands::Fire { trigger_id } => {
            let id = parse_id(&trigger_id)?;
            let run = orchestrator::manual_fire(pool, &SystemClock, id).await?;
            println!("Queued run {} for trigger {trigger_id} (status {})", run.id, run.status);
        }

        TriggerCommands::History { trigger_id, page, page_size } => {
            let id = parse_id(&trigger_id)?;
            let runs = orbit_core::run_store::list_by_trigger(pool, id, page, page_size).await?;
            if runs.is_empty() {
                println!("No runs found.");
                return Ok(());
            }
            println!("{:<38} {:<10} {:>8} {:<20} {:<20}", "RUN ID", "STATUS", "ATTEMPT", "SCHEDULED FOR", "ENDED AT");
            println!("{}", "-".repeat(100));
            for r in &runs {
                let ended = r.ended_at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()).unwrap_or_else(|| "-".into());
                println!(
                    "{:<38} {:<10} {:>8} {:<20} {:<20}",
                    r.id,
                    r.status,
                    r.attempt,
                    r.scheduled_for.format("%Y-%m-%d %H:%M:%S"),
                    ended
                );
            }
        }
    }

    Ok(())
}

async fn transition(pool: &PgPool, trigger_id: &str, expected: TriggerStatus, target: TriggerStatus) -> Result<()> {
    let id = parse_id(trigger_id)?;
    let trigger = trigger_store::transition_status(pool, id, expected, target).await?;
    println!("Trigger {trigger_id} is now {}", trigger.status);
    Ok(())
}
