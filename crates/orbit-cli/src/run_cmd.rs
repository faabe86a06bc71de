//! `orbit run` subcommands: inspect and list run records.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use orbit_core::run_store;

use crate::RunCommands;

pub async fn run_run_command(command: RunCommands, pool: &PgPool) -> Result<()> {
    match command {
        RunCommands::Get { run_id } => {
            let id = Uuid::parse_str(&run_id).with_context(|| format!("invalid run ID: {run_id}"))?;
            let run = run_store::get(pool, id).await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }

        RunCommands::List { trigger_id, page, page_size } => {
            let trigger_id = Uuid::parse_str(&trigger_id).with_context(|| format!("invalid trigger ID: {trigger_id}"))?;
            let runs = run_store::list_by_trigger(pool, trigger_id, page, page_size).await?;
            if runs.is_empty() {
                println!("No runs found.");
                return Ok(());
            }
            println!("{:<38} {:<10} {:>8} {:<20} {:<10}", "RUN ID", "STATUS", "ATTEMPT", "SCHEDULED FOR", "WORKER");
            println!("{}", "-".repeat(100));
            for r in &runs {
                println!(
                    "{:<38} {:<10} {:>8} {:<20} {:<10}",
                    r.id,
                    r.status,
                    r.attempt,
                    r.scheduled_for.format("%Y-%m-%d %H:%M:%S"),
                    r.worker_id.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}
