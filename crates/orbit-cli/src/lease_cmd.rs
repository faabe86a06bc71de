//! `orbit lease` subcommands: list live leases, force-release, extend, and
//! inspect health of a specific lease -- operational tooling for an
//! operator chasing down a stuck trigger.

use anyhow::{bail, Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use orbit_core::clock::SystemClock;
use orbit_core::lease::{self, ExtendOutcome};
use orbit_db::queries::leases;

use crate::LeaseCommands;

fn parse_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("invalid lease ID: {s}"))
}

pub async fn run_lease_command(command: LeaseCommands, pool: &PgPool) -> Result<()> {
    match command {
        LeaseCommands::List => {
            let live = leases::list_live(pool).await?;
            if live.is_empty() {
                println!("No live leases.");
                return Ok(());
            }
            println!("{:<38} {:<16} {:<38} {:<20} {:<20}", "LEASE ID", "RESOURCE TYPE", "RESOURCE ID", "WORKER", "EXPIRES AT");
            println!("{}", "-".repeat(130));
            for l in &live {
                println!(
                    "{:<38} {:<16} {:<38} {:<20} {:<20}",
                    l.lease_id,
                    l.resource_type,
                    l.resource_id,
                    l.worker_id,
                    l.expires_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }

        LeaseCommands::Release { lease_id } => {
            let id = parse_id(&lease_id)?;
            let existing = leases::get(pool, id).await?;
            let Some(existing) = existing else {
                bail!("lease {lease_id} not found");
            };
            let outcome = lease::release(pool, &SystemClock, id, &existing.worker_id).await?;
            println!("{outcome:?}");
        }

        LeaseCommands::Extend { lease_id, seconds } => {
            let id = parse_id(&lease_id)?;
            let existing = leases::get(pool, id).await?;
            let Some(existing) = existing else {
                bail!("lease {lease_id} not found");
            };
            let outcome = lease::extend(pool, &SystemClock, id, &existing.worker_id, chrono::Duration::seconds(seconds)).await?;
            match outcome {
                ExtendOutcome::Ok(l) => println!("Lease {lease_id} extended; new expiry {}", l.expires_at),
                other => println!("{other:?}"),
            }
        }

        LeaseCommands::Health { lease_id } => {
            let id = parse_id(&lease_id)?;
            let health = lease::health(pool, &SystemClock, id).await?;
            println!(
                "alive={} time_to_expiry={}s extensions_remaining={}",
                health.alive,
                health.time_to_expiry.num_seconds(),
                health.extensions_remaining
            );
        }
    }
    Ok(())
}
