mod config;
mod lease_cmd;
mod run_cmd;
mod serve_cmd;
#[cfg(test)]
mod test_util;
mod telemetry_cmd;
mod trigger_cmd;

use clap::{Parser, Subcommand};

use config::OrbitConfig;
use orbit_db::pool;

#[derive(Parser)]
#[command(name = "orbit", about = "Scheduled task orchestration and telemetry engine")]
struct Cli {
    /// Database URL (overrides ORBIT_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write an orbit config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/orbit")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the orbit database (requires config file or env vars)
    DbInit,
    /// Start the HTTP surface and a worker's orchestrator loop
    Serve,
    /// Trigger management
    Trigger {
        #[command(subcommand)]
        command: TriggerCommands,
    },
    /// Run inspection
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Lease inspection and operator recovery
    Lease {
        #[command(subcommand)]
        command: LeaseCommands,
    },
    /// Telemetry ingestion and uptime reporting
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },
}

#[derive(Subcommand)]
pub enum TriggerCommands {
    /// Create a new trigger
    #[allow(clippy::too_many_arguments)]
    Create {
        name: String,
        #[arg(long)]
        organization_id: String,
        #[arg(long)]
        created_by: String,
        /// time_based, interval, event, dependency, manual, conditional, webhook
        #[arg(long)]
        kind: String,
        #[arg(long)]
        cron_expression: Option<String>,
        #[arg(long)]
        timezone: Option<String>,
        #[arg(long)]
        interval_seconds: Option<i64>,
        #[arg(long, value_delimiter = ',')]
        event_types: Option<Vec<String>>,
        #[arg(long, value_delimiter = ',')]
        dependency_trigger_ids: Option<Vec<String>>,
        #[arg(long)]
        dependency_predicate: Option<String>,
        #[arg(long)]
        condition_expression: Option<String>,
        #[arg(long)]
        window_start: Option<String>,
        #[arg(long)]
        window_end: Option<String>,
        #[arg(long)]
        task_type: String,
        /// JSON object
        #[arg(long)]
        task_config: Option<String>,
        /// JSON object
        #[arg(long)]
        task_parameters: Option<String>,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long, default_value_t = 1)]
        max_concurrent_runs: i32,
        #[arg(long, default_value_t = 300)]
        max_exec_seconds: i32,
        #[arg(long, default_value_t = 3)]
        max_retries: i32,
        #[arg(long, default_value_t = 30)]
        base_delay_seconds: i32,
        #[arg(long, default_value_t = 2.0)]
        backoff_multiplier: f64,
        #[arg(long)]
        max_delay_seconds: Option<i32>,
    },
    /// Show a trigger's full record
    Show { trigger_id: String },
    /// List triggers for an organization
    List {
        #[arg(long)]
        organization_id: String,
        /// active, paused, disabled, archived
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 20)]
        page_size: i64,
    },
    /// Pause an active trigger
    Pause { trigger_id: String },
    /// Resume a paused trigger
    Resume { trigger_id: String },
    /// Disable a trigger
    Disable { trigger_id: String },
    /// Archive (soft-delete) a trigger
    Archive { trigger_id: String },
    /// Manually fire a trigger outside of its schedule
    Fire { trigger_id: String },
    /// Show a trigger's run history
    History {
        trigger_id: String,
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 20)]
        page_size: i64,
    },
}

#[derive(Subcommand)]
pub enum RunCommands {
    /// Show a single run's full record
    Get { run_id: String },
    /// List runs for a trigger
    List {
        trigger_id: String,
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 20)]
        page_size: i64,
    },
}

#[derive(Subcommand)]
pub enum LeaseCommands {
    /// List all currently-live leases
    List,
    /// Force-release a lease (operator recovery; owner is read from the lease itself)
    Release { lease_id: String },
    /// Extend a lease's expiry
    Extend {
        lease_id: String,
        #[arg(long, default_value_t = 60)]
        seconds: i64,
    },
    /// Show a lease's liveness snapshot
    Health { lease_id: String },
}

#[derive(Subcommand)]
pub enum TelemetryCommands {
    /// Ingest a single heartbeat
    #[allow(clippy::too_many_arguments)]
    Heartbeat {
        #[arg(long)]
        agent_id: String,
        #[arg(long)]
        environment: String,
        #[arg(long)]
        availability_zone: String,
        #[arg(long)]
        agent_version: String,
        #[arg(long)]
        sequence_number: i64,
        #[arg(long)]
        cpu_usage_percent: f64,
        #[arg(long)]
        memory_usage_percent: f64,
        #[arg(long)]
        disk_usage_percent: f64,
        #[arg(long)]
        network_latency_ms: f64,
        #[arg(long, default_value_t = 0.0)]
        packet_loss_percent: f64,
        #[arg(long, default_value_t = 0)]
        request_count: i64,
        #[arg(long, default_value_t = 0)]
        error_count: i64,
        #[arg(long)]
        response_time_ms: Option<f64>,
        #[arg(long, default_value_t = 30_000)]
        interval_ms: i32,
    },
    /// Ingest a single system metric sample
    Metrics {
        #[arg(long)]
        system_id: String,
        #[arg(long)]
        metric_name: String,
        /// cpu_usage, memory_usage, disk_usage, disk_io, network_io, response_time, throughput, error_rate, uptime, custom
        #[arg(long)]
        metric_type: String,
        #[arg(long)]
        value: f64,
        #[arg(long)]
        unit: Option<String>,
        #[arg(long)]
        service_name: Option<String>,
        #[arg(long)]
        environment: Option<String>,
    },
    /// Compute an uptime report over the trailing N hours
    Uptime {
        agent_id: String,
        #[arg(long, default_value_t = 24)]
        hours: i64,
        #[arg(long)]
        sla_target_percentage: Option<f64>,
    },
    /// On-demand liveness check
    HealthCheck { agent_id: String },
}

/// Execute `orbit init`: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: Some(config::DatabaseSection { url: db_url.to_string() }),
        worker: None,
        server: None,
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `orbit db-init` to create and migrate the database.");

    Ok(())
}

/// Execute `orbit db-init`: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = OrbitConfig::resolve(cli_db_url)?;

    println!("Initializing orbit database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("orbit db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve => {
            let resolved = OrbitConfig::resolve(cli.database_url.as_deref())?;
            serve_cmd::run_serve(resolved).await?;
        }
        Commands::Trigger { command } => {
            let resolved = OrbitConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = trigger_cmd::run_trigger_command(command, &db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Run { command } => {
            let resolved = OrbitConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = run_cmd::run_run_command(command, &db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Lease { command } => {
            let resolved = OrbitConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = lease_cmd::run_lease_command(command, &db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Telemetry { command } => {
            let resolved = OrbitConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = telemetry_cmd::run_telemetry_command(command, &db_pool).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
