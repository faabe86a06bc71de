//! Configuration file management for `orbit`.
//!
//! Provides a TOML-based config file at `~/.config/orbit/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};

use orbit_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub database: Option<DatabaseSection>,
    #[serde(default)]
    pub worker: Option<WorkerSection>,
    #[serde(default)]
    pub server: Option<ServerSection>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerSection {
    pub worker_id: Option<String>,
    pub tick_interval_seconds: Option<u64>,
    pub max_concurrent_runs_per_worker: Option<usize>,
    pub lease_duration_seconds: Option<i64>,
    pub shutdown_grace_seconds: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerSection {
    pub bind: Option<String>,
    pub port: Option<u16>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the orbit config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/orbit` or `~/.config/orbit`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("orbit");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("orbit")
}

/// Return the path to the orbit config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct OrbitConfig {
    pub db_config: DbConfig,
    pub worker_id: String,
    pub tick_interval: StdDuration,
    pub max_concurrent_runs_per_worker: usize,
    pub lease_duration: Duration,
    pub shutdown_grace: StdDuration,
    pub bind: String,
    pub port: u16,
}

impl OrbitConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - DB URL: `cli_db_url` > `ORBIT_DATABASE_URL` env > `config_file.database.url` > `DbConfig::DEFAULT_URL`
    /// - Everything else follows the same chain against its own `ORBIT_*` env var and config section.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("ORBIT_DATABASE_URL") {
            url
        } else if let Some(url) = file_config.as_ref().and_then(|c| c.database.as_ref()).map(|d| d.url.clone()) {
            url
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::new(db_url);

        let worker_section = file_config.as_ref().and_then(|c| c.worker.as_ref());
        let server_section = file_config.as_ref().and_then(|c| c.server.as_ref());

        let worker_id = env_or("ORBIT_WORKER_ID")
            .or_else(|| worker_section.and_then(|w| w.worker_id.clone()))
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));

        let tick_interval_seconds = env_parsed("ORBIT_TICK_INTERVAL_SECONDS")
            .or_else(|| worker_section.and_then(|w| w.tick_interval_seconds))
            .unwrap_or(5);

        let max_concurrent_runs_per_worker = env_parsed("ORBIT_MAX_CONCURRENT_RUNS_PER_WORKER")
            .or_else(|| worker_section.and_then(|w| w.max_concurrent_runs_per_worker))
            .unwrap_or(10);

        let lease_duration_seconds = env_parsed("ORBIT_LEASE_DURATION_SECONDS")
            .or_else(|| worker_section.and_then(|w| w.lease_duration_seconds))
            .unwrap_or(300);

        let shutdown_grace_seconds = env_parsed("ORBIT_SHUTDOWN_GRACE_SECONDS")
            .or_else(|| worker_section.and_then(|w| w.shutdown_grace_seconds))
            .unwrap_or(10);

        let bind = env_or("ORBIT_BIND")
            .or_else(|| server_section.and_then(|s| s.bind.clone()))
            .unwrap_or_else(|| "127.0.0.1".to_string());

        let port = env_parsed("ORBIT_PORT")
            .or_else(|| server_section.and_then(|s| s.port))
            .unwrap_or(8080);

        Ok(Self {
            db_config,
            worker_id,
            tick_interval: StdDuration::from_secs(tick_interval_seconds),
            max_concurrent_runs_per_worker,
            lease_duration: Duration::seconds(lease_duration_seconds),
            shutdown_grace: StdDuration::from_secs(shutdown_grace_seconds),
            bind,
            port,
        })
    }
}

fn env_or(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
