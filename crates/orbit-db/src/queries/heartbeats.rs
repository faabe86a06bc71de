//! Database query functions for the `heartbeats` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{Heartbeat, HealthStatus};

/// Parameters for inserting a new heartbeat sample.
#[derive(Debug, Clone)]
pub struct NewHeartbeat {
    pub agent_id: String,
    pub environment: String,
    pub availability_zone: String,
    pub agent_version: String,
    pub timestamp: DateTime<Utc>,
    pub sequence_number: i64,
    pub health_status: HealthStatus,
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub disk_usage_percent: f64,
    pub network_latency_ms: f64,
    pub packet_loss_percent: f64,
    pub request_count: i64,
    pub error_count: i64,
    pub response_time_ms: Option<f64>,
    pub interval_ms: i32,
}

/// The most recent sequence number seen for an agent, if any. Callers use
/// this to reject out-of-order or duplicate heartbeats before insert.
pub async fn last_sequence_number(pool: &PgPool, agent_id: &str) -> Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT sequence_number FROM heartbeats \
         WHERE agent_id = $1 \
         ORDER BY sequence_number DESC \
         LIMIT 1",
    )
    .bind(agent_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch last sequence number")?;

    Ok(row.map(|(seq,)| seq))
}

/// Insert a heartbeat sample.
pub async fn insert(pool: &PgPool, hb: &NewHeartbeat) -> Result<Heartbeat> {
    let row = sqlx::query_as::<_, Heartbeat>(
        "INSERT INTO heartbeats \
            (agent_id, environment, availability_zone, agent_version, \"timestamp\", \
             sequence_number, health_status, cpu_usage_percent, memory_usage_percent, \
             disk_usage_percent, network_latency_ms, packet_loss_percent, \
             request_count, error_count, response_time_ms, interval_ms) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
         RETURNING *",
    )
    .bind(&hb.agent_id)
    .bind(&hb.environment)
    .bind(&hb.availability_zone)
    .bind(&hb.agent_version)
    .bind(hb.timestamp)
    .bind(hb.sequence_number)
    .bind(hb.health_status)
    .bind(hb.cpu_usage_percent)
    .bind(hb.memory_usage_percent)
    .bind(hb.disk_usage_percent)
    .bind(hb.network_latency_ms)
    .bind(hb.packet_loss_percent)
    .bind(hb.request_count)
    .bind(hb.error_count)
    .bind(hb.response_time_ms)
    .bind(hb.interval_ms)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert heartbeat for agent {}", hb.agent_id))?;

    Ok(row)
}

/// Fetch the most recent heartbeat for an agent.
pub async fn latest_for_agent(pool: &PgPool, agent_id: &str) -> Result<Option<Heartbeat>> {
    let row = sqlx::query_as::<_, Heartbeat>(
        "SELECT * FROM heartbeats WHERE agent_id = $1 \
         ORDER BY \"timestamp\" DESC LIMIT 1",
    )
    .bind(agent_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest heartbeat")?;
    Ok(row)
}

/// Fetch all heartbeats for an agent in `[since, until]`, ordered oldest
/// first -- the input the Uptime Analyzer windows over to derive sessions.
pub async fn list_in_range(
    pool: &PgPool,
    agent_id: &str,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<Heartbeat>> {
    let rows = sqlx::query_as::<_, Heartbeat>(
        "SELECT * FROM heartbeats \
         WHERE agent_id = $1 AND \"timestamp\" BETWEEN $2 AND $3 \
         ORDER BY \"timestamp\" ASC",
    )
    .bind(agent_id)
    .bind(since)
    .bind(until)
    .fetch_all(pool)
    .await
    .context("failed to list heartbeats in range")?;
    Ok(rows)
}

/// Fetch the most recent `n` heartbeats for an agent, newest first -- the
/// sample window the adaptive timeout formula computes inter-arrival
/// intervals over.
pub async fn recent_n(pool: &PgPool, agent_id: &str, n: i64) -> Result<Vec<Heartbeat>> {
    let rows = sqlx::query_as::<_, Heartbeat>(
        "SELECT * FROM heartbeats \
         WHERE agent_id = $1 \
         ORDER BY \"timestamp\" DESC \
         LIMIT $2",
    )
    .bind(agent_id)
    .bind(n)
    .fetch_all(pool)
    .await
    .context("failed to fetch recent heartbeats")?;
    Ok(rows)
}

/// Distinct agent ids that have reported at least one heartbeat in
/// `[since, until]`, used to enumerate fleet-wide uptime reports.
pub async fn distinct_agents_in_range(
    pool: &PgPool,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT agent_id FROM heartbeats \
         WHERE \"timestamp\" BETWEEN $1 AND $2 \
         ORDER BY agent_id",
    )
    .bind(since)
    .bind(until)
    .fetch_all(pool)
    .await
    .context("failed to list distinct agents")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}
