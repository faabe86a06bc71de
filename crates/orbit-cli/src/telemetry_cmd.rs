//! `orbit telemetry` subcommands: heartbeat ingestion, system metric
//! ingestion, and the uptime/health-check read paths -- the CLI-side
//! counterpart of the Telemetry HTTP surface, useful for scripting against
//! an agent fleet without standing up the server.

use anyhow::{Context, Result};
use sqlx::PgPool;

use orbit_core::clock::SystemClock;
use orbit_core::telemetry::heartbeat::{self, IngestResult};
use orbit_core::telemetry::metrics::{self, NewMetricSample};
use orbit_core::telemetry::uptime;
use orbit_db::models::MetricType;
use orbit_db::queries::heartbeats::NewHeartbeat;

use crate::TelemetryCommands;

pub async fn run_telemetry_command(command: TelemetryCommands, pool: &PgPool) -> Result<()> {
    match command {
        TelemetryCommands::Heartbeat {
            agent_id,
            environment,
            availability_zone,
            agent_version,
            sequence_number,
            cpu_usage_percent,
            memory_usage_percent,
            disk_usage_percent,
            network_latency_ms,
            packet_loss_percent,
            request_count,
            error_count,
            response_time_ms,
            interval_ms,
        } => {
            let now = orbit_core::clock::Clock::now(&SystemClock);
            let new = NewHeartbeat {
                agent_id,
                environment,
                availability_zone,
                agent_version,
                timestamp: now,
                sequence_number,
                health_status: orbit_db::models::HealthStatus::Healthy,
                cpu_usage_percent,
                memory_usage_percent,
                disk_usage_percent,
                network_latency_ms,
                packet_loss_percent,
                request_count,
                error_count,
                response_time_ms,
                interval_ms,
            };
            let result: IngestResult = heartbeat::ingest(pool, &SystemClock, new).await?;
            println!(
                "heartbeat {} ingested: health={} score={:.1} adaptive_timeout_ms={} alerts={} quality={:.2}",
                result.heartbeat_id,
                result.derived_health,
                result.health_score,
                result.adaptive_timeout_ms,
                result.alerts.len(),
                result.quality_score
            );
        }

        TelemetryCommands::Metrics {
            system_id,
            metric_name,
            metric_type,
            value,
            unit,
            service_name,
            environment,
        } => {
            let metric_type: MetricType = metric_type.parse().context("invalid metric type")?;
            let now = orbit_core::clock::Clock::now(&SystemClock);
            let sample = NewMetricSample {
                system_id,
                metric_name,
                metric_type,
                timestamp: now,
                value,
                unit,
                service_name,
                environment,
            };
            let result = metrics::ingest(pool, &SystemClock, sample).await?;
            println!(
                "metric {} ingested: quality={:.2} breached={} severity={:?} outlier={}",
                result.metric_id, result.data_quality_score, result.threshold_breached, result.alert_severity, result.is_outlier
            );
        }

        TelemetryCommands::Uptime {
            agent_id,
            hours,
            sla_target_percentage,
        } => {
            let now = orbit_core::clock::Clock::now(&SystemClock);
            let period_start = now - chrono::Duration::hours(hours);
            let report = uptime::analyze(pool, &agent_id, period_start, now, sla_target_percentage).await?;
            println!(
                "agent={} uptime={:.2}% sessions={} mttr={:?}s mtbf={:?}s sla_met={:?} breach_risk={:?}",
                report.agent_id,
                report.uptime_percentage,
                report.sessions.len(),
                report.mttr_seconds,
                report.mtbf_seconds,
                report.sla_met,
                report.breach_risk
            );
        }

        TelemetryCommands::HealthCheck { agent_id } => {
            let result = heartbeat::health_check(pool, &SystemClock, &agent_id).await?;
            println!(
                "agent={} status={} last_heartbeat_at={:?} seconds_since_last_heartbeat={:?} adaptive_timeout_ms={}",
                result.agent_id, result.status, result.last_heartbeat_at, result.seconds_since_last_heartbeat, result.adaptive_timeout_ms
            );
        }
    }
    Ok(())
}
