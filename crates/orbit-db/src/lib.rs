//! Persistence layer for the scheduled task orchestration and telemetry
//! engine: row types, connection/migration bootstrap, and typed query
//! modules over PostgreSQL.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
