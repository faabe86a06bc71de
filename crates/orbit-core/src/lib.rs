//! Core domain logic for the scheduled task orchestration engine: time
//! source, error taxonomy, lease coordination, trigger/run persistence
//! wrappers, the priority queue, trigger resolution, handler dispatch, the
//! orchestrator loop, and the telemetry subsystem.

pub mod clock;
pub mod error;
pub mod handler;
pub mod lease;
pub mod orchestrator;
pub mod priority_queue;
pub mod resolver;
pub mod run_store;
pub mod telemetry;
pub mod trigger_store;
