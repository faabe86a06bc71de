//! Handler Registry (C9): pluggable task executors, looked up by
//! `task_type`.
//!
//! An `#[async_trait]` object-safe trait stored in a
//! `HashMap<String, Box<dyn Trait>>` keyed lookup, collapsed to the single
//! `execute` call a handler needs since it is one async operation rather
//! than a managed long-lived subprocess with its own event stream.

pub mod http_call;
pub mod llm_call;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use orbit_db::models::{ErrorKind, Trigger};

pub use registry::HandlerRegistry;

/// Read-only view of the trigger that produced a run, passed to a handler.
#[derive(Debug, Clone)]
pub struct TriggerView {
    pub trigger_id: Uuid,
    pub name: String,
    pub task_type: String,
    pub task_config: serde_json::Value,
    pub task_parameters: serde_json::Value,
}

impl From<&Trigger> for TriggerView {
    fn from(t: &Trigger) -> Self {
        Self {
            trigger_id: t.id,
            name: t.name.clone(),
            task_type: t.task_type.clone(),
            task_config: t.task_config.clone(),
            task_parameters: t.task_parameters.clone(),
        }
    }
}

/// Read-only view of the run a handler is executing.
#[derive(Debug, Clone, Copy)]
pub struct RunView {
    pub run_id: Uuid,
    pub attempt: i32,
    pub max_exec_seconds: i32,
}

/// Structured failure a handler reports instead of panicking or returning
/// a bare string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

/// The outcome of a handler's execution: `ok(map<string, any>)` or
/// `err(kind, message, details)`.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    Ok(serde_json::Value),
    Err(HandlerFailure),
}

/// A pluggable task executor. Implementors MUST be cancellation-aware:
/// once `cancel` fires, return promptly rather than continue running past
/// `run.max_exec_seconds`.
///
/// # Object Safety
///
/// Every method returns a concrete or boxed type, so the trait can be
/// stored as `Box<dyn Handler>` in [`HandlerRegistry`].
#[async_trait]
pub trait Handler: Send + Sync {
    /// The `task_type` this handler answers for (e.g. `"http_call"`).
    fn name(&self) -> &str;

    async fn execute(
        &self,
        trigger: &TriggerView,
        run: &RunView,
        cancel: CancellationToken,
    ) -> HandlerOutcome;
}

// Compile-time assertion: Handler must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Handler) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl Handler for NoopHandler {
        fn name(&self) -> &str {
            "noop"
        }

        async fn execute(&self, _trigger: &TriggerView, _run: &RunView, _cancel: CancellationToken) -> HandlerOutcome {
            HandlerOutcome::Ok(serde_json::json!({}))
        }
    }

    #[test]
    fn handler_is_object_safe() {
        let handler: Box<dyn Handler> = Box::new(NoopHandler);
        assert_eq!(handler.name(), "noop");
    }

    #[tokio::test]
    async fn noop_handler_succeeds() {
        let handler = NoopHandler;
        let trigger = TriggerView {
            trigger_id: Uuid::new_v4(),
            name: "t".into(),
            task_type: "noop".into(),
            task_config: serde_json::json!({}),
            task_parameters: serde_json::json!({}),
        };
        let run = RunView {
            run_id: Uuid::new_v4(),
            attempt: 0,
            max_exec_seconds: 30,
        };
        match handler.execute(&trigger, &run, CancellationToken::new()).await {
            HandlerOutcome::Ok(_) => {}
            HandlerOutcome::Err(_) => panic!("expected Ok"),
        }
    }
}
