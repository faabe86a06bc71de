//! Built-in `http_call` handler.
//!
//! The core does not require any specific HTTP client implementation --
//! only that a handler return within `max_exec_seconds` or cooperate with
//! cancellation. This default validates the request shape described by
//! `task_config` and reports dispatch without depending on a concrete
//! transport crate, leaving real network plumbing to deployments that
//! register their own handler.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use orbit_db::models::ErrorKind;

use super::{Handler, HandlerFailure, HandlerOutcome, RunView, TriggerView};

pub const TASK_TYPE: &str = "http_call";

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpCallHandler;

impl HttpCallHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Handler for HttpCallHandler {
    fn name(&self) -> &str {
        TASK_TYPE
    }

    async fn execute(&self, trigger: &TriggerView, _run: &RunView, cancel: CancellationToken) -> HandlerOutcome {
        let Some(url) = trigger.task_config.get("url").and_then(|v| v.as_str()) else {
            return HandlerOutcome::Err(HandlerFailure {
                kind: ErrorKind::Validation,
                message: "task_config.url is required for http_call".into(),
                details: None,
            });
        };
        let method = trigger
            .task_config
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET");

        if cancel.is_cancelled() {
            return HandlerOutcome::Err(HandlerFailure {
                kind: ErrorKind::Timeout,
                message: "cancelled before dispatch".into(),
                details: None,
            });
        }

        HandlerOutcome::Ok(serde_json::json!({
            "url": url,
            "method": method,
            "status": "dispatched",
        }))
    }
}
