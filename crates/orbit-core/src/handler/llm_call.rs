//! Built-in `llm_call` handler.
//!
//! Same scope as [`super::http_call`]: validates the `task_config` shape
//! (a `prompt`, with optional `model`) and reports dispatch without
//! depending on a concrete LLM client crate.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use orbit_db::models::ErrorKind;

use super::{Handler, HandlerFailure, HandlerOutcome, RunView, TriggerView};

pub const TASK_TYPE: &str = "llm_call";

#[derive(Debug, Clone, Copy, Default)]
pub struct LlmCallHandler;

impl LlmCallHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Handler for LlmCallHandler {
    fn name(&self) -> &str {
        TASK_TYPE
    }

    async fn execute(&self, trigger: &TriggerView, _run: &RunView, cancel: CancellationToken) -> HandlerOutcome {
        let Some(prompt) = trigger.task_config.get("prompt").and_then(|v| v.as_str()) else {
            return HandlerOutcome::Err(HandlerFailure {
                kind: ErrorKind::Validation,
                message: "task_config.prompt is required for llm_call".into(),
                details: None,
            });
        };
        let model = trigger
            .task_config
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("default");

        if cancel.is_cancelled() {
            return HandlerOutcome::Err(HandlerFailure {
                kind: ErrorKind::Timeout,
                message: "cancelled before dispatch".into(),
                details: None,
            });
        }

        HandlerOutcome::Ok(serde_json::json!({
            "model": model,
            "prompt_len": prompt.len(),
            "status": "dispatched",
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn view(config: serde_json::Value) -> TriggerView {
        TriggerView {
            trigger_id: Uuid::new_v4(),
            name: "t".into(),
            task_type: TASK_TYPE.into(),
            task_config: config,
            task_parameters: serde_json::json!({}),
        }
    }

    fn run_view() -> RunView {
        RunView {
            run_id: Uuid::new_v4(),
            attempt: 0,
            max_exec_seconds: 30,
        }
    }

    #[tokio::test]
    async fn missing_prompt_is_a_validation_error() {
        let handler = LlmCallHandler::new();
        let outcome = handler
            .execute(&view(serde_json::json!({})), &run_view(), CancellationToken::new())
            .await;
        match outcome {
            HandlerOutcome::Err(f) => assert_eq!(f.kind, ErrorKind::Validation),
            HandlerOutcome::Ok(_) => panic!("expected Err"),
        }
    }

    #[tokio::test]
    async fn valid_config_dispatches() {
        let handler = LlmCallHandler::new();
        let config = serde_json::json!({"prompt": "summarize the incident", "model": "claude"});
        let outcome = handler.execute(&view(config), &run_view(), CancellationToken::new()).await;
        match outcome {
            HandlerOutcome::Ok(v) => assert_eq!(v["model"], "claude"),
            HandlerOutcome::Err(_) => panic!("expected Ok"),
        }
    }

    #[tokio::test]
    async fn defaults_model_when_unset() {
        let handler = LlmCallHandler::new();
        let config = serde_json::json!({"prompt": "hi"});
        let outcome = handler.execute(&view(config), &run_view(), CancellationToken::new()).await;
        match outcome {
            HandlerOutcome::Ok(v) => assert_eq!(v["model"], "default"),
            HandlerOutcome::Err(_) => panic!("expected Ok"),
        }
    }
}
