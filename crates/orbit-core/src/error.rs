//! The core error taxonomy.
//!
//! Each variant names one of the kinds in the taxonomy; the structured
//! context fields let an HTTP layer or log line carry `trigger_id`/`run_id`/
//! `lease_id` without re-deriving them from a message string.

use uuid::Uuid;

/// A core-level failure, classified by kind.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation error: {message}")]
    Validation {
        message: String,
        trigger_id: Option<Uuid>,
        run_id: Option<Uuid>,
        lease_id: Option<Uuid>,
    },

    #[error("not found: {message}")]
    NotFound {
        message: String,
        trigger_id: Option<Uuid>,
        run_id: Option<Uuid>,
        lease_id: Option<Uuid>,
    },

    #[error("forbidden: {message}")]
    Forbidden {
        message: String,
        trigger_id: Option<Uuid>,
        run_id: Option<Uuid>,
        lease_id: Option<Uuid>,
    },

    #[error("conflict: {message}")]
    Conflict {
        message: String,
        trigger_id: Option<Uuid>,
        run_id: Option<Uuid>,
        lease_id: Option<Uuid>,
    },

    #[error("none available: {message}")]
    NoneAvailable {
        message: String,
        trigger_id: Option<Uuid>,
        run_id: Option<Uuid>,
        lease_id: Option<Uuid>,
    },

    #[error("unavailable: {message}")]
    Unavailable {
        message: String,
        trigger_id: Option<Uuid>,
        run_id: Option<Uuid>,
        lease_id: Option<Uuid>,
    },

    #[error("timeout: {message}")]
    Timeout {
        message: String,
        trigger_id: Option<Uuid>,
        run_id: Option<Uuid>,
        lease_id: Option<Uuid>,
    },

    #[error("handler error: {message}")]
    HandlerError {
        message: String,
        trigger_id: Option<Uuid>,
        run_id: Option<Uuid>,
        lease_id: Option<Uuid>,
    },

    #[error("internal error: {message}")]
    Internal {
        message: String,
        trigger_id: Option<Uuid>,
        run_id: Option<Uuid>,
        lease_id: Option<Uuid>,
    },
}

/// Empty context builder, used at call sites that have none of the three ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrCtx {
    pub trigger_id: Option<Uuid>,
    pub run_id: Option<Uuid>,
    pub lease_id: Option<Uuid>,
}

impl ErrCtx {
    pub fn trigger(id: Uuid) -> Self {
        Self {
            trigger_id: Some(id),
            ..Default::default()
        }
    }

    pub fn run(id: Uuid) -> Self {
        Self {
            run_id: Some(id),
            ..Default::default()
        }
    }

    pub fn lease(id: Uuid) -> Self {
        Self {
            lease_id: Some(id),
            ..Default::default()
        }
    }
}

impl CoreError {
    pub fn validation(message: impl Into<String>, ctx: ErrCtx) -> Self {
        Self::Validation {
            message: message.into(),
            trigger_id: ctx.trigger_id,
            run_id: ctx.run_id,
            lease_id: ctx.lease_id,
        }
    }

    pub fn not_found(message: impl Into<String>, ctx: ErrCtx) -> Self {
        Self::NotFound {
            message: message.into(),
            trigger_id: ctx.trigger_id,
            run_id: ctx.run_id,
            lease_id: ctx.lease_id,
        }
    }

    pub fn conflict(message: impl Into<String>, ctx: ErrCtx) -> Self {
        Self::Conflict {
            message: message.into(),
            trigger_id: ctx.trigger_id,
            run_id: ctx.run_id,
            lease_id: ctx.lease_id,
        }
    }

    pub fn none_available(message: impl Into<String>, ctx: ErrCtx) -> Self {
        Self::NoneAvailable {
            message: message.into(),
            trigger_id: ctx.trigger_id,
            run_id: ctx.run_id,
            lease_id: ctx.lease_id,
        }
    }

    pub fn unavailable(message: impl Into<String>, ctx: ErrCtx) -> Self {
        Self::Unavailable {
            message: message.into(),
            trigger_id: ctx.trigger_id,
            run_id: ctx.run_id,
            lease_id: ctx.lease_id,
        }
    }

    pub fn timeout(message: impl Into<String>, ctx: ErrCtx) -> Self {
        Self::Timeout {
            message: message.into(),
            trigger_id: ctx.trigger_id,
            run_id: ctx.run_id,
            lease_id: ctx.lease_id,
        }
    }

    pub fn handler_error(message: impl Into<String>, ctx: ErrCtx) -> Self {
        Self::HandlerError {
            message: message.into(),
            trigger_id: ctx.trigger_id,
            run_id: ctx.run_id,
            lease_id: ctx.lease_id,
        }
    }

    pub fn internal(message: impl Into<String>, ctx: ErrCtx) -> Self {
        Self::Internal {
            message: message.into(),
            trigger_id: ctx.trigger_id,
            run_id: ctx.run_id,
            lease_id: ctx.lease_id,
        }
    }

    /// The taxonomy kind name, matching §7's `VALIDATION`/`NOT_FOUND`/etc.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::Conflict { .. } => "CONFLICT",
            Self::NoneAvailable { .. } => "NONE_AVAILABLE",
            Self::Unavailable { .. } => "UNAVAILABLE",
            Self::Timeout { .. } => "TIMEOUT",
            Self::HandlerError { .. } => "HANDLER_ERROR",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// Whether a retry loop should reattempt after this error.
    ///
    /// `TIMEOUT` and `HANDLER_ERROR` are retryable by default; `INTERNAL`
    /// never is; the rest are decided locally by their caller (e.g.
    /// `NONE_AVAILABLE` just means "try the next trigger").
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::HandlerError { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_match_taxonomy() {
        let ctx = ErrCtx::default();
        assert_eq!(CoreError::validation("x", ctx).kind_name(), "VALIDATION");
        assert_eq!(CoreError::not_found("x", ctx).kind_name(), "NOT_FOUND");
        assert_eq!(CoreError::conflict("x", ctx).kind_name(), "CONFLICT");
        assert_eq!(
            CoreError::none_available("x", ctx).kind_name(),
            "NONE_AVAILABLE"
        );
        assert_eq!(CoreError::unavailable("x", ctx).kind_name(), "UNAVAILABLE");
        assert_eq!(CoreError::timeout("x", ctx).kind_name(), "TIMEOUT");
        assert_eq!(
            CoreError::handler_error("x", ctx).kind_name(),
            "HANDLER_ERROR"
        );
        assert_eq!(CoreError::internal("x", ctx).kind_name(), "INTERNAL");
    }

    #[test]
    fn retryable_kinds() {
        let ctx = ErrCtx::default();
        assert!(CoreError::timeout("x", ctx).is_retryable());
        assert!(CoreError::handler_error("x", ctx).is_retryable());
        assert!(!CoreError::internal("x", ctx).is_retryable());
        assert!(!CoreError::validation("x", ctx).is_retryable());
    }

    #[test]
    fn context_carries_ids() {
        let trigger_id = Uuid::new_v4();
        let err = CoreError::conflict("stale version", ErrCtx::trigger(trigger_id));
        match err {
            CoreError::Conflict { trigger_id: t, .. } => assert_eq!(t, Some(trigger_id)),
            _ => panic!("wrong variant"),
        }
    }
}
