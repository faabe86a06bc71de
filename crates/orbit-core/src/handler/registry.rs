//! Handler registry -- a named collection of available task executors.
//!
//! The orchestrator looks up a handler by a trigger's `task_type` at
//! dispatch time; an absent entry is reported as `NO_HANDLER` rather than
//! falling back to a default.

use std::collections::HashMap;

use super::Handler;

/// A collection of registered [`Handler`] implementations, keyed by name.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Stored under the name returned by
    /// [`Handler::name`]; replaces and returns any prior entry of the same
    /// name.
    pub fn register(&mut self, handler: impl Handler + 'static) -> Option<Box<dyn Handler>> {
        let name = handler.name().to_string();
        self.handlers.insert(name, Box::new(handler))
    }

    pub fn get(&self, task_type: &str) -> Option<&dyn Handler> {
        self.handlers.get(task_type).map(|b| b.as_ref())
    }

    /// The names of all registered handlers. Order is not guaranteed.
    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
