//! # Task Handler Registry
//!
//! Tasks are resolved by implementing-class name, an opaque string the
//! engine never interprets. A handler is a black box: it receives the
//! stage and returns a [`TaskResult`]; retry cadence and timeouts come
//! from the handler's own declarations.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{ExecutionStatus, Stage};

/// Default delay between polls of a still-running task
pub const DEFAULT_BACKOFF_PERIOD: Duration = Duration::from_millis(1000);

/// Outcome of one task execution
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub status: ExecutionStatus,
    /// Merged into the stage context on success or failure
    pub outputs: HashMap<String, Value>,
    /// Merged into the stage outputs visible downstream
    pub stage_outputs: HashMap<String, Value>,
}

impl TaskResult {
    pub fn new(status: ExecutionStatus) -> Self {
        Self {
            status,
            outputs: HashMap::new(),
            stage_outputs: HashMap::new(),
        }
    }

    pub fn succeeded() -> Self {
        Self::new(ExecutionStatus::Succeeded)
    }

    /// Still working; the engine re-polls after the handler's backoff
    pub fn running() -> Self {
        Self::new(ExecutionStatus::Running)
    }

    pub fn terminal() -> Self {
        Self::new(ExecutionStatus::Terminal)
    }

    /// Terminal failure with a recorded error detail
    pub fn terminal_with_error(message: impl Into<String>) -> Self {
        Self::terminal().with_output("error", Value::String(message.into()))
    }

    pub fn canceled() -> Self {
        Self::new(ExecutionStatus::Canceled)
    }

    /// Rewind the enclosing loop and re-dispatch from its start marker
    pub fn redirect() -> Self {
        Self::new(ExecutionStatus::Redirect)
    }

    pub fn with_output(mut self, key: impl Into<String>, value: Value) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }

    pub fn with_stage_output(mut self, key: impl Into<String>, value: Value) -> Self {
        self.stage_outputs.insert(key.into(), value);
        self
    }
}

/// A unit of work the engine can dispatch
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute against the current stage snapshot. Errors are treated
    /// as TERMINAL results with the error recorded in the stage context.
    async fn execute(&self, stage: &Stage) -> Result<TaskResult>;

    /// Delay before the engine re-polls a RUNNING result
    fn backoff_period(&self) -> Duration {
        DEFAULT_BACKOFF_PERIOD
    }

    /// Wall-clock budget for the task; RUNNING beyond this converts to
    /// TERMINAL with a timeout error
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Thread-safe registry of task handlers keyed by implementing class
#[derive(Default)]
pub struct TaskHandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under an implementing-class name
    pub fn register(&self, implementing_class: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let implementing_class = implementing_class.into();
        debug!(implementing_class = %implementing_class, "registering task handler");
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.insert(implementing_class.clone(), handler).is_some() {
            warn!(implementing_class = %implementing_class, "replaced existing task handler");
        }
    }

    /// Resolve a handler by implementing-class name
    pub fn resolve(&self, implementing_class: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(implementing_class)
            .cloned()
    }
}
