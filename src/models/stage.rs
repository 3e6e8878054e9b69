use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use super::execution::ExecutionType;
use super::status::ExecutionStatus;
use super::task::Task;

/// Context keys the engine interprets. Everything else in a stage
/// context is opaque and flows through untouched.
pub mod context_keys {
    /// `{type, expression}` gate evaluated before the stage starts
    pub const STAGE_ENABLED: &str = "stageEnabled";
    /// Whether a time-window synthetic is prepended to the stage
    pub const RESTRICT_EXECUTION_WINDOW: &str = "restrictExecutionDuringTimeWindow";
    /// Window whitelist consumed by the time-window synthetic stage
    pub const EXECUTION_WINDOW: &str = "restrictedExecutionWindow";
    /// Whether a TERMINAL task fails the whole execution (default true)
    pub const FAIL_PIPELINE: &str = "failPipeline";
    /// Whether a TERMINAL task downgrades to FAILED_CONTINUE (default false)
    pub const CONTINUE_PIPELINE: &str = "continuePipeline";
    /// One-shot flag a loop-end task sets to request another iteration
    pub const LOOP_CONTINUE: &str = "loopContinue";
    /// Error detail recorded when a stage fails outside task execution
    pub const ERROR: &str = "error";
}

/// Which side of its parent a synthetic stage runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyntheticStageOwner {
    StageBefore,
    StageAfter,
}

impl fmt::Display for SyntheticStageOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StageBefore => write!(f, "stage_before"),
            Self::StageAfter => write!(f, "stage_after"),
        }
    }
}

/// A node in the execution DAG.
///
/// Stages are owned by their execution; `(execution_type, execution_id,
/// id)` is the stable handle handlers pass through the queue. A
/// synthetic stage has both `parent_stage_id` and `synthetic_owner`
/// set; a non-synthetic stage has neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Stable identity within the execution
    pub id: String,
    /// Author-assigned reference id, unique among non-synthetic siblings
    pub ref_id: String,
    /// Execution type of the owning execution
    pub execution_type: ExecutionType,
    /// Id of the owning execution
    pub execution_id: String,
    /// Stage type tag resolved through the stage definition registry
    pub stage_type: String,
    /// Display name
    pub name: String,
    pub status: ExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Ordered task list, materialized by StartStage
    pub tasks: Vec<Task>,
    /// Parent stage id when this stage is synthetic
    pub parent_stage_id: Option<String>,
    /// Which side of the parent this synthetic runs on
    pub synthetic_owner: Option<SyntheticStageOwner>,
    /// Upstream edges by author reference id
    pub requisite_stage_ref_ids: Vec<String>,
    /// Author- and task-supplied context
    pub context: HashMap<String, Value>,
    /// Outputs visible to downstream stages
    pub outputs: HashMap<String, Value>,
    /// Pause marker; StartTask defers dispatch while set
    pub paused: bool,
}

impl Stage {
    pub fn new(
        execution_type: ExecutionType,
        execution_id: impl Into<String>,
        id: impl Into<String>,
        ref_id: impl Into<String>,
        stage_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            ref_id: ref_id.into(),
            execution_type,
            execution_id: execution_id.into(),
            stage_type: stage_type.into(),
            name: name.into(),
            status: ExecutionStatus::NotStarted,
            start_time: None,
            end_time: None,
            tasks: Vec::new(),
            parent_stage_id: None,
            synthetic_owner: None,
            requisite_stage_ref_ids: Vec::new(),
            context: HashMap::new(),
            outputs: HashMap::new(),
            paused: false,
        }
    }

    /// Deterministic id for a synthetic child: `{parentId}-{ordinal}-{authorId}`
    pub fn synthetic_id(parent_id: &str, ordinal: usize, author_ref_id: &str) -> String {
        format!("{parent_id}-{ordinal}-{author_ref_id}")
    }

    pub fn is_synthetic(&self) -> bool {
        self.parent_stage_id.is_some()
    }

    /// Task lookup by ordinal id
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    fn context_bool(&self, key: &str, default: bool) -> bool {
        match self.context.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "true",
            _ => default,
        }
    }

    /// Whether a TERMINAL task should fail the whole execution
    pub fn fail_pipeline(&self) -> bool {
        self.context_bool(context_keys::FAIL_PIPELINE, true)
    }

    /// Whether a TERMINAL task should let the pipeline continue
    pub fn continue_pipeline(&self) -> bool {
        self.context_bool(context_keys::CONTINUE_PIPELINE, false)
    }

    /// Whether this stage asks for an execution-window synthetic
    pub fn restrict_execution_window(&self) -> bool {
        self.context_bool(context_keys::RESTRICT_EXECUTION_WINDOW, false)
    }

    /// The raw `stageEnabled` directive, if any
    pub fn stage_enabled(&self) -> Option<&Value> {
        self.context.get(context_keys::STAGE_ENABLED)
    }

    /// Consume the one-shot loop continuation flag. The flag is removed
    /// so a stale value can never re-iterate a loop; the loop-end task
    /// must assert it on every pass.
    pub fn take_loop_continue(&mut self) -> bool {
        match self.context.remove(context_keys::LOOP_CONTINUE) {
            Some(Value::Bool(b)) => b,
            Some(Value::String(s)) => s == "true",
            _ => false,
        }
    }

    /// Record an engine-level failure detail in the stage context
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.context
            .insert(context_keys::ERROR.to_string(), Value::String(message.into()));
    }

    /// Reset the stage for a restart: pristine status, no tasks
    pub fn reset(&mut self) {
        self.status = ExecutionStatus::NotStarted;
        self.start_time = None;
        self.end_time = None;
        self.tasks.clear();
        self.paused = false;
    }
}
