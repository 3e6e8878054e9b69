//! # Stage Definition Registry
//!
//! A stage type is a capability set: it appends tasks to a graph
//! builder and may describe synthetic children to run before, after, or
//! as parallel branches of the stage. Definitions are resolved by
//! string tag from a thread-safe registry; the engine never dispatches
//! on concrete types.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{ExecutionStatus, Stage, Task};

/// Task graph construction failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskGraphError {
    #[error("Stage type '{stage_type}' produced an empty task graph")]
    Empty { stage_type: String },

    #[error("Stage type '{stage_type}' has unbalanced loop markers")]
    UnbalancedLoopMarkers { stage_type: String },

    #[error("Stage type '{stage_type}' declares more than one loop")]
    MultipleLoops { stage_type: String },
}

/// Pending task entry inside a [`TaskGraphBuilder`]
#[derive(Debug, Clone)]
struct TaskNode {
    name: String,
    implementing_class: String,
    loop_start: bool,
    loop_end: bool,
}

/// Accumulates the ordered task list for one stage.
///
/// Ordinal ids, stage-start/stage-end flags, and loop marker validation
/// are applied when the graph is built; definitions only declare names,
/// implementing classes, and loop boundaries.
#[derive(Debug, Default)]
pub struct TaskGraphBuilder {
    nodes: Vec<TaskNode>,
}

impl TaskGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task
    pub fn append(&mut self, name: impl Into<String>, implementing_class: impl Into<String>) -> &mut Self {
        self.nodes.push(TaskNode {
            name: name.into(),
            implementing_class: implementing_class.into(),
            loop_start: false,
            loop_end: false,
        });
        self
    }

    /// Append a task that opens a re-iterable loop
    pub fn append_loop_start(
        &mut self,
        name: impl Into<String>,
        implementing_class: impl Into<String>,
    ) -> &mut Self {
        self.append(name, implementing_class);
        if let Some(node) = self.nodes.last_mut() {
            node.loop_start = true;
        }
        self
    }

    /// Append a task that closes a re-iterable loop
    pub fn append_loop_end(
        &mut self,
        name: impl Into<String>,
        implementing_class: impl Into<String>,
    ) -> &mut Self {
        self.append(name, implementing_class);
        if let Some(node) = self.nodes.last_mut() {
            node.loop_end = true;
        }
        self
    }

    /// Validate the graph and materialize the task list
    pub fn build(self, stage_type: &str) -> Result<Vec<Task>, TaskGraphError> {
        if self.nodes.is_empty() {
            return Err(TaskGraphError::Empty {
                stage_type: stage_type.to_string(),
            });
        }

        let starts: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.loop_start)
            .map(|(i, _)| i)
            .collect();
        let ends: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.loop_end)
            .map(|(i, _)| i)
            .collect();
        if starts.len() != ends.len() {
            return Err(TaskGraphError::UnbalancedLoopMarkers {
                stage_type: stage_type.to_string(),
            });
        }
        if starts.len() > 1 {
            return Err(TaskGraphError::MultipleLoops {
                stage_type: stage_type.to_string(),
            });
        }
        if let (Some(&start), Some(&end)) = (starts.first(), ends.first()) {
            if start > end {
                return Err(TaskGraphError::UnbalancedLoopMarkers {
                    stage_type: stage_type.to_string(),
                });
            }
        }

        let last = self.nodes.len() - 1;
        Ok(self
            .nodes
            .into_iter()
            .enumerate()
            .map(|(index, node)| {
                let mut task = Task::new((index + 1).to_string(), node.name, node.implementing_class);
                task.status = ExecutionStatus::NotStarted;
                task.stage_start = index == 0;
                task.stage_end = index == last;
                task.loop_start = node.loop_start;
                task.loop_end = node.loop_end;
                task
            })
            .collect())
    }
}

/// Descriptor for a synthetic child stage
#[derive(Debug, Clone)]
pub struct SyntheticStageSpec {
    /// Author id of the child; becomes the tail of the deterministic id
    pub ref_id: String,
    /// Stage type the child resolves to
    pub stage_type: String,
    /// Display name
    pub name: String,
    /// Context seeded onto the child
    pub context: HashMap<String, Value>,
}

impl SyntheticStageSpec {
    pub fn new(ref_id: impl Into<String>, stage_type: impl Into<String>) -> Self {
        let ref_id = ref_id.into();
        let stage_type = stage_type.into();
        Self {
            name: ref_id.clone(),
            ref_id,
            stage_type,
            context: HashMap::new(),
        }
    }

    pub fn with_context(mut self, context: HashMap<String, Value>) -> Self {
        self.context = context;
        self
    }
}

/// Capability set of a stage type
pub trait StageDefinition: Send + Sync {
    /// Type tag this definition registers under
    fn stage_type(&self) -> &str;

    /// Append the stage's tasks to the builder. For a parallel-branching
    /// stage this is the post-branch task list; pre-branch work is
    /// expressed as a leading before-stage.
    fn task_graph(&self, stage: &Stage, builder: &mut TaskGraphBuilder);

    /// Synthetic children that run, in order, before this stage's tasks
    fn before_stages(&self, stage: &Stage) -> Vec<SyntheticStageSpec> {
        let _ = stage;
        Vec::new()
    }

    /// Synthetic children that run, in order, after this stage's tasks
    fn after_stages(&self, stage: &Stage) -> Vec<SyntheticStageSpec> {
        let _ = stage;
        Vec::new()
    }

    /// Parallel branch children; all started at once, joined by the parent
    fn parallel_stages(&self, stage: &Stage) -> Vec<SyntheticStageSpec> {
        let _ = stage;
        Vec::new()
    }
}

/// Thread-safe registry of stage definitions keyed by type tag
#[derive(Default)]
pub struct StageDefinitionRegistry {
    definitions: RwLock<HashMap<String, Arc<dyn StageDefinition>>>,
}

impl StageDefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage definition under its own type tag
    pub fn register(&self, definition: Arc<dyn StageDefinition>) {
        let stage_type = definition.stage_type().to_string();
        debug!(stage_type = %stage_type, "registering stage definition");
        let mut definitions = self.definitions.write().unwrap_or_else(|e| e.into_inner());
        if definitions.insert(stage_type.clone(), definition).is_some() {
            warn!(stage_type = %stage_type, "replaced existing stage definition");
        }
    }

    /// Resolve a definition by stage type tag
    pub fn resolve(&self, stage_type: &str) -> Option<Arc<dyn StageDefinition>> {
        self.definitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(stage_type)
            .cloned()
    }

    /// All registered type tags, for diagnostics
    pub fn stage_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .definitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}
