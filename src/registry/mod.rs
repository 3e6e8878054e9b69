//! # Registries
//!
//! String-keyed capability registries: stage type tag to stage
//! definition, implementing-class name to task handler. Both are the
//! engine's only view of concrete stage and task behavior.

pub mod stage_definitions;
pub mod task_handlers;

pub use stage_definitions::{
    StageDefinition, StageDefinitionRegistry, SyntheticStageSpec, TaskGraphBuilder, TaskGraphError,
};
pub use task_handlers::{TaskHandler, TaskHandlerRegistry, TaskResult, DEFAULT_BACKOFF_PERIOD};
