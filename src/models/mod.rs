//! # Data Model
//!
//! Execution, stage, and task records plus the shared lifecycle status.
//! The execution store is the single authority for these; handlers
//! load, mutate, and write back. Messages only carry handles.

pub mod execution;
pub mod stage;
pub mod status;
pub mod task;

pub use execution::{Execution, ExecutionBuilder, ExecutionType};
pub use stage::{context_keys, Stage, SyntheticStageOwner};
pub use status::ExecutionStatus;
pub use task::Task;
