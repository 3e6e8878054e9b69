//! # Built-in Stage Types
//!
//! Stage definitions the engine itself depends on. Concrete catalog
//! stages (deploy, bake, webhook, ...) live in embedding applications;
//! only the synthetic types the engine injects are defined here.

pub mod execution_window;

pub use execution_window::{
    ExecutionWindowStage, TimeWindow, WaitForExecutionWindowTask, EXECUTION_WINDOW_STAGE_TYPE,
    WAIT_FOR_EXECUTION_WINDOW_TASK,
};
