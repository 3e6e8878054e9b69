//! # conductor-core
//!
//! Queue-driven execution engine for pipeline and orchestration
//! workflows. The engine is a distributed state machine: an external
//! trigger enqueues StartExecution, idempotent handlers pop messages,
//! advance executions through the store, and enqueue follow-up
//! messages. The queue is the only coordination substrate.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod expression;
pub mod handlers;
pub mod messaging;
pub mod models;
pub mod registry;
pub mod stages;
pub mod store;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{EngineBuilder, ExecutionEngine};
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventPublisher};
pub use messaging::{InMemoryQueue, Message, MessageQueue};
pub use models::{
    context_keys, Execution, ExecutionStatus, ExecutionType, Stage, SyntheticStageOwner, Task,
};
pub use registry::{
    StageDefinition, StageDefinitionRegistry, SyntheticStageSpec, TaskGraphBuilder, TaskHandler,
    TaskHandlerRegistry, TaskResult,
};
pub use store::{ExecutionStore, InMemoryExecutionStore, StoreError};
pub use worker::WorkerPool;
