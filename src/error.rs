//! # Engine Error Types
//!
//! Structured error handling for the execution engine using thiserror.
//! Store and queue faults keep their own error types and flow in via
//! `#[from]`; handlers propagate with `?` and the worker loop decides
//! between ack (permanent failure) and nack (transient, redeliver).

use thiserror::Error;

use crate::messaging::QueueError;
use crate::registry::TaskGraphError;
use crate::store::StoreError;

/// Errors surfaced by message handlers and the engine facade
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Unknown stage type: {stage_type}")]
    UnknownStageType { stage_type: String },

    #[error("Unknown task implementation: {implementing_class}")]
    UnknownTaskType { implementing_class: String },

    #[error(transparent)]
    TaskGraph(#[from] TaskGraphError),

    #[error("Expression evaluation failed: {message}")]
    Expression { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether redelivery is expected to succeed. Transient faults are
    /// nacked back to the queue; everything else is acked and surfaced
    /// through statuses and events.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Store(StoreError::Unavailable { .. })
                | EngineError::Queue(QueueError::Unavailable { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
