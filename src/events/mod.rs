//! # Lifecycle Events
//!
//! Typed lifecycle events published over a broadcast channel. The
//! publisher is an injected sink: production wiring can fan events out
//! to external systems, tests subscribe with a recording receiver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{ExecutionStatus, ExecutionType};

/// Lifecycle event emitted as executions, stages, and tasks transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    ExecutionStarted {
        execution_type: ExecutionType,
        execution_id: String,
        application: String,
    },
    ExecutionComplete {
        execution_type: ExecutionType,
        execution_id: String,
        application: String,
        status: ExecutionStatus,
    },
    StageStarted {
        execution_type: ExecutionType,
        execution_id: String,
        stage_id: String,
        stage_type: String,
    },
    StageComplete {
        execution_type: ExecutionType,
        execution_id: String,
        stage_id: String,
        stage_type: String,
        status: ExecutionStatus,
    },
    TaskStarted {
        execution_type: ExecutionType,
        execution_id: String,
        stage_id: String,
        task_id: String,
    },
    TaskComplete {
        execution_type: ExecutionType,
        execution_id: String,
        stage_id: String,
        task_id: String,
        status: ExecutionStatus,
    },
}

/// An event paired with its publication time
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub event: EngineEvent,
    pub published_at: DateTime<Utc>,
}

/// Broadcast publisher for lifecycle events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Publishing with no subscribers is not an
    /// error; events are best-effort observability, never control flow.
    pub fn publish(&self, event: EngineEvent, published_at: DateTime<Utc>) {
        let _ = self.sender.send(PublishedEvent {
            event,
            published_at,
        });
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}
