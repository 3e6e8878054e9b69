//! # Execution Store
//!
//! The persistence seam of the engine. Handlers load an execution,
//! mutate it, and write back; the store is expected to support
//! per-entity atomic writes. Two operations exist specifically for
//! idempotency under redelivery: `compare_and_set_stage_status` (the
//! start-race guard) and the first-transition flag returned by
//! `update_status` (duplicate terminal-event suppression).
//!
//! [`InMemoryExecutionStore`] is the reference implementation backing
//! the test suite; durable backends live outside this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

use crate::models::{Execution, ExecutionStatus, ExecutionType, Stage};

/// Errors surfaced by store backends
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Execution not found: {execution_id}")]
    ExecutionNotFound { execution_id: String },

    #[error("Stage not found: {stage_id} in execution {execution_id}")]
    StageNotFound {
        execution_id: String,
        stage_id: String,
    },

    #[error("Store unavailable: {message}")]
    Unavailable { message: String },
}

/// Durable home of executions, stages, and statuses
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Load an execution by type and id
    async fn retrieve(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
    ) -> Result<Execution, StoreError>;

    /// Write a whole execution, stages included
    async fn store(&self, execution: &Execution) -> Result<(), StoreError>;

    /// Write one stage of an already-stored execution
    async fn store_stage(&self, stage: &Stage) -> Result<(), StoreError>;

    /// Remove a stage. Tolerates the stage being already gone, so
    /// restart rewinds stay idempotent under redelivery.
    async fn remove_stage(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        stage_id: &str,
    ) -> Result<(), StoreError>;

    /// Update the execution status and end time. Returns true when this
    /// call performed the first transition into a terminal status, so
    /// callers can suppress duplicate terminal events.
    async fn update_status(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        status: ExecutionStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;

    /// Atomically transition a stage status, returning whether this
    /// caller won. Two workers racing the same join stage resolve here.
    async fn compare_and_set_stage_status(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        stage_id: &str,
        expected: ExecutionStatus,
        next: ExecutionStatus,
    ) -> Result<bool, StoreError>;
}

/// In-process store keyed by execution type and id
#[derive(Default)]
pub struct InMemoryExecutionStore {
    executions: RwLock<HashMap<(ExecutionType, String), Execution>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<(ExecutionType, String), Execution>> {
        self.executions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<(ExecutionType, String), Execution>> {
        self.executions.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn retrieve(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
    ) -> Result<Execution, StoreError> {
        self.read()
            .get(&(execution_type, execution_id.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            })
    }

    async fn store(&self, execution: &Execution) -> Result<(), StoreError> {
        self.write().insert(
            (execution.execution_type, execution.id.clone()),
            execution.clone(),
        );
        Ok(())
    }

    async fn store_stage(&self, stage: &Stage) -> Result<(), StoreError> {
        let mut executions = self.write();
        let execution = executions
            .get_mut(&(stage.execution_type, stage.execution_id.clone()))
            .ok_or_else(|| StoreError::ExecutionNotFound {
                execution_id: stage.execution_id.clone(),
            })?;
        let slot = execution.stage_mut(&stage.id).ok_or_else(|| StoreError::StageNotFound {
            execution_id: stage.execution_id.clone(),
            stage_id: stage.id.clone(),
        })?;
        *slot = stage.clone();
        Ok(())
    }

    async fn remove_stage(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        stage_id: &str,
    ) -> Result<(), StoreError> {
        let mut executions = self.write();
        let execution = executions
            .get_mut(&(execution_type, execution_id.to_string()))
            .ok_or_else(|| StoreError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            })?;
        execution.stages.retain(|s| s.id != stage_id);
        Ok(())
    }

    async fn update_status(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        status: ExecutionStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let mut executions = self.write();
        let execution = executions
            .get_mut(&(execution_type, execution_id.to_string()))
            .ok_or_else(|| StoreError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            })?;
        let first_completion = !execution.status.is_complete() && status.is_complete();
        execution.status = status;
        execution.end_time = completed_at;
        Ok(first_completion)
    }

    async fn compare_and_set_stage_status(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        stage_id: &str,
        expected: ExecutionStatus,
        next: ExecutionStatus,
    ) -> Result<bool, StoreError> {
        let mut executions = self.write();
        let execution = executions
            .get_mut(&(execution_type, execution_id.to_string()))
            .ok_or_else(|| StoreError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            })?;
        let stage = execution.stage_mut(stage_id).ok_or_else(|| StoreError::StageNotFound {
            execution_id: execution_id.to_string(),
            stage_id: stage_id.to_string(),
        })?;
        if stage.status == expected {
            stage.status = next;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
