//! # Engine Message Types
//!
//! Tagged variants for every command and event that flows through the
//! queue. Messages are routing tokens: they carry handles into the
//! execution store, never state of their own. Every variant names the
//! execution type, execution id, and owning application; stage- and
//! task-scoped variants add those ids.

use serde::{Deserialize, Serialize};

use crate::models::{ExecutionStatus, ExecutionType};

/// Envelope placed on the queue to drive the engine forward
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    StartExecution {
        execution_type: ExecutionType,
        execution_id: String,
        application: String,
    },
    StartStage {
        execution_type: ExecutionType,
        execution_id: String,
        application: String,
        stage_id: String,
    },
    CompleteStage {
        execution_type: ExecutionType,
        execution_id: String,
        application: String,
        stage_id: String,
        status: ExecutionStatus,
    },
    StartTask {
        execution_type: ExecutionType,
        execution_id: String,
        application: String,
        stage_id: String,
        task_id: String,
    },
    RunTask {
        execution_type: ExecutionType,
        execution_id: String,
        application: String,
        stage_id: String,
        task_id: String,
    },
    CompleteTask {
        execution_type: ExecutionType,
        execution_id: String,
        application: String,
        stage_id: String,
        task_id: String,
        status: ExecutionStatus,
    },
    CompleteExecution {
        execution_type: ExecutionType,
        execution_id: String,
        application: String,
        status: ExecutionStatus,
    },
    PauseStage {
        execution_type: ExecutionType,
        execution_id: String,
        application: String,
        stage_id: String,
    },
    ResumeStage {
        execution_type: ExecutionType,
        execution_id: String,
        application: String,
        stage_id: String,
    },
    PauseExecution {
        execution_type: ExecutionType,
        execution_id: String,
        application: String,
    },
    ResumeExecution {
        execution_type: ExecutionType,
        execution_id: String,
        application: String,
    },
    CancelExecution {
        execution_type: ExecutionType,
        execution_id: String,
        application: String,
        canceled_by: Option<String>,
        reason: Option<String>,
    },
    CancelStage {
        execution_type: ExecutionType,
        execution_id: String,
        application: String,
        stage_id: String,
    },
    RestartStage {
        execution_type: ExecutionType,
        execution_id: String,
        application: String,
        stage_id: String,
    },
    InvalidExecutionId {
        execution_type: ExecutionType,
        execution_id: String,
        application: String,
    },
    InvalidStageId {
        execution_type: ExecutionType,
        execution_id: String,
        application: String,
        stage_id: String,
    },
    InvalidTaskType {
        execution_type: ExecutionType,
        execution_id: String,
        application: String,
        stage_id: String,
        implementing_class: String,
    },
}

impl Message {
    /// Message kind for logging and routing diagnostics
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::StartExecution { .. } => "start_execution",
            Self::StartStage { .. } => "start_stage",
            Self::CompleteStage { .. } => "complete_stage",
            Self::StartTask { .. } => "start_task",
            Self::RunTask { .. } => "run_task",
            Self::CompleteTask { .. } => "complete_task",
            Self::CompleteExecution { .. } => "complete_execution",
            Self::PauseStage { .. } => "pause_stage",
            Self::ResumeStage { .. } => "resume_stage",
            Self::PauseExecution { .. } => "pause_execution",
            Self::ResumeExecution { .. } => "resume_execution",
            Self::CancelExecution { .. } => "cancel_execution",
            Self::CancelStage { .. } => "cancel_stage",
            Self::RestartStage { .. } => "restart_stage",
            Self::InvalidExecutionId { .. } => "invalid_execution_id",
            Self::InvalidStageId { .. } => "invalid_stage_id",
            Self::InvalidTaskType { .. } => "invalid_task_type",
        }
    }

    fn header(&self) -> (ExecutionType, &str, &str) {
        match self {
            Self::StartExecution { execution_type, execution_id, application }
            | Self::StartStage { execution_type, execution_id, application, .. }
            | Self::CompleteStage { execution_type, execution_id, application, .. }
            | Self::StartTask { execution_type, execution_id, application, .. }
            | Self::RunTask { execution_type, execution_id, application, .. }
            | Self::CompleteTask { execution_type, execution_id, application, .. }
            | Self::CompleteExecution { execution_type, execution_id, application, .. }
            | Self::PauseStage { execution_type, execution_id, application, .. }
            | Self::ResumeStage { execution_type, execution_id, application, .. }
            | Self::PauseExecution { execution_type, execution_id, application }
            | Self::ResumeExecution { execution_type, execution_id, application }
            | Self::CancelExecution { execution_type, execution_id, application, .. }
            | Self::CancelStage { execution_type, execution_id, application, .. }
            | Self::RestartStage { execution_type, execution_id, application, .. }
            | Self::InvalidExecutionId { execution_type, execution_id, application }
            | Self::InvalidStageId { execution_type, execution_id, application, .. }
            | Self::InvalidTaskType { execution_type, execution_id, application, .. } => {
                (*execution_type, execution_id, application)
            }
        }
    }

    pub fn execution_type(&self) -> ExecutionType {
        self.header().0
    }

    pub fn execution_id(&self) -> &str {
        self.header().1
    }

    pub fn application(&self) -> &str {
        self.header().2
    }

    /// Stage id for stage- and task-scoped variants
    pub fn stage_id(&self) -> Option<&str> {
        match self {
            Self::StartStage { stage_id, .. }
            | Self::CompleteStage { stage_id, .. }
            | Self::StartTask { stage_id, .. }
            | Self::RunTask { stage_id, .. }
            | Self::CompleteTask { stage_id, .. }
            | Self::PauseStage { stage_id, .. }
            | Self::ResumeStage { stage_id, .. }
            | Self::CancelStage { stage_id, .. }
            | Self::RestartStage { stage_id, .. }
            | Self::InvalidStageId { stage_id, .. }
            | Self::InvalidTaskType { stage_id, .. } => Some(stage_id),
            _ => None,
        }
    }
}
