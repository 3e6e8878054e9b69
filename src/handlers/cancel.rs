//! # Cancellation Handlers
//!
//! Cancellation is cooperative: CancelExecution raises the canceled
//! flag and fans a CancelStage out to every unfinished stage; running
//! tasks observe the flag on their next RunTask poll and exit CANCELED.
//! The execution settles through CompleteExecution(CANCELED) once no
//! stage is left running.

use std::sync::Arc;
use tracing::{debug, info};

use super::EngineContext;
use crate::error::Result;
use crate::events::EngineEvent;
use crate::messaging::Message;
use crate::models::{ExecutionStatus, ExecutionType};

pub struct CancelExecutionHandler {
    context: Arc<EngineContext>,
}

impl CancelExecutionHandler {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self { context }
    }

    pub async fn handle(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        application: &str,
        canceled_by: Option<&str>,
        reason: Option<&str>,
    ) -> Result<()> {
        let ctx = &self.context;
        let Some(mut execution) = ctx
            .load_execution(execution_type, execution_id, application)
            .await?
        else {
            return Ok(());
        };
        if execution.status.is_complete() {
            debug!(execution_id, "execution already complete, dropping cancel");
            return Ok(());
        }

        execution.canceled = true;
        execution.canceled_by = canceled_by.map(String::from);
        execution.cancellation_reason = reason.map(String::from);
        ctx.store.store(&execution).await?;
        info!(execution_id, canceled_by = canceled_by.unwrap_or("unknown"), "execution canceled");

        let unfinished: Vec<String> = execution
            .stages
            .iter()
            .filter(|s| !s.status.is_complete() && s.status != ExecutionStatus::NotStarted)
            .map(|s| s.id.clone())
            .collect();

        if unfinished.is_empty() {
            ctx.queue
                .push(Message::CompleteExecution {
                    execution_type,
                    execution_id: execution_id.to_string(),
                    application: application.to_string(),
                    status: ExecutionStatus::Canceled,
                })
                .await?;
            return Ok(());
        }

        for stage_id in unfinished {
            ctx.queue
                .push(Message::CancelStage {
                    execution_type,
                    execution_id: execution_id.to_string(),
                    application: application.to_string(),
                    stage_id,
                })
                .await?;
        }
        Ok(())
    }
}

pub struct CancelStageHandler {
    context: Arc<EngineContext>,
}

impl CancelStageHandler {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self { context }
    }

    pub async fn handle(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        application: &str,
        stage_id: &str,
    ) -> Result<()> {
        let ctx = &self.context;
        let Some(mut execution) = ctx
            .load_execution(execution_type, execution_id, application)
            .await?
        else {
            return Ok(());
        };
        if execution.status.is_complete() {
            return Ok(());
        }
        let Some(stage_index) = ctx.find_stage(&execution, stage_id, application).await? else {
            return Ok(());
        };

        let stage = &mut execution.stages[stage_index];
        if stage.status.is_active() || stage.status == ExecutionStatus::Paused {
            let completed_at = ctx.now();
            stage.status = ExecutionStatus::Canceled;
            stage.end_time = Some(completed_at);
            for task in stage.tasks.iter_mut().filter(|t| t.status.is_active()) {
                task.status = ExecutionStatus::Canceled;
                task.end_time = Some(completed_at);
            }
            let stage = stage.clone();
            ctx.store.store_stage(&stage).await?;
            info!(execution_id, stage_id, "stage canceled");
            ctx.publish(EngineEvent::StageComplete {
                execution_type,
                execution_id: execution_id.to_string(),
                stage_id: stage_id.to_string(),
                stage_type: stage.stage_type.clone(),
                status: ExecutionStatus::Canceled,
            });
        }

        if execution.canceled && !execution.has_running_stages() {
            ctx.queue
                .push(Message::CompleteExecution {
                    execution_type,
                    execution_id: execution_id.to_string(),
                    application: application.to_string(),
                    status: ExecutionStatus::Canceled,
                })
                .await?;
        }
        Ok(())
    }
}
