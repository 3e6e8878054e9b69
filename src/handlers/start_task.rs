//! # StartTask Handler
//!
//! Marks a task RUNNING and enqueues RunTask. Checks the pause marker
//! first: a paused stage re-enqueues the StartTask to itself with a
//! fixed delay rather than occupying a worker.

use std::sync::Arc;
use tracing::{debug, warn};

use super::EngineContext;
use crate::error::Result;
use crate::events::EngineEvent;
use crate::messaging::Message;
use crate::models::{ExecutionStatus, ExecutionType};

pub struct StartTaskHandler {
    context: Arc<EngineContext>,
}

impl StartTaskHandler {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self { context }
    }

    pub async fn handle(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        application: &str,
        stage_id: &str,
        task_id: &str,
    ) -> Result<()> {
        let ctx = &self.context;
        let Some(mut execution) = ctx
            .load_execution(execution_type, execution_id, application)
            .await?
        else {
            return Ok(());
        };
        if execution.canceled || execution.status.is_complete() {
            debug!(execution_id, stage_id, task_id, "execution settled, dropping task start");
            return Ok(());
        }
        let Some(stage_index) = ctx.find_stage(&execution, stage_id, application).await? else {
            return Ok(());
        };

        let paused = execution.stages[stage_index].paused
            || execution.status == ExecutionStatus::Paused;
        if paused {
            debug!(stage_id, task_id, "stage paused, rechecking after delay");
            ctx.queue
                .push_delayed(
                    Message::StartTask {
                        execution_type,
                        execution_id: execution_id.to_string(),
                        application: application.to_string(),
                        stage_id: stage_id.to_string(),
                        task_id: task_id.to_string(),
                    },
                    ctx.config.pause_recheck_delay(),
                )
                .await?;
            return Ok(());
        }

        let stage = &mut execution.stages[stage_index];
        if stage.status.is_complete() {
            debug!(stage_id, task_id, "stage already complete, dropping task start");
            return Ok(());
        }
        let Some(task) = stage.task_mut(task_id) else {
            warn!(stage_id, task_id, "task not found on stage");
            return Ok(());
        };
        if task.status.is_complete() {
            debug!(stage_id, task_id, "task already complete");
            return Ok(());
        }

        task.status = ExecutionStatus::Running;
        // keep the original start on redelivery so timeouts measure
        // from the first dispatch
        if task.start_time.is_none() {
            task.start_time = Some(ctx.now());
        }
        ctx.store.store_stage(&execution.stages[stage_index]).await?;

        ctx.queue
            .push(Message::RunTask {
                execution_type,
                execution_id: execution_id.to_string(),
                application: application.to_string(),
                stage_id: stage_id.to_string(),
                task_id: task_id.to_string(),
            })
            .await?;
        ctx.publish(EngineEvent::TaskStarted {
            execution_type,
            execution_id: execution_id.to_string(),
            stage_id: stage_id.to_string(),
            task_id: task_id.to_string(),
        });
        Ok(())
    }
}
