//! # CompleteTask Handler
//!
//! Settles one task and selects the next step: iterate the enclosing
//! loop, start the next task in ordinal order, or complete the stage.
//! TERMINAL results roll up through the stage's failPipeline and
//! continuePipeline flags.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::EngineContext;
use crate::error::Result;
use crate::events::EngineEvent;
use crate::messaging::Message;
use crate::models::{ExecutionStatus, ExecutionType, Stage};

pub struct CompleteTaskHandler {
    context: Arc<EngineContext>,
}

impl CompleteTaskHandler {
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
        status: ExecutionStatus,
    ) -> Result<()> {
        let ctx = &self.context;
        let Some(mut execution) = ctx
            .load_execution(execution_type, execution_id, application)
            .await?
        else {
            return Ok(());
        };
        if execution.status.is_complete() {
            debug!(execution_id, stage_id, task_id, "execution complete, dropping task completion");
            return Ok(());
        }
        let Some(stage_index) = ctx.find_stage(&execution, stage_id, application).await? else {
            return Ok(());
        };

        let mut stage = execution.stages[stage_index].clone();
        if stage.status.is_complete() {
            debug!(stage_id, task_id, "stage already complete");
            return Ok(());
        }
        let Some(task) = stage.task(task_id).cloned() else {
            warn!(stage_id, task_id, "task not found on stage");
            return Ok(());
        };
        if task.status.is_complete() {
            debug!(stage_id, task_id, "task already finalized, redelivery dropped");
            return Ok(());
        }

        // REDIRECT rewinds the enclosing loop without finalizing the task
        if status == ExecutionStatus::Redirect {
            return self
                .rewind_loop(&mut execution, stage_index, application)
                .await;
        }

        if let Some(task) = stage.task_mut(task_id) {
            task.status = status;
            task.end_time = Some(ctx.now());
        }

        let next_message = if status == ExecutionStatus::Succeeded {
            if task.loop_end && stage.take_loop_continue() {
                info!(stage_id, task_id, "loop continuation requested, rewinding");
                execution.stages[stage_index] = stage;
                return self
                    .rewind_loop(&mut execution, stage_index, application)
                    .await;
            }
            let next_task = task
                .ordinal()
                .and_then(|ordinal| stage.task((ordinal + 1).to_string().as_str()).cloned());
            match next_task {
                Some(next) => Message::StartTask {
                    execution_type,
                    execution_id: execution_id.to_string(),
                    application: application.to_string(),
                    stage_id: stage_id.to_string(),
                    task_id: next.id,
                },
                None => Message::CompleteStage {
                    execution_type,
                    execution_id: execution_id.to_string(),
                    application: application.to_string(),
                    stage_id: stage_id.to_string(),
                    status: ExecutionStatus::Succeeded,
                },
            }
        } else if status == ExecutionStatus::Terminal {
            // failPipeline / continuePipeline decide how hard the stage fails
            let stage_status = if stage.continue_pipeline() {
                ExecutionStatus::FailedContinue
            } else if stage.fail_pipeline() {
                ExecutionStatus::Terminal
            } else {
                ExecutionStatus::Stopped
            };
            Message::CompleteStage {
                execution_type,
                execution_id: execution_id.to_string(),
                application: application.to_string(),
                stage_id: stage_id.to_string(),
                status: stage_status,
            }
        } else if status == ExecutionStatus::Canceled {
            Message::CompleteStage {
                execution_type,
                execution_id: execution_id.to_string(),
                application: application.to_string(),
                stage_id: stage_id.to_string(),
                status: ExecutionStatus::Canceled,
            }
        } else {
            warn!(stage_id, task_id, %status, "unexpected task completion status");
            Message::CompleteStage {
                execution_type,
                execution_id: execution_id.to_string(),
                application: application.to_string(),
                stage_id: stage_id.to_string(),
                status: ExecutionStatus::Terminal,
            }
        };

        execution.stages[stage_index] = stage;
        ctx.store.store_stage(&execution.stages[stage_index]).await?;
        ctx.publish(EngineEvent::TaskComplete {
            execution_type,
            execution_id: execution_id.to_string(),
            stage_id: stage_id.to_string(),
            task_id: task_id.to_string(),
            status,
        });
        ctx.queue.push(next_message).await?;
        Ok(())
    }

    /// Reset every task from the loop-start marker through the loop-end
    /// marker and re-dispatch from the start. The continuation flag was
    /// already consumed, so a loop iterates only when its loop-end task
    /// re-asserts it.
    async fn rewind_loop(
        &self,
        execution: &mut crate::models::Execution,
        stage_index: usize,
        application: &str,
    ) -> Result<()> {
        let ctx = &self.context;
        let stage = &mut execution.stages[stage_index];
        let Some(loop_start_id) = rewind_tasks(stage) else {
            warn!(stage_id = %stage.id, "loop rewind requested without loop markers");
            ctx.store.store_stage(stage).await?;
            ctx.queue
                .push(Message::CompleteStage {
                    execution_type: stage.execution_type,
                    execution_id: stage.execution_id.clone(),
                    application: application.to_string(),
                    stage_id: stage.id.clone(),
                    status: ExecutionStatus::Terminal,
                })
                .await?;
            return Ok(());
        };
        ctx.store.store_stage(stage).await?;
        ctx.queue
            .push(Message::StartTask {
                execution_type: stage.execution_type,
                execution_id: stage.execution_id.clone(),
                application: application.to_string(),
                stage_id: stage.id.clone(),
                task_id: loop_start_id,
            })
            .await?;
        Ok(())
    }
}

/// Reset the loop subsequence to NOT_STARTED; returns the loop-start
/// task id, or None when the stage has no loop markers
fn rewind_tasks(stage: &mut Stage) -> Option<String> {
    let start = stage.tasks.iter().position(|t| t.loop_start)?;
    let end = stage.tasks.iter().position(|t| t.loop_end)?;
    for task in &mut stage.tasks[start..=end] {
        task.reset();
    }
    Some(stage.tasks[start].id.clone())
}
