//! # RunTask Handler
//!
//! Executes one task and interprets its result. A RUNNING result
//! re-enqueues the RunTask with the handler's backoff — long waits are
//! always expressed as delayed messages, never as a sleeping worker.
//! Cancellation is observed here: every RunTask re-reads the execution
//! and exits CANCELED when the flag is set.

use std::sync::Arc;
use tracing::{debug, warn};

use super::EngineContext;
use crate::error::Result;
use crate::messaging::Message;
use crate::models::{ExecutionStatus, ExecutionType};
use crate::registry::TaskResult;

pub struct RunTaskHandler {
    context: Arc<EngineContext>,
}

impl RunTaskHandler {
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
        if execution.status.is_complete() {
            debug!(execution_id, stage_id, task_id, "execution complete, dropping run");
            return Ok(());
        }

        let complete_task = |status: ExecutionStatus| Message::CompleteTask {
            execution_type,
            execution_id: execution_id.to_string(),
            application: application.to_string(),
            stage_id: stage_id.to_string(),
            task_id: task_id.to_string(),
            status,
        };

        // cooperative cancellation: observed on every poll
        if execution.canceled {
            debug!(execution_id, stage_id, task_id, "execution canceled, exiting task");
            ctx.queue.push(complete_task(ExecutionStatus::Canceled)).await?;
            return Ok(());
        }

        let Some(stage_index) = ctx.find_stage(&execution, stage_id, application).await? else {
            return Ok(());
        };
        let stage = execution.stages[stage_index].clone();
        if stage.status.is_complete() {
            debug!(stage_id, task_id, "stage already complete, dropping run");
            return Ok(());
        }
        let Some(task) = stage.task(task_id).cloned() else {
            warn!(stage_id, task_id, "task not found on stage");
            return Ok(());
        };
        if task.status.is_complete() {
            debug!(stage_id, task_id, "task already complete, redelivery dropped");
            return Ok(());
        }

        let Some(handler) = ctx.task_handlers.resolve(&task.implementing_class) else {
            warn!(stage_id, task_id, implementing_class = %task.implementing_class, "unknown task type");
            ctx.queue
                .push(Message::InvalidTaskType {
                    execution_type,
                    execution_id: execution_id.to_string(),
                    application: application.to_string(),
                    stage_id: stage_id.to_string(),
                    implementing_class: task.implementing_class.clone(),
                })
                .await?;
            let mut stage = stage;
            stage.record_error(format!(
                "no task handler registered for '{}'",
                task.implementing_class
            ));
            execution.stages[stage_index] = stage;
            ctx.store.store_stage(&execution.stages[stage_index]).await?;
            ctx.queue.push(complete_task(ExecutionStatus::Terminal)).await?;
            return Ok(());
        };

        // a retryable task that has been running past its declared
        // budget converts to TERMINAL before another execution
        if let (Some(timeout), Some(started)) = (handler.timeout(), task.start_time) {
            let elapsed = ctx
                .now()
                .signed_duration_since(started)
                .to_std()
                .unwrap_or_default();
            if elapsed > timeout {
                warn!(stage_id, task_id, elapsed_ms = elapsed.as_millis() as u64, "task timed out");
                let mut stage = stage;
                stage.record_error(format!(
                    "task '{}' timed out after {}ms",
                    task.name,
                    timeout.as_millis()
                ));
                execution.stages[stage_index] = stage;
                ctx.store.store_stage(&execution.stages[stage_index]).await?;
                ctx.queue.push(complete_task(ExecutionStatus::Terminal)).await?;
                return Ok(());
            }
        }

        let result = match handler.execute(&stage).await {
            Ok(result) => result,
            Err(err) => TaskResult::terminal_with_error(err.to_string()),
        };

        match result.status {
            ExecutionStatus::Running => {
                // no status write; just poll again after the backoff
                ctx.queue
                    .push_delayed(
                        Message::RunTask {
                            execution_type,
                            execution_id: execution_id.to_string(),
                            application: application.to_string(),
                            stage_id: stage_id.to_string(),
                            task_id: task_id.to_string(),
                        },
                        handler.backoff_period(),
                    )
                    .await?;
                Ok(())
            }
            ExecutionStatus::Succeeded | ExecutionStatus::Terminal => {
                let mut stage = stage;
                stage.context.extend(result.outputs);
                stage.outputs.extend(result.stage_outputs);
                execution.stages[stage_index] = stage;
                ctx.store.store_stage(&execution.stages[stage_index]).await?;
                ctx.queue.push(complete_task(result.status)).await?;
                Ok(())
            }
            ExecutionStatus::Canceled => {
                ctx.queue.push(complete_task(ExecutionStatus::Canceled)).await?;
                Ok(())
            }
            ExecutionStatus::Redirect => {
                ctx.queue.push(complete_task(ExecutionStatus::Redirect)).await?;
                Ok(())
            }
            other => {
                warn!(stage_id, task_id, status = %other, "unexpected task result status");
                ctx.queue.push(complete_task(ExecutionStatus::Terminal)).await?;
                Ok(())
            }
        }
    }
}
