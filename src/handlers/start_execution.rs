//! # StartExecution Handler
//!
//! Entry point of every run: marks the execution RUNNING and enqueues
//! StartStage for the initial stage set. Pipelines start every
//! requisite-free stage in parallel; orchestrations start their first
//! stage only.

use std::sync::Arc;
use tracing::{debug, info};

use super::EngineContext;
use crate::error::Result;
use crate::events::EngineEvent;
use crate::messaging::Message;
use crate::models::{ExecutionStatus, ExecutionType};

pub struct StartExecutionHandler {
    context: Arc<EngineContext>,
}

impl StartExecutionHandler {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self { context }
    }

    pub async fn handle(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        application: &str,
    ) -> Result<()> {
        let ctx = &self.context;
        let Some(mut execution) = ctx
            .load_execution(execution_type, execution_id, application)
            .await?
        else {
            return Ok(());
        };

        if execution.status.is_complete() || execution.canceled {
            debug!(execution_id, status = %execution.status, "execution already settled, dropping start");
            return Ok(());
        }

        if execution.status == ExecutionStatus::NotStarted {
            execution.status = ExecutionStatus::Running;
            execution.start_time = Some(ctx.now());
            ctx.store.store(&execution).await?;
            info!(execution_id, %execution_type, application, "execution started");
            ctx.publish(EngineEvent::ExecutionStarted {
                execution_type,
                execution_id: execution_id.to_string(),
                application: application.to_string(),
            });
        }

        let initial: Vec<String> = execution
            .initial_stages()
            .iter()
            .map(|s| s.id.clone())
            .collect();
        if initial.is_empty() {
            debug!(execution_id, "no stages to run, completing immediately");
            ctx.queue
                .push(Message::CompleteExecution {
                    execution_type,
                    execution_id: execution_id.to_string(),
                    application: application.to_string(),
                    status: ExecutionStatus::Succeeded,
                })
                .await?;
            return Ok(());
        }

        for stage_id in initial {
            ctx.queue
                .push(Message::StartStage {
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
