//! # RestartStage Handler
//!
//! Surgically rewinds a terminal stage and everything transitively
//! downstream of it over requisite edges, then re-dispatches the target.
//! Stages outside that closure — siblings and their synthetics — are
//! never touched; downstream re-execution happens naturally through
//! completion propagation.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::EngineContext;
use crate::error::Result;
use crate::messaging::Message;
use crate::models::{ExecutionStatus, ExecutionType};

pub struct RestartStageHandler {
    context: Arc<EngineContext>,
}

impl RestartStageHandler {
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
        let Some(stage_index) = ctx.find_stage(&execution, stage_id, application).await? else {
            return Ok(());
        };

        let stage = &execution.stages[stage_index];
        if !stage.status.is_complete() {
            // restarting a stage that has not finished is a no-op
            debug!(stage_id, status = %stage.status, "stage not terminal, ignoring restart");
            return Ok(());
        }
        if stage.is_synthetic() {
            warn!(stage_id, "synthetic stages restart through their parent, ignoring");
            return Ok(());
        }

        let restart_set: HashSet<String> =
            execution.downstream_closure(&stage.ref_id).into_iter().collect();
        info!(execution_id, stage_id, restart_count = restart_set.len(), "restarting stage subgraph");

        for restart_id in &restart_set {
            // synthetic children are rebuilt by the next StartStage
            for synthetic_id in execution.synthetic_descendants(restart_id) {
                execution.stages.retain(|s| s.id != synthetic_id);
                ctx.store
                    .remove_stage(execution_type, execution_id, &synthetic_id)
                    .await?;
            }
            if let Some(stage) = execution.stage_mut(restart_id) {
                stage.reset();
                let stage = stage.clone();
                ctx.store.store_stage(&stage).await?;
            }
        }

        execution.status = ExecutionStatus::Running;
        execution.end_time = None;
        execution.canceled = false;
        execution.canceled_by = None;
        execution.cancellation_reason = None;
        ctx.store.store(&execution).await?;

        ctx.queue
            .push(Message::StartStage {
                execution_type,
                execution_id: execution_id.to_string(),
                application: application.to_string(),
                stage_id: stage_id.to_string(),
            })
            .await?;
        Ok(())
    }
}
