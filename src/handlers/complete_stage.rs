//! # CompleteStage Handler
//!
//! Finalizes a stage and propagates completion through the DAG:
//! after-children are drained before a successful stage settles,
//! synthetic completions trigger or fail their parent, and top-level
//! completions start downstream stages or roll the execution up.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::EngineContext;
use crate::error::Result;
use crate::events::EngineEvent;
use crate::messaging::Message;
use crate::models::{Execution, ExecutionStatus, ExecutionType, Stage, SyntheticStageOwner};

pub struct CompleteStageHandler {
    context: Arc<EngineContext>,
}

impl CompleteStageHandler {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self { context }
    }

    pub async fn handle(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        application: &str,
        stage_id: &str,
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
            debug!(execution_id, stage_id, "execution already complete");
            return Ok(());
        }
        let Some(stage_index) = ctx.find_stage(&execution, stage_id, application).await? else {
            return Ok(());
        };

        let mut stage = execution.stages[stage_index].clone();
        if stage.status.is_complete() && stage.end_time.is_some() {
            debug!(stage_id, status = %stage.status, "stage already finalized");
            return Ok(());
        }

        let mut final_status = status;
        // a successful stage settles only after its after-children drain
        if status == ExecutionStatus::Succeeded {
            let afters = execution.synthetic_children(&stage.id, SyntheticStageOwner::StageAfter);
            if !afters.is_empty() {
                if !afters.iter().all(|s| s.status.is_complete()) {
                    debug!(stage_id, "after-stages pending, deferring completion");
                    ctx.enqueue_ready_children(
                        &execution,
                        &stage,
                        SyntheticStageOwner::StageAfter,
                        application,
                    )
                    .await?;
                    return Ok(());
                }
                if let Some(failed) = afters.iter().find(|s| !s.status.is_successful()) {
                    final_status = failed.status;
                }
            }
        }

        stage.status = final_status;
        stage.end_time = Some(ctx.now());
        execution.stages[stage_index] = stage.clone();
        ctx.store.store_stage(&stage).await?;
        info!(execution_id, stage_id, status = %final_status, "stage complete");
        ctx.publish(EngineEvent::StageComplete {
            execution_type,
            execution_id: execution_id.to_string(),
            stage_id: stage_id.to_string(),
            stage_type: stage.stage_type.clone(),
            status: final_status,
        });

        if stage.is_synthetic() {
            self.propagate_to_parent(&execution, &stage, application, final_status)
                .await
        } else {
            self.propagate_downstream(&execution, &stage, application, final_status)
                .await
        }
    }

    /// Completion of a synthetic child either advances or fails its parent
    async fn propagate_to_parent(
        &self,
        execution: &Execution,
        stage: &Stage,
        application: &str,
        final_status: ExecutionStatus,
    ) -> Result<()> {
        let ctx = &self.context;
        let (Some(parent_id), Some(owner)) = (stage.parent_stage_id.clone(), stage.synthetic_owner)
        else {
            return Ok(());
        };
        let Some(parent) = execution.stage(&parent_id).cloned() else {
            warn!(stage_id = %stage.id, parent_id = %parent_id, "synthetic stage has no parent record");
            return Ok(());
        };

        if !final_status.is_successful() {
            // the parent inherits the child's failure; execution-level
            // rollup happens on the parent's own completion
            ctx.queue
                .push(Message::CompleteStage {
                    execution_type: execution.execution_type,
                    execution_id: execution.id.clone(),
                    application: application.to_string(),
                    stage_id: parent_id,
                    status: final_status,
                })
                .await?;
            return Ok(());
        }

        match owner {
            SyntheticStageOwner::StageBefore => {
                let all_complete = ctx
                    .enqueue_ready_children(execution, &parent, SyntheticStageOwner::StageBefore, application)
                    .await?;
                if all_complete && parent.status == ExecutionStatus::NotStarted {
                    ctx.queue
                        .push(Message::StartStage {
                            execution_type: execution.execution_type,
                            execution_id: execution.id.clone(),
                            application: application.to_string(),
                            stage_id: parent_id,
                        })
                        .await?;
                }
            }
            SyntheticStageOwner::StageAfter => {
                let all_complete = ctx
                    .enqueue_ready_children(execution, &parent, SyntheticStageOwner::StageAfter, application)
                    .await?;
                if all_complete {
                    ctx.queue
                        .push(Message::CompleteStage {
                            execution_type: execution.execution_type,
                            execution_id: execution.id.clone(),
                            application: application.to_string(),
                            stage_id: parent_id,
                            status: ExecutionStatus::Succeeded,
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Completion of a top-level stage starts downstream stages or
    /// rolls the execution up
    async fn propagate_downstream(
        &self,
        execution: &Execution,
        stage: &Stage,
        application: &str,
        final_status: ExecutionStatus,
    ) -> Result<()> {
        let ctx = &self.context;

        if final_status == ExecutionStatus::Terminal && stage.fail_pipeline() {
            ctx.queue
                .push(Message::CompleteExecution {
                    execution_type: execution.execution_type,
                    execution_id: execution.id.clone(),
                    application: application.to_string(),
                    status: ExecutionStatus::Terminal,
                })
                .await?;
            return Ok(());
        }

        if final_status == ExecutionStatus::Canceled {
            if !execution.has_running_stages() {
                ctx.queue
                    .push(Message::CompleteExecution {
                        execution_type: execution.execution_type,
                        execution_id: execution.id.clone(),
                        application: application.to_string(),
                        status: ExecutionStatus::Canceled,
                    })
                    .await?;
            }
            return Ok(());
        }

        // a stopped branch starts nothing downstream
        let downstream: Vec<String> = if final_status == ExecutionStatus::Stopped {
            Vec::new()
        } else {
            let mut ids: Vec<String> = execution
                .downstream_of(&stage.ref_id)
                .iter()
                .map(|s| s.id.clone())
                .collect();
            // orchestrations carry no explicit edges; fall through to
            // the next stage in author order
            if ids.is_empty() && execution.execution_type == ExecutionType::Orchestration {
                if let Some(next) = execution.next_top_level_after(&stage.id) {
                    ids.push(next.id.clone());
                }
            }
            ids
        };

        if downstream.is_empty() {
            if !execution.has_running_stages() {
                ctx.queue
                    .push(Message::CompleteExecution {
                        execution_type: execution.execution_type,
                        execution_id: execution.id.clone(),
                        application: application.to_string(),
                        status: ExecutionStatus::Succeeded,
                    })
                    .await?;
            }
            return Ok(());
        }

        for stage_id in downstream {
            ctx.queue
                .push(Message::StartStage {
                    execution_type: execution.execution_type,
                    execution_id: execution.id.clone(),
                    application: application.to_string(),
                    stage_id,
                })
                .await?;
        }
        Ok(())
    }
}
