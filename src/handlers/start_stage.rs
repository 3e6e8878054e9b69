//! # StartStage Handler
//!
//! The central algorithm of the engine: gates on requisites, evaluates
//! the stage context, expands synthetic children, materializes the task
//! list, and hands off to the task phase. The handler is re-entered
//! freely — join stages receive one StartStage per completing upstream,
//! and a stage with before-children receives another once they finish —
//! so every step is guarded to be idempotent, with the NOT_STARTED to
//! RUNNING edge protected by a store-level compare-and-set.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::EngineContext;
use crate::error::Result;
use crate::events::EngineEvent;
use crate::expression::{self, EvaluationContext};
use crate::messaging::Message;
use crate::models::{
    context_keys, Execution, ExecutionStatus, ExecutionType, Stage, SyntheticStageOwner,
};
use crate::registry::{SyntheticStageSpec, TaskGraphBuilder};
use crate::stages::EXECUTION_WINDOW_STAGE_TYPE;

pub struct StartStageHandler {
    context: Arc<EngineContext>,
}

impl StartStageHandler {
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
        if execution.canceled || execution.status.is_complete() {
            debug!(execution_id, stage_id, "execution settled, dropping stage start");
            return Ok(());
        }
        let Some(stage_index) = ctx.find_stage(&execution, stage_id, application).await? else {
            return Ok(());
        };

        let mut stage = execution.stages[stage_index].clone();
        if stage.status != ExecutionStatus::NotStarted {
            debug!(stage_id, status = %stage.status, "stage already started");
            return Ok(());
        }

        if !requisites_satisfied(&execution, &stage) {
            debug!(stage_id, "requisites incomplete, waiting for upstream");
            return Ok(());
        }

        // evaluated context: parameter substitution against the raw
        // stage context over the execution context
        let scope = EvaluationContext::for_stage(&stage, &execution.context);
        match expression::substitute_context(&stage.context, &scope) {
            Ok(evaluated) => stage.context = evaluated,
            Err(err) => {
                return self.fail_stage(&mut execution, stage_index, stage, application, err.to_string()).await;
            }
        }

        if let Some(directive) = stage.stage_enabled().cloned() {
            let scope = EvaluationContext::for_stage(&stage, &execution.context);
            match expression::stage_enabled(&directive, &scope) {
                Ok(true) => {}
                Ok(false) => {
                    info!(stage_id, "stageEnabled evaluated false, skipping");
                    stage.status = ExecutionStatus::Skipped;
                    execution.stages[stage_index] = stage;
                    ctx.store.store_stage(&execution.stages[stage_index]).await?;
                    ctx.queue
                        .push(Message::CompleteStage {
                            execution_type,
                            execution_id: execution_id.to_string(),
                            application: application.to_string(),
                            stage_id: stage_id.to_string(),
                            status: ExecutionStatus::Skipped,
                        })
                        .await?;
                    return Ok(());
                }
                Err(err) => {
                    return self
                        .fail_stage(&mut execution, stage_index, stage, application, err.to_string())
                        .await;
                }
            }
        }

        let Some(definition) = ctx.stage_definitions.resolve(&stage.stage_type) else {
            warn!(stage_id, stage_type = %stage.stage_type, "unknown stage type");
            let message = format!("unknown stage type '{}'", stage.stage_type);
            return self.fail_stage(&mut execution, stage_index, stage, application, message).await;
        };

        // expansion runs once; children or tasks on record mean a redelivery
        let already_expanded = !stage.tasks.is_empty()
            || execution
                .stages
                .iter()
                .any(|s| s.parent_stage_id.as_deref() == Some(stage.id.as_str()));
        if !already_expanded {
            let mut before_specs: Vec<SyntheticStageSpec> = Vec::new();
            if stage.restrict_execution_window() && stage.stage_type != EXECUTION_WINDOW_STAGE_TYPE {
                before_specs.push(execution_window_spec(&stage));
            }
            before_specs.extend(definition.before_stages(&stage));
            let branch_specs = definition.parallel_stages(&stage);
            let has_branches = !branch_specs.is_empty();
            before_specs.extend(branch_specs);
            let after_specs = definition.after_stages(&stage);

            // a parallel-branching stage materializes its post-branch
            // task list up front; everything else defers to the task
            // phase so before-children run against an untouched parent
            if has_branches || before_specs.is_empty() {
                let mut builder = TaskGraphBuilder::new();
                definition.task_graph(&stage, &mut builder);
                match builder.build(&stage.stage_type) {
                    Ok(tasks) => stage.tasks = tasks,
                    Err(err) => {
                        return self
                            .fail_stage(&mut execution, stage_index, stage, application, err.to_string())
                            .await;
                    }
                }
            }

            let mut ordinal = 0;
            let befores: Vec<Stage> = before_specs
                .iter()
                .map(|spec| {
                    ordinal += 1;
                    synthetic_stage(&stage, spec, ordinal, SyntheticStageOwner::StageBefore)
                })
                .collect();
            let afters: Vec<Stage> = after_specs
                .iter()
                .map(|spec| {
                    ordinal += 1;
                    synthetic_stage(&stage, spec, ordinal, SyntheticStageOwner::StageAfter)
                })
                .collect();

            execution.stages[stage_index] = stage;
            let mut insert_at = stage_index;
            for synthetic in befores {
                execution.stages.insert(insert_at, synthetic);
                insert_at += 1;
            }
            let mut after_at = insert_at + 1;
            for synthetic in afters {
                execution.stages.insert(after_at, synthetic);
                after_at += 1;
            }
            ctx.store.store(&execution).await?;
            stage = execution.stages[insert_at].clone();
        }

        let before_children = execution.synthetic_children(&stage.id, SyntheticStageOwner::StageBefore);
        if before_children
            .iter()
            .any(|s| s.status.is_complete() && !s.status.is_successful())
        {
            debug!(stage_id, "before-stage failed, awaiting parent finalization");
            return Ok(());
        }
        let befores_complete = before_children.iter().all(|s| s.status.is_complete());
        if !before_children.is_empty() && !befores_complete {
            ctx.enqueue_ready_children(&execution, &stage, SyntheticStageOwner::StageBefore, application)
                .await?;
            return Ok(());
        }

        // task phase
        if stage.tasks.is_empty() {
            let mut builder = TaskGraphBuilder::new();
            definition.task_graph(&stage, &mut builder);
            match builder.build(&stage.stage_type) {
                Ok(tasks) => stage.tasks = tasks,
                Err(err) => {
                    let index = execution.stage_index(&stage.id).unwrap_or(stage_index);
                    return self
                        .fail_stage(&mut execution, index, stage, application, err.to_string())
                        .await;
                }
            }
        }

        let won = ctx
            .store
            .compare_and_set_stage_status(
                execution_type,
                execution_id,
                &stage.id,
                ExecutionStatus::NotStarted,
                ExecutionStatus::Running,
            )
            .await?;
        if !won {
            debug!(stage_id, "lost the start race, another worker owns this stage");
            return Ok(());
        }

        stage.status = ExecutionStatus::Running;
        stage.start_time = Some(ctx.now());
        ctx.store.store_stage(&stage).await?;
        info!(execution_id, stage_id, stage_type = %stage.stage_type, "stage started");

        // the task graph builder guarantees a stage-start task
        let Some(first_task) = stage
            .tasks
            .iter()
            .find(|t| t.stage_start)
            .or_else(|| stage.tasks.first())
            .map(|t| t.id.clone())
        else {
            warn!(stage_id, "stage has no tasks after materialization");
            ctx.queue
                .push(Message::CompleteStage {
                    execution_type,
                    execution_id: execution_id.to_string(),
                    application: application.to_string(),
                    stage_id: stage.id.clone(),
                    status: ExecutionStatus::Terminal,
                })
                .await?;
            return Ok(());
        };
        ctx.queue
            .push(Message::StartTask {
                execution_type,
                execution_id: execution_id.to_string(),
                application: application.to_string(),
                stage_id: stage.id.clone(),
                task_id: first_task,
            })
            .await?;
        ctx.publish(EngineEvent::StageStarted {
            execution_type,
            execution_id: execution_id.to_string(),
            stage_id: stage.id.clone(),
            stage_type: stage.stage_type.clone(),
        });
        Ok(())
    }

    /// Record the failure detail and route the stage through
    /// CompleteStage(TERMINAL) so rollup happens in exactly one place
    async fn fail_stage(
        &self,
        execution: &mut Execution,
        stage_index: usize,
        mut stage: Stage,
        application: &str,
        message: String,
    ) -> Result<()> {
        warn!(stage_id = %stage.id, %message, "stage failed before task dispatch");
        stage.record_error(message);
        execution.stages[stage_index] = stage;
        let stage = &execution.stages[stage_index];
        self.context.store.store_stage(stage).await?;
        self.context
            .queue
            .push(Message::CompleteStage {
                execution_type: execution.execution_type,
                execution_id: execution.id.clone(),
                application: application.to_string(),
                stage_id: stage.id.clone(),
                status: ExecutionStatus::Terminal,
            })
            .await?;
        Ok(())
    }
}

/// All upstream edges resolve to a successful terminal status.
/// References that name no stage are ignored.
fn requisites_satisfied(execution: &Execution, stage: &Stage) -> bool {
    stage.requisite_stage_ref_ids.iter().all(|ref_id| {
        match execution.stage_by_ref(ref_id) {
            Some(upstream) => upstream.status.is_successful(),
            None => {
                warn!(stage_id = %stage.id, ref_id = %ref_id, "requisite names no stage, ignoring");
                true
            }
        }
    })
}

/// Synthetic child record for one spec, on one side of the parent
fn synthetic_stage(
    parent: &Stage,
    spec: &SyntheticStageSpec,
    ordinal: usize,
    owner: SyntheticStageOwner,
) -> Stage {
    let mut stage = Stage::new(
        parent.execution_type,
        parent.execution_id.clone(),
        Stage::synthetic_id(&parent.id, ordinal, &spec.ref_id),
        spec.ref_id.clone(),
        spec.stage_type.clone(),
        spec.name.clone(),
    );
    stage.parent_stage_id = Some(parent.id.clone());
    stage.synthetic_owner = Some(owner);
    stage.context = spec.context.clone();
    stage
}

/// Spec for the built-in execution window child, seeded with the
/// parent's window whitelist
fn execution_window_spec(parent: &Stage) -> SyntheticStageSpec {
    let mut spec = SyntheticStageSpec::new(EXECUTION_WINDOW_STAGE_TYPE, EXECUTION_WINDOW_STAGE_TYPE);
    if let Some(window) = parent.context.get(context_keys::EXECUTION_WINDOW) {
        spec.context
            .insert(context_keys::EXECUTION_WINDOW.to_string(), window.clone());
    }
    spec
}
