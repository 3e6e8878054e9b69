//! # Message Handlers
//!
//! One handler per message variant. Handlers share nothing but the
//! [`EngineContext`]: they load state through the store, mutate it,
//! write it back, and enqueue follow-up messages. Every handler is
//! idempotent — redelivery after a worker crash is part of the queue
//! contract, not an error path.

pub mod cancel;
pub mod complete_execution;
pub mod complete_stage;
pub mod complete_task;
pub mod pause;
pub mod restart_stage;
pub mod run_task;
pub mod start_execution;
pub mod start_stage;
pub mod start_task;

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::{EngineEvent, EventPublisher};
use crate::messaging::{Message, MessageQueue};
use crate::models::{Execution, ExecutionType, Stage, SyntheticStageOwner};
use crate::registry::{StageDefinitionRegistry, TaskHandlerRegistry};
use crate::store::{ExecutionStore, StoreError};

pub use cancel::{CancelExecutionHandler, CancelStageHandler};
pub use complete_execution::CompleteExecutionHandler;
pub use complete_stage::CompleteStageHandler;
pub use complete_task::CompleteTaskHandler;
pub use pause::{PauseExecutionHandler, PauseStageHandler, ResumeExecutionHandler, ResumeStageHandler};
pub use restart_stage::RestartStageHandler;
pub use run_task::RunTaskHandler;
pub use start_execution::StartExecutionHandler;
pub use start_stage::StartStageHandler;
pub use start_task::StartTaskHandler;

/// Shared dependencies of every message handler
pub struct EngineContext {
    pub store: Arc<dyn ExecutionStore>,
    pub queue: Arc<dyn MessageQueue>,
    pub stage_definitions: Arc<StageDefinitionRegistry>,
    pub task_handlers: Arc<TaskHandlerRegistry>,
    pub events: EventPublisher,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
}

impl EngineContext {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn publish(&self, event: EngineEvent) {
        self.events.publish(event, self.now());
    }

    /// Load an execution, routing a missing id to `InvalidExecutionId`
    pub(crate) async fn load_execution(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        application: &str,
    ) -> Result<Option<Execution>> {
        match self.store.retrieve(execution_type, execution_id).await {
            Ok(execution) => Ok(Some(execution)),
            Err(StoreError::ExecutionNotFound { .. }) => {
                warn!(execution_id, "execution not found");
                self.queue
                    .push(Message::InvalidExecutionId {
                        execution_type,
                        execution_id: execution_id.to_string(),
                        application: application.to_string(),
                    })
                    .await?;
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Locate a stage, routing a missing id to `InvalidStageId`
    pub(crate) async fn find_stage(
        &self,
        execution: &Execution,
        stage_id: &str,
        application: &str,
    ) -> Result<Option<usize>> {
        match execution.stage_index(stage_id) {
            Some(index) => Ok(Some(index)),
            None => {
                warn!(execution_id = %execution.id, stage_id, "stage not found");
                self.queue
                    .push(Message::InvalidStageId {
                        execution_type: execution.execution_type,
                        execution_id: execution.id.clone(),
                        application: application.to_string(),
                        stage_id: stage_id.to_string(),
                    })
                    .await?;
                Ok(None)
            }
        }
    }

    /// Enqueue StartStage for every synthetic child of `parent` that is
    /// ready to run, honoring sequencing: `before_stages`/`after_stages`
    /// children run one at a time, `parallel_stages` branches all start
    /// together. Returns true when every child on that side is complete.
    pub(crate) async fn enqueue_ready_children(
        &self,
        execution: &Execution,
        parent: &Stage,
        owner: SyntheticStageOwner,
        application: &str,
    ) -> Result<bool> {
        let branch_refs: HashSet<String> = self
            .stage_definitions
            .resolve(&parent.stage_type)
            .map(|definition| {
                definition
                    .parallel_stages(parent)
                    .into_iter()
                    .map(|spec| spec.ref_id)
                    .collect()
            })
            .unwrap_or_default();

        let mut to_start: Vec<String> = Vec::new();
        // a started sequential child blocks everything after it; any
        // incomplete child blocks later sequential children
        let mut blocked_sequential = false;
        let mut prior_incomplete = false;
        for child in execution.synthetic_children(&parent.id, owner) {
            if child.status.is_complete() {
                continue;
            }
            let parallel = owner == SyntheticStageOwner::StageBefore && branch_refs.contains(&child.ref_id);
            if parallel {
                if !blocked_sequential && child.status == crate::models::ExecutionStatus::NotStarted {
                    to_start.push(child.id.clone());
                }
            } else {
                if !prior_incomplete && child.status == crate::models::ExecutionStatus::NotStarted {
                    to_start.push(child.id.clone());
                }
                blocked_sequential = true;
            }
            prior_incomplete = true;
        }

        for stage_id in to_start {
            debug!(parent_id = %parent.id, stage_id = %stage_id, "starting synthetic child");
            self.queue
                .push(Message::StartStage {
                    execution_type: execution.execution_type,
                    execution_id: execution.id.clone(),
                    application: application.to_string(),
                    stage_id,
                })
                .await?;
        }
        Ok(!prior_incomplete)
    }
}

/// Routes each message variant to its handler
pub struct MessageDispatcher {
    start_execution: StartExecutionHandler,
    start_stage: StartStageHandler,
    complete_stage: CompleteStageHandler,
    start_task: StartTaskHandler,
    run_task: RunTaskHandler,
    complete_task: CompleteTaskHandler,
    complete_execution: CompleteExecutionHandler,
    restart_stage: RestartStageHandler,
    cancel_execution: CancelExecutionHandler,
    cancel_stage: CancelStageHandler,
    pause_stage: PauseStageHandler,
    resume_stage: ResumeStageHandler,
    pause_execution: PauseExecutionHandler,
    resume_execution: ResumeExecutionHandler,
}

impl MessageDispatcher {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            start_execution: StartExecutionHandler::new(context.clone()),
            start_stage: StartStageHandler::new(context.clone()),
            complete_stage: CompleteStageHandler::new(context.clone()),
            start_task: StartTaskHandler::new(context.clone()),
            run_task: RunTaskHandler::new(context.clone()),
            complete_task: CompleteTaskHandler::new(context.clone()),
            complete_execution: CompleteExecutionHandler::new(context.clone()),
            restart_stage: RestartStageHandler::new(context.clone()),
            cancel_execution: CancelExecutionHandler::new(context.clone()),
            cancel_stage: CancelStageHandler::new(context.clone()),
            pause_stage: PauseStageHandler::new(context.clone()),
            resume_stage: ResumeStageHandler::new(context.clone()),
            pause_execution: PauseExecutionHandler::new(context.clone()),
            resume_execution: ResumeExecutionHandler::new(context),
        }
    }

    /// Handle one message. An `Ok` return means the message is done and
    /// may be acked; a transient error means redelivery should retry it.
    pub async fn dispatch(&self, message: &Message) -> Result<()> {
        debug!(
            message_type = message.message_type(),
            execution_id = message.execution_id(),
            stage_id = message.stage_id().unwrap_or_default(),
            "dispatch"
        );
        match message {
            Message::StartExecution {
                execution_type,
                execution_id,
                application,
            } => {
                self.start_execution
                    .handle(*execution_type, execution_id, application)
                    .await
            }
            Message::StartStage {
                execution_type,
                execution_id,
                application,
                stage_id,
            } => {
                self.start_stage
                    .handle(*execution_type, execution_id, application, stage_id)
                    .await
            }
            Message::CompleteStage {
                execution_type,
                execution_id,
                application,
                stage_id,
                status,
            } => {
                self.complete_stage
                    .handle(*execution_type, execution_id, application, stage_id, *status)
                    .await
            }
            Message::StartTask {
                execution_type,
                execution_id,
                application,
                stage_id,
                task_id,
            } => {
                self.start_task
                    .handle(*execution_type, execution_id, application, stage_id, task_id)
                    .await
            }
            Message::RunTask {
                execution_type,
                execution_id,
                application,
                stage_id,
                task_id,
            } => {
                self.run_task
                    .handle(*execution_type, execution_id, application, stage_id, task_id)
                    .await
            }
            Message::CompleteTask {
                execution_type,
                execution_id,
                application,
                stage_id,
                task_id,
                status,
            } => {
                self.complete_task
                    .handle(
                        *execution_type,
                        execution_id,
                        application,
                        stage_id,
                        task_id,
                        *status,
                    )
                    .await
            }
            Message::CompleteExecution {
                execution_type,
                execution_id,
                application,
                status,
            } => {
                self.complete_execution
                    .handle(*execution_type, execution_id, application, *status)
                    .await
            }
            Message::RestartStage {
                execution_type,
                execution_id,
                application,
                stage_id,
            } => {
                self.restart_stage
                    .handle(*execution_type, execution_id, application, stage_id)
                    .await
            }
            Message::CancelExecution {
                execution_type,
                execution_id,
                application,
                canceled_by,
                reason,
            } => {
                self.cancel_execution
                    .handle(
                        *execution_type,
                        execution_id,
                        application,
                        canceled_by.as_deref(),
                        reason.as_deref(),
                    )
                    .await
            }
            Message::CancelStage {
                execution_type,
                execution_id,
                application,
                stage_id,
            } => {
                self.cancel_stage
                    .handle(*execution_type, execution_id, application, stage_id)
                    .await
            }
            Message::PauseStage {
                execution_type,
                execution_id,
                application,
                stage_id,
            } => {
                self.pause_stage
                    .handle(*execution_type, execution_id, application, stage_id)
                    .await
            }
            Message::ResumeStage {
                execution_type,
                execution_id,
                application,
                stage_id,
            } => {
                self.resume_stage
                    .handle(*execution_type, execution_id, application, stage_id)
                    .await
            }
            Message::PauseExecution {
                execution_type,
                execution_id,
                application,
            } => {
                self.pause_execution
                    .handle(*execution_type, execution_id, application)
                    .await
            }
            Message::ResumeExecution {
                execution_type,
                execution_id,
                application,
            } => {
                self.resume_execution
                    .handle(*execution_type, execution_id, application)
                    .await
            }
            // terminal routing tokens: surfaced for observability, then dropped
            Message::InvalidExecutionId {
                execution_id, ..
            } => {
                warn!(execution_id = %execution_id, "invalid execution id");
                Ok(())
            }
            Message::InvalidStageId {
                execution_id,
                stage_id,
                ..
            } => {
                warn!(execution_id = %execution_id, stage_id = %stage_id, "invalid stage id");
                Ok(())
            }
            Message::InvalidTaskType {
                execution_id,
                implementing_class,
                ..
            } => {
                warn!(execution_id = %execution_id, implementing_class = %implementing_class, "invalid task type");
                Ok(())
            }
        }
    }
}
