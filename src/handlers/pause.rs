//! # Pause and Resume Handlers
//!
//! Pausing adds a marker; it never interrupts a task in flight.
//! StartTask observes the marker and re-enqueues itself with a fixed
//! delay, so a resumed stage picks up from exactly where dispatch
//! stopped.

use std::sync::Arc;
use tracing::{debug, info};

use super::EngineContext;
use crate::error::Result;
use crate::models::{ExecutionStatus, ExecutionType};

pub struct PauseStageHandler {
    context: Arc<EngineContext>,
}

impl PauseStageHandler {
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

        let stage = &mut execution.stages[stage_index];
        if stage.status.is_complete() {
            debug!(stage_id, "stage already complete, dropping pause");
            return Ok(());
        }
        stage.paused = true;
        let stage = stage.clone();
        ctx.store.store_stage(&stage).await?;
        info!(execution_id, stage_id, "stage paused");
        Ok(())
    }
}

pub struct ResumeStageHandler {
    context: Arc<EngineContext>,
}

impl ResumeStageHandler {
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

        let stage = &mut execution.stages[stage_index];
        if stage.paused {
            stage.paused = false;
            let stage = stage.clone();
            ctx.store.store_stage(&stage).await?;
            info!(execution_id, stage_id, "stage resumed");
        }
        Ok(())
    }
}

pub struct PauseExecutionHandler {
    context: Arc<EngineContext>,
}

impl PauseExecutionHandler {
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
        if execution.status != ExecutionStatus::Running {
            debug!(execution_id, status = %execution.status, "execution not running, dropping pause");
            return Ok(());
        }

        execution.status = ExecutionStatus::Paused;
        for stage in execution.stages.iter_mut().filter(|s| !s.status.is_complete()) {
            stage.paused = true;
        }
        ctx.store.store(&execution).await?;
        info!(execution_id, "execution paused");
        Ok(())
    }
}

pub struct ResumeExecutionHandler {
    context: Arc<EngineContext>,
}

impl ResumeExecutionHandler {
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
        if execution.status != ExecutionStatus::Paused {
            debug!(execution_id, status = %execution.status, "execution not paused, dropping resume");
            return Ok(());
        }

        execution.status = ExecutionStatus::Running;
        for stage in execution.stages.iter_mut() {
            stage.paused = false;
        }
        ctx.store.store(&execution).await?;
        info!(execution_id, "execution resumed");
        Ok(())
    }
}
