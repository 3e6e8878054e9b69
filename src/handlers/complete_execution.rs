//! # CompleteExecution Handler
//!
//! Terminal rollup: sets the execution status and end time, halts any
//! stage still marked RUNNING, and publishes the ExecutionComplete
//! event. The store reports whether this call performed the first
//! terminal transition, so redelivery republishes nothing.

use std::sync::Arc;
use tracing::{debug, info};

use super::EngineContext;
use crate::error::Result;
use crate::events::EngineEvent;
use crate::models::{ExecutionStatus, ExecutionType};
use crate::store::StoreError;

pub struct CompleteExecutionHandler {
    context: Arc<EngineContext>,
}

impl CompleteExecutionHandler {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self { context }
    }

    pub async fn handle(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        application: &str,
        status: ExecutionStatus,
    ) -> Result<()> {
        let ctx = &self.context;
        let completed_at = ctx.now();
        let first_transition = match ctx
            .store
            .update_status(execution_type, execution_id, status, Some(completed_at))
            .await
        {
            Ok(first) => first,
            Err(StoreError::ExecutionNotFound { .. }) => {
                ctx.queue
                    .push(crate::messaging::Message::InvalidExecutionId {
                        execution_type,
                        execution_id: execution_id.to_string(),
                        application: application.to_string(),
                    })
                    .await?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        if !first_transition {
            debug!(execution_id, %status, "execution already complete, suppressing duplicate event");
            return Ok(());
        }

        // a terminal execution leaves no stage running: anything still
        // in flight is halted so the record settles
        let mut execution = ctx.store.retrieve(execution_type, execution_id).await?;
        for stage in execution
            .stages
            .iter_mut()
            .filter(|s| s.status.is_active())
        {
            stage.status = ExecutionStatus::Canceled;
            stage.end_time = Some(completed_at);
            ctx.store.store_stage(stage).await?;
        }

        info!(execution_id, %execution_type, %status, "execution complete");
        ctx.publish(EngineEvent::ExecutionComplete {
            execution_type,
            execution_id: execution_id.to_string(),
            application: application.to_string(),
            status,
        });
        Ok(())
    }
}
