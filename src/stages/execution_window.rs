//! # Execution Window Stage
//!
//! Built-in synthetic stage type that holds a stage until the clock is
//! inside an allowed time-of-day window. StartStage prepends it as the
//! first before-child of any stage whose context sets
//! `restrictExecutionDuringTimeWindow`; the single task polls the
//! injected clock with backoff, so no worker ever sleeps on it.

use async_trait::async_trait;
use chrono::Timelike;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clock::Clock;
use crate::error::Result;
use crate::models::{context_keys, Stage};
use crate::registry::{StageDefinition, TaskGraphBuilder, TaskHandler, TaskResult};

/// Type tag of the built-in window stage
pub const EXECUTION_WINDOW_STAGE_TYPE: &str = "restrictExecutionDuringTimeWindow";

/// Implementing-class name of the window wait task
pub const WAIT_FOR_EXECUTION_WINDOW_TASK: &str = "waitForExecutionWindowTask";

/// One allowed time-of-day window, end-exclusive. A window whose start
/// is later than its end crosses midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(rename = "startHour")]
    pub start_hour: u32,
    #[serde(rename = "startMin", default)]
    pub start_min: u32,
    #[serde(rename = "endHour")]
    pub end_hour: u32,
    #[serde(rename = "endMin", default)]
    pub end_min: u32,
}

impl TimeWindow {
    fn contains(&self, minute_of_day: u32) -> bool {
        let start = self.start_hour * 60 + self.start_min;
        let end = self.end_hour * 60 + self.end_min;
        if start <= end {
            minute_of_day >= start && minute_of_day < end
        } else {
            // crosses midnight
            minute_of_day >= start || minute_of_day < end
        }
    }
}

/// Stage definition: a single wait task, no synthetics of its own
pub struct ExecutionWindowStage;

impl StageDefinition for ExecutionWindowStage {
    fn stage_type(&self) -> &str {
        EXECUTION_WINDOW_STAGE_TYPE
    }

    fn task_graph(&self, _stage: &Stage, builder: &mut TaskGraphBuilder) {
        builder.append("waitForExecutionWindow", WAIT_FOR_EXECUTION_WINDOW_TASK);
    }
}

/// Task that completes only while the clock is inside a whitelisted
/// window. Missing or empty whitelists never block.
pub struct WaitForExecutionWindowTask {
    clock: Arc<dyn Clock>,
}

impl WaitForExecutionWindowTask {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn whitelist(stage: &Stage) -> Vec<TimeWindow> {
        stage
            .context
            .get(context_keys::EXECUTION_WINDOW)
            .and_then(|window| window.get("whitelist"))
            .and_then(|list| {
                serde_json::from_value::<Vec<TimeWindow>>(Value::Array(
                    list.as_array().cloned().unwrap_or_default(),
                ))
                .ok()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl TaskHandler for WaitForExecutionWindowTask {
    async fn execute(&self, stage: &Stage) -> Result<TaskResult> {
        let whitelist = Self::whitelist(stage);
        if whitelist.is_empty() {
            return Ok(TaskResult::succeeded());
        }

        let now = self.clock.now();
        let minute_of_day = now.hour() * 60 + now.minute();
        if whitelist.iter().any(|w| w.contains(minute_of_day)) {
            Ok(TaskResult::succeeded())
        } else {
            debug!(stage_id = %stage.id, minute_of_day, "outside execution window, waiting");
            Ok(TaskResult::running())
        }
    }

    fn backoff_period(&self) -> Duration {
        Duration::from_secs(30)
    }
}
