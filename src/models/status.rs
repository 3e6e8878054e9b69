use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status shared by executions, stages, and tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Initial state before any handler has touched the entity
    NotStarted,
    /// Work is in flight
    Running,
    /// Suspended by a pause marker; resumable
    Paused,
    /// Completed successfully
    Succeeded,
    /// Failed, but downstream gating treats it as success
    FailedContinue,
    /// Failed and final
    Terminal,
    /// Canceled by an operator
    Canceled,
    /// Halted without failing the execution
    Stopped,
    /// Skipped by a stageEnabled expression
    Skipped,
    /// Task-only status requesting a loop rewind
    Redirect,
}

impl ExecutionStatus {
    /// Check if this is a terminal state (no further transitions without a restart)
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            Self::Succeeded
                | Self::FailedContinue
                | Self::Terminal
                | Self::Canceled
                | Self::Stopped
                | Self::Skipped
        )
    }

    /// Check if this state satisfies downstream requisites
    pub fn is_successful(&self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedContinue | Self::Skipped)
    }

    /// Check if this state ended the entity without success
    pub fn is_halt(&self) -> bool {
        matches!(self, Self::Terminal | Self::Canceled | Self::Stopped)
    }

    /// Check if work is actively in flight
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::FailedContinue => write!(f, "failed_continue"),
            Self::Terminal => write!(f, "terminal"),
            Self::Canceled => write!(f, "canceled"),
            Self::Stopped => write!(f, "stopped"),
            Self::Skipped => write!(f, "skipped"),
            Self::Redirect => write!(f, "redirect"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "succeeded" => Ok(Self::Succeeded),
            "failed_continue" => Ok(Self::FailedContinue),
            "terminal" => Ok(Self::Terminal),
            "canceled" => Ok(Self::Canceled),
            "stopped" => Ok(Self::Stopped),
            "skipped" => Ok(Self::Skipped),
            "redirect" => Ok(Self::Redirect),
            _ => Err(format!("Invalid execution status: {s}")),
        }
    }
}
