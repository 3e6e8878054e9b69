use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::ExecutionStatus;

/// A single unit of work inside a stage.
///
/// Tasks are ordered by their ordinal string id ("1", "2", ...). Exactly
/// one task per stage carries `stage_start` and exactly one carries
/// `stage_end`; loop markers come in at most one matched pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Per-stage ordinal id, assigned by the task graph builder
    pub id: String,
    /// Display name
    pub name: String,
    /// Registry key of the implementing task handler
    pub implementing_class: String,
    /// Lifecycle status
    pub status: ExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// First task of the stage
    pub stage_start: bool,
    /// Last task of the stage
    pub stage_end: bool,
    /// Opens a re-iterable loop subsequence
    pub loop_start: bool,
    /// Closes a re-iterable loop subsequence
    pub loop_end: bool,
}

impl Task {
    pub fn new(id: impl Into<String>, name: impl Into<String>, implementing_class: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            implementing_class: implementing_class.into(),
            status: ExecutionStatus::NotStarted,
            start_time: None,
            end_time: None,
            stage_start: false,
            stage_end: false,
            loop_start: false,
            loop_end: false,
        }
    }

    /// Parse the ordinal id back to its position (1-based)
    pub fn ordinal(&self) -> Option<usize> {
        self.id.parse().ok()
    }

    /// Reset the task to its pristine state, for loop rewinds and restarts
    pub fn reset(&mut self) {
        self.status = ExecutionStatus::NotStarted;
        self.start_time = None;
        self.end_time = None;
    }
}
