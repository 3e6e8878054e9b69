use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

use super::stage::{Stage, SyntheticStageOwner};
use super::status::ExecutionStatus;

/// Kind of execution: a pipeline is a DAG gated by requisite edges, an
/// orchestration is an ad-hoc sequential run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    Pipeline,
    Orchestration,
}

impl fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipeline => write!(f, "pipeline"),
            Self::Orchestration => write!(f, "orchestration"),
        }
    }
}

impl std::str::FromStr for ExecutionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pipeline" => Ok(Self::Pipeline),
            "orchestration" => Ok(Self::Orchestration),
            _ => Err(format!("Invalid execution type: {s}")),
        }
    }
}

/// Root entity of the engine: an in-flight pipeline or orchestration.
///
/// Owns its stages; the execution store is the single authority for
/// this record and handlers load, mutate, and write back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub application: String,
    pub execution_type: ExecutionType,
    pub name: String,
    pub status: ExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Cooperative cancellation flag, observed by RunTask on every poll
    pub canceled: bool,
    pub canceled_by: Option<String>,
    pub cancellation_reason: Option<String>,
    /// Ordered stage sequence; synthetics are spliced in at runtime
    pub stages: Vec<Stage>,
    /// Free-form execution context (trigger payload, parameters)
    pub context: HashMap<String, Value>,
}

impl Execution {
    pub fn new(execution_type: ExecutionType, application: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            application: application.into(),
            execution_type,
            name: String::new(),
            status: ExecutionStatus::NotStarted,
            start_time: None,
            end_time: None,
            canceled: false,
            canceled_by: None,
            cancellation_reason: None,
            stages: Vec::new(),
            context: HashMap::new(),
        }
    }

    pub fn builder(execution_type: ExecutionType, application: impl Into<String>) -> ExecutionBuilder {
        ExecutionBuilder::new(execution_type, application)
    }

    pub fn stage(&self, stage_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    pub fn stage_mut(&mut self, stage_id: &str) -> Option<&mut Stage> {
        self.stages.iter_mut().find(|s| s.id == stage_id)
    }

    pub fn stage_index(&self, stage_id: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.id == stage_id)
    }

    /// Non-synthetic stage lookup by author reference id
    pub fn stage_by_ref(&self, ref_id: &str) -> Option<&Stage> {
        self.stages
            .iter()
            .find(|s| !s.is_synthetic() && s.ref_id == ref_id)
    }

    /// Synthetic children of a stage on the given side, in stage order
    pub fn synthetic_children(&self, parent_id: &str, owner: SyntheticStageOwner) -> Vec<&Stage> {
        self.stages
            .iter()
            .filter(|s| {
                s.parent_stage_id.as_deref() == Some(parent_id) && s.synthetic_owner == Some(owner)
            })
            .collect()
    }

    /// Ids of all synthetic descendants of a stage, transitively
    pub fn synthetic_descendants(&self, stage_id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut frontier = vec![stage_id.to_string()];
        while let Some(parent) = frontier.pop() {
            for stage in &self.stages {
                if stage.parent_stage_id.as_deref() == Some(parent.as_str()) {
                    out.push(stage.id.clone());
                    frontier.push(stage.id.clone());
                }
            }
        }
        out
    }

    /// Non-synthetic stages whose requisites name the given reference id
    pub fn downstream_of(&self, ref_id: &str) -> Vec<&Stage> {
        self.stages
            .iter()
            .filter(|s| {
                !s.is_synthetic() && s.requisite_stage_ref_ids.iter().any(|r| r == ref_id)
            })
            .collect()
    }

    /// Forward closure over requisite edges, starting from one reference
    /// id. Implicit next-in-order edges never extend the closure: this
    /// is the restart set, and restart locality depends on it.
    pub fn downstream_closure(&self, ref_id: &str) -> Vec<String> {
        let mut refs: HashSet<String> = HashSet::new();
        refs.insert(ref_id.to_string());
        loop {
            let mut grew = false;
            for stage in self.stages.iter().filter(|s| !s.is_synthetic()) {
                if refs.contains(&stage.ref_id) {
                    continue;
                }
                if stage.requisite_stage_ref_ids.iter().any(|r| refs.contains(r)) {
                    refs.insert(stage.ref_id.clone());
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }
        self.stages
            .iter()
            .filter(|s| !s.is_synthetic() && refs.contains(&s.ref_id))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Stages that start when the execution starts: for a pipeline every
    /// non-synthetic stage with no requisites, for an orchestration the
    /// first stage only.
    pub fn initial_stages(&self) -> Vec<&Stage> {
        let top_level: Vec<&Stage> = self.stages.iter().filter(|s| !s.is_synthetic()).collect();
        match self.execution_type {
            ExecutionType::Pipeline => top_level
                .into_iter()
                .filter(|s| s.requisite_stage_ref_ids.is_empty())
                .collect(),
            ExecutionType::Orchestration => top_level.into_iter().take(1).collect(),
        }
    }

    /// Next non-synthetic sibling after the given stage, in author order
    pub fn next_top_level_after(&self, stage_id: &str) -> Option<&Stage> {
        let idx = self.stage_index(stage_id)?;
        self.stages[idx + 1..].iter().find(|s| !s.is_synthetic())
    }

    pub fn has_running_stages(&self) -> bool {
        self.stages.iter().any(|s| s.status.is_active())
    }
}

/// Builder for assembling executions with stages, edges, and context.
/// Front-ends and tests both go through this.
pub struct ExecutionBuilder {
    execution: Execution,
}

impl ExecutionBuilder {
    fn new(execution_type: ExecutionType, application: impl Into<String>) -> Self {
        Self {
            execution: Execution::new(execution_type, application),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.execution.name = name.into();
        self
    }

    pub fn context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.execution.context.insert(key.into(), value);
        self
    }

    /// Append a top-level stage. The stage id is derived from the
    /// execution id and the reference id, so handles stay stable.
    pub fn stage(self, ref_id: &str, stage_type: &str) -> Self {
        self.stage_with(ref_id, stage_type, Vec::new(), HashMap::new())
    }

    /// Append a top-level stage with requisites and context
    pub fn stage_with(
        mut self,
        ref_id: &str,
        stage_type: &str,
        requisites: Vec<&str>,
        context: HashMap<String, Value>,
    ) -> Self {
        let mut stage = Stage::new(
            self.execution.execution_type,
            self.execution.id.clone(),
            format!("{}-{}", self.execution.id, ref_id),
            ref_id,
            stage_type,
            stage_type,
        );
        stage.requisite_stage_ref_ids = requisites.into_iter().map(String::from).collect();
        stage.context = context;
        self.execution.stages.push(stage);
        self
    }

    pub fn build(self) -> Execution {
        self.execution
    }
}
