//! Shared test harness: a deterministic engine wired with in-memory
//! store and queue, a manual clock, and the catalog of test stage
//! types the scenarios drive.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use conductor_core::{
    clock::ManualClock,
    engine::ExecutionEngine,
    error::Result,
    events::PublishedEvent,
    messaging::InMemoryQueue,
    models::{Execution, ExecutionType, Stage},
    registry::{StageDefinition, SyntheticStageSpec, TaskGraphBuilder, TaskHandler, TaskResult},
    store::{ExecutionStore, InMemoryExecutionStore},
    EngineConfig, EngineEvent,
};

/// How many messages a drain is allowed to handle before the test fails
pub const DRAIN_LIMIT: usize = 500;

pub struct TestEngine {
    pub engine: ExecutionEngine,
    pub clock: Arc<ManualClock>,
    pub queue: Arc<InMemoryQueue>,
    pub store: Arc<InMemoryExecutionStore>,
}

impl TestEngine {
    /// Handle every visible message; delayed messages stay parked
    pub async fn drain(&self) -> usize {
        self.engine
            .run_until_quiescent(DRAIN_LIMIT)
            .await
            .expect("drain failed")
    }

    /// Handle exactly one message
    pub async fn step(&self) -> Option<conductor_core::Message> {
        self.engine.step().await.expect("step failed")
    }

    pub async fn load(&self, execution: &Execution) -> Execution {
        self.store
            .retrieve(execution.execution_type, &execution.id)
            .await
            .expect("execution not stored")
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Engine with the full test stage catalog registered
pub fn test_engine() -> TestEngine {
    init_tracing();
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 14, 8, 0, 0).unwrap(),
    ));
    let store = Arc::new(InMemoryExecutionStore::new());
    let config = EngineConfig::default();
    let queue = Arc::new(InMemoryQueue::new(clock.clone(), config.visibility_timeout()));

    let engine = ExecutionEngine::builder()
        .with_clock(clock.clone())
        .with_store(store.clone())
        .with_queue(queue.clone())
        .with_config(config)
        .register_stage_definition(Arc::new(MultiTaskStage))
        .register_stage_definition(Arc::new(SingleTaskStage))
        .register_stage_definition(Arc::new(SyntheticBeforeStage))
        .register_stage_definition(Arc::new(SyntheticAfterStage))
        .register_stage_definition(Arc::new(ParallelBranchesStage))
        .register_stage_definition(Arc::new(LoopingStage))
        .register_stage_definition(Arc::new(FailingStage))
        .register_stage_definition(Arc::new(WaitingStage))
        .register_stage_definition(Arc::new(TimedStage))
        .register_stage_definition(Arc::new(UnknownTaskStage))
        .register_task_handler("dummyTask", Arc::new(DummyTask))
        .register_task_handler("failingTask", Arc::new(FailingTask))
        .register_task_handler("loopCounterTask", Arc::new(LoopCounterTask))
        .register_task_handler("waitingTask", Arc::new(WaitingTask))
        .register_task_handler("timedTask", Arc::new(TimedTask))
        .build();

    TestEngine {
        engine,
        clock,
        queue,
        store,
    }
}

/// Drain everything the receiver has buffered
pub fn collect_events(receiver: &mut broadcast::Receiver<PublishedEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(published) = receiver.try_recv() {
        events.push(published.event);
    }
    events
}

pub fn single_stage_pipeline(stage_type: &str) -> Execution {
    Execution::builder(ExecutionType::Pipeline, "app")
        .name("test pipeline")
        .stage("1", stage_type)
        .build()
}

pub fn stage_context(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// --- stage catalog -------------------------------------------------------

/// Three plain tasks
pub struct MultiTaskStage;

impl StageDefinition for MultiTaskStage {
    fn stage_type(&self) -> &str {
        "multiTask"
    }

    fn task_graph(&self, _stage: &Stage, builder: &mut TaskGraphBuilder) {
        builder.append("dummy1", "dummyTask");
        builder.append("dummy2", "dummyTask");
        builder.append("dummy3", "dummyTask");
    }
}

/// One plain task
pub struct SingleTaskStage;

impl StageDefinition for SingleTaskStage {
    fn stage_type(&self) -> &str {
        "singleTask"
    }

    fn task_graph(&self, _stage: &Stage, builder: &mut TaskGraphBuilder) {
        builder.append("dummy", "dummyTask");
    }
}

/// Two synthetic children ahead of the stage's own task
pub struct SyntheticBeforeStage;

impl StageDefinition for SyntheticBeforeStage {
    fn stage_type(&self) -> &str {
        "stageWithSyntheticBefore"
    }

    fn task_graph(&self, _stage: &Stage, builder: &mut TaskGraphBuilder) {
        builder.append("main", "dummyTask");
    }

    fn before_stages(&self, _stage: &Stage) -> Vec<SyntheticStageSpec> {
        vec![
            SyntheticStageSpec::new("pre1", "singleTask"),
            SyntheticStageSpec::new("pre2", "singleTask"),
        ]
    }
}

/// One synthetic child after the stage's own task
pub struct SyntheticAfterStage;

impl StageDefinition for SyntheticAfterStage {
    fn stage_type(&self) -> &str {
        "stageWithSyntheticAfter"
    }

    fn task_graph(&self, _stage: &Stage, builder: &mut TaskGraphBuilder) {
        builder.append("main", "dummyTask");
    }

    fn after_stages(&self, _stage: &Stage) -> Vec<SyntheticStageSpec> {
        vec![SyntheticStageSpec::new("post1", "singleTask")]
    }
}

/// Three parallel branches joined by a post-branch task. Branch
/// children share the parent's type; the task graph differentiates on
/// synthetic-ness.
pub struct ParallelBranchesStage;

impl StageDefinition for ParallelBranchesStage {
    fn stage_type(&self) -> &str {
        "stageWithParallelBranches"
    }

    fn task_graph(&self, stage: &Stage, builder: &mut TaskGraphBuilder) {
        if stage.is_synthetic() {
            builder.append("branch-task", "dummyTask");
        } else {
            builder.append("post-branch", "dummyTask");
        }
    }

    fn parallel_stages(&self, stage: &Stage) -> Vec<SyntheticStageSpec> {
        if stage.is_synthetic() {
            return Vec::new();
        }
        vec![
            SyntheticStageSpec::new("branch1", "stageWithParallelBranches"),
            SyntheticStageSpec::new("branch2", "stageWithParallelBranches"),
            SyntheticStageSpec::new("branch3", "stageWithParallelBranches"),
        ]
    }
}

/// A three-task loop whose loop-end task re-iterates twice
pub struct LoopingStage;

impl StageDefinition for LoopingStage {
    fn stage_type(&self) -> &str {
        "loopingStage"
    }

    fn task_graph(&self, _stage: &Stage, builder: &mut TaskGraphBuilder) {
        builder.append_loop_start("startLoop", "dummyTask");
        builder.append("work", "dummyTask");
        builder.append_loop_end("endLoop", "loopCounterTask");
    }
}

/// Single task that fails terminally
pub struct FailingStage;

impl StageDefinition for FailingStage {
    fn stage_type(&self) -> &str {
        "failingStage"
    }

    fn task_graph(&self, _stage: &Stage, builder: &mut TaskGraphBuilder) {
        builder.append("explode", "failingTask");
    }
}

/// Single task that polls forever
pub struct WaitingStage;

impl StageDefinition for WaitingStage {
    fn stage_type(&self) -> &str {
        "waitingStage"
    }

    fn task_graph(&self, _stage: &Stage, builder: &mut TaskGraphBuilder) {
        builder.append("wait", "waitingTask");
    }
}

/// Single polling task with a two-second budget
pub struct TimedStage;

impl StageDefinition for TimedStage {
    fn stage_type(&self) -> &str {
        "timedStage"
    }

    fn task_graph(&self, _stage: &Stage, builder: &mut TaskGraphBuilder) {
        builder.append("slow", "timedTask");
    }
}

/// References an implementing class nothing registered
pub struct UnknownTaskStage;

impl StageDefinition for UnknownTaskStage {
    fn stage_type(&self) -> &str {
        "unknownTaskStage"
    }

    fn task_graph(&self, _stage: &Stage, builder: &mut TaskGraphBuilder) {
        builder.append("mystery", "missingTask");
    }
}

// --- task catalog --------------------------------------------------------

pub struct DummyTask;

#[async_trait]
impl TaskHandler for DummyTask {
    async fn execute(&self, _stage: &Stage) -> Result<TaskResult> {
        Ok(TaskResult::succeeded())
    }
}

pub struct FailingTask;

#[async_trait]
impl TaskHandler for FailingTask {
    async fn execute(&self, _stage: &Stage) -> Result<TaskResult> {
        Ok(TaskResult::terminal_with_error("dummy task failed"))
    }
}

/// Counts iterations in the stage context and asks for two more loops
pub struct LoopCounterTask;

#[async_trait]
impl TaskHandler for LoopCounterTask {
    async fn execute(&self, stage: &Stage) -> Result<TaskResult> {
        let iterations = stage
            .context
            .get("iterations")
            .and_then(Value::as_i64)
            .unwrap_or(0)
            + 1;
        Ok(TaskResult::succeeded()
            .with_output("iterations", json!(iterations))
            .with_output("loopContinue", json!(iterations < 3)))
    }
}

/// Never finishes; used to observe cancellation and pause behavior
pub struct WaitingTask;

#[async_trait]
impl TaskHandler for WaitingTask {
    async fn execute(&self, _stage: &Stage) -> Result<TaskResult> {
        Ok(TaskResult::running())
    }

    fn backoff_period(&self) -> Duration {
        Duration::from_millis(50)
    }
}

/// Never finishes and declares a two-second timeout
pub struct TimedTask;

#[async_trait]
impl TaskHandler for TimedTask {
    async fn execute(&self, _stage: &Stage) -> Result<TaskResult> {
        Ok(TaskResult::running())
    }

    fn backoff_period(&self) -> Duration {
        Duration::from_millis(100)
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(2))
    }
}
