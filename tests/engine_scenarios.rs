//! End-to-end engine scenarios, driven deterministically by stepping
//! the in-memory queue one message at a time.

mod common;

use common::*;
use serde_json::json;

use conductor_core::{
    models::{context_keys, Execution, ExecutionStatus, ExecutionType, SyntheticStageOwner},
    EngineEvent, ExecutionStore, Message, MessageQueue,
};
use std::collections::HashMap;
use std::time::Duration;

#[tokio::test]
async fn linear_three_task_stage_runs_to_completion() {
    let harness = test_engine();
    let mut events = harness.engine.subscribe();
    let execution = single_stage_pipeline("multiTask");
    harness.engine.start(&execution).await.unwrap();

    // StartExecution, then StartStage
    assert!(matches!(harness.step().await, Some(Message::StartExecution { .. })));
    assert!(matches!(harness.step().await, Some(Message::StartStage { .. })));

    let loaded = harness.load(&execution).await;
    let stage = &loaded.stages[0];
    assert_eq!(stage.status, ExecutionStatus::Running);
    assert_eq!(stage.tasks.len(), 3);
    assert!(stage.tasks[0].stage_start && !stage.tasks[0].stage_end);
    assert!(!stage.tasks[1].stage_start && !stage.tasks[1].stage_end);
    assert!(!stage.tasks[2].stage_start && stage.tasks[2].stage_end);

    // first task dispatched
    let pending = harness.queue.pending_messages();
    assert!(matches!(
        &pending[..],
        [Message::StartTask { task_id, .. }] if task_id == "1"
    ));

    harness.drain().await;
    let finished = harness.load(&execution).await;
    assert_eq!(finished.status, ExecutionStatus::Succeeded);
    assert!(finished.end_time.is_some());
    assert!(finished.stages[0]
        .tasks
        .iter()
        .all(|t| t.status == ExecutionStatus::Succeeded));

    let events = collect_events(&mut events);
    let task_completions = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::TaskComplete { .. }))
        .count();
    assert_eq!(task_completions, 3);
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::ExecutionComplete { status: ExecutionStatus::Succeeded, .. })));
}

#[tokio::test]
async fn synthetic_before_stages_expand_and_run_first() {
    let harness = test_engine();
    let execution = single_stage_pipeline("stageWithSyntheticBefore");
    let parent_id = execution.stages[0].id.clone();
    harness.engine.start(&execution).await.unwrap();

    harness.step().await; // StartExecution
    harness.step().await; // StartStage on the parent

    let loaded = harness.load(&execution).await;
    assert_eq!(loaded.stages.len(), 3);
    let ids: Vec<&str> = loaded.stages.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            format!("{parent_id}-1-pre1").as_str(),
            format!("{parent_id}-2-pre2").as_str(),
            parent_id.as_str(),
        ]
    );
    for child in &loaded.stages[..2] {
        assert_eq!(child.parent_stage_id.as_deref(), Some(parent_id.as_str()));
        assert_eq!(child.synthetic_owner, Some(SyntheticStageOwner::StageBefore));
    }
    // the parent holds no tasks until its before-children finish
    assert!(loaded.stages[2].tasks.is_empty());
    assert_eq!(loaded.stages[2].status, ExecutionStatus::NotStarted);

    // only the first synthetic is dispatched
    let pending = harness.queue.pending_messages();
    assert!(matches!(
        &pending[..],
        [Message::StartStage { stage_id, .. }] if *stage_id == format!("{parent_id}-1-pre1")
    ));

    harness.drain().await;
    let finished = harness.load(&execution).await;
    assert_eq!(finished.status, ExecutionStatus::Succeeded);
    assert!(finished
        .stages
        .iter()
        .all(|s| s.status == ExecutionStatus::Succeeded));
    // parent got its own task after the synthetics completed
    assert_eq!(finished.stages[2].tasks.len(), 1);
}

#[tokio::test]
async fn parallel_branches_fan_out_together() {
    let harness = test_engine();
    let execution = single_stage_pipeline("stageWithParallelBranches");
    let parent_id = execution.stages[0].id.clone();
    harness.engine.start(&execution).await.unwrap();

    harness.step().await; // StartExecution
    harness.step().await; // StartStage on the parent

    let loaded = harness.load(&execution).await;
    assert_eq!(loaded.stages.len(), 4);

    // the parent keeps only the post-branch task list
    let parent = loaded.stage(&parent_id).unwrap();
    let task_names: Vec<&str> = parent.tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(task_names, vec!["post-branch"]);

    // all three branches dispatched at once
    let pending = harness.queue.pending_messages();
    let started: Vec<&str> = pending
        .iter()
        .filter_map(|m| match m {
            Message::StartStage { stage_id, .. } => Some(stage_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        started,
        vec![
            format!("{parent_id}-1-branch1").as_str(),
            format!("{parent_id}-2-branch2").as_str(),
            format!("{parent_id}-3-branch3").as_str(),
        ]
    );

    harness.drain().await;
    let finished = harness.load(&execution).await;
    assert_eq!(finished.status, ExecutionStatus::Succeeded);
    assert!(finished
        .stages
        .iter()
        .all(|s| s.status == ExecutionStatus::Succeeded));
}

#[tokio::test]
async fn join_stage_waits_for_every_requisite() {
    let harness = test_engine();
    let mut events = harness.engine.subscribe();
    let mut execution = Execution::builder(ExecutionType::Pipeline, "app")
        .stage("1", "multiTask")
        .stage("2", "multiTask")
        .stage_with("3", "multiTask", vec!["1", "2"], HashMap::new())
        .build();
    execution.status = ExecutionStatus::Running;
    execution.stages[0].status = ExecutionStatus::Succeeded;
    execution.stages[1].status = ExecutionStatus::Running;
    harness.engine.store().store(&execution).await.unwrap();

    let join_id = execution.stages[2].id.clone();
    harness
        .engine
        .queue()
        .push(Message::StartStage {
            execution_type: ExecutionType::Pipeline,
            execution_id: execution.id.clone(),
            application: "app".to_string(),
            stage_id: join_id.clone(),
        })
        .await
        .unwrap();
    harness.step().await;

    // nothing materialized, nothing dispatched, nothing announced
    let loaded = harness.load(&execution).await;
    let join = loaded.stage(&join_id).unwrap();
    assert_eq!(join.status, ExecutionStatus::NotStarted);
    assert!(join.tasks.is_empty());
    assert!(harness.queue.pending_messages().is_empty());
    assert!(collect_events(&mut events)
        .iter()
        .all(|e| !matches!(e, EngineEvent::StageStarted { .. })));
}

#[tokio::test]
async fn stage_enabled_false_skips_without_building_anything() {
    let harness = test_engine();
    let execution = Execution::builder(ExecutionType::Pipeline, "app")
        .stage_with(
            "1",
            "multiTask",
            vec![],
            stage_context(&[(
                context_keys::STAGE_ENABLED,
                json!({"type": "expression", "expression": "false"}),
            )]),
        )
        .build();
    harness.engine.start(&execution).await.unwrap();

    harness.step().await; // StartExecution
    harness.step().await; // StartStage

    let loaded = harness.load(&execution).await;
    assert_eq!(loaded.stages.len(), 1, "skip must produce no synthetics");
    let stage = &loaded.stages[0];
    assert_eq!(stage.status, ExecutionStatus::Skipped);
    assert!(stage.tasks.is_empty(), "skip must produce no tasks");

    let pending = harness.queue.pending_messages();
    assert!(matches!(
        &pending[..],
        [Message::CompleteStage { status: ExecutionStatus::Skipped, .. }]
    ));

    harness.drain().await;
    let finished = harness.load(&execution).await;
    assert_eq!(finished.status, ExecutionStatus::Succeeded);
    assert_eq!(finished.stages[0].status, ExecutionStatus::Skipped);
}

#[tokio::test]
async fn restart_rewinds_only_the_downstream_closure() {
    let harness = test_engine();
    let execution = Execution::builder(ExecutionType::Pipeline, "app")
        .stage("1", "stageWithSyntheticBefore")
        .stage("2", "multiTask")
        .stage_with("3", "multiTask", vec!["1", "2"], HashMap::new())
        .stage_with("4", "multiTask", vec!["3"], HashMap::new())
        .build();
    harness.engine.start(&execution).await.unwrap();
    harness.drain().await;

    let completed = harness.load(&execution).await;
    assert_eq!(completed.status, ExecutionStatus::Succeeded);
    let stage1_id = completed.stage_by_ref("1").unwrap().id.clone();
    let stage2_before = completed.stage_by_ref("2").unwrap().clone();
    assert!(
        !completed.synthetic_descendants(&stage1_id).is_empty(),
        "stage 1 should have synthetic children to remove"
    );

    harness
        .engine
        .restart_stage(ExecutionType::Pipeline, &execution.id, "app", &stage1_id)
        .await
        .unwrap();
    harness.step().await; // RestartStage only

    let rewound = harness.load(&execution).await;
    assert_eq!(rewound.status, ExecutionStatus::Running);
    for ref_id in ["1", "3", "4"] {
        let stage = rewound.stage_by_ref(ref_id).unwrap();
        assert_eq!(stage.status, ExecutionStatus::NotStarted, "stage {ref_id}");
        assert!(stage.tasks.is_empty(), "stage {ref_id} tasks dropped");
        assert!(stage.start_time.is_none() && stage.end_time.is_none());
    }
    // restart locality: stage 2 and its record are bitwise unchanged
    assert_eq!(*rewound.stage_by_ref("2").unwrap(), stage2_before);
    // stage 1's synthetics are gone
    assert!(rewound.synthetic_descendants(&stage1_id).is_empty());

    let pending = harness.queue.pending_messages();
    assert!(matches!(
        &pending[..],
        [Message::StartStage { stage_id, .. }] if *stage_id == stage1_id
    ));

    // the rewound subgraph runs back to success
    harness.drain().await;
    let finished = harness.load(&execution).await;
    assert_eq!(finished.status, ExecutionStatus::Succeeded);
    assert!(finished
        .stages
        .iter()
        .all(|s| s.status == ExecutionStatus::Succeeded));
}

#[tokio::test]
async fn restart_of_non_terminal_stage_is_a_no_op() {
    let harness = test_engine();
    let mut execution = single_stage_pipeline("multiTask");
    execution.status = ExecutionStatus::Running;
    execution.stages[0].status = ExecutionStatus::Running;
    harness.engine.store().store(&execution).await.unwrap();

    let stage_id = execution.stages[0].id.clone();
    harness
        .engine
        .restart_stage(ExecutionType::Pipeline, &execution.id, "app", &stage_id)
        .await
        .unwrap();
    harness.step().await;

    let loaded = harness.load(&execution).await;
    assert_eq!(loaded.stages[0].status, ExecutionStatus::Running);
    assert!(harness.queue.pending_messages().is_empty());
}

#[tokio::test]
async fn duplicate_start_stage_delivery_is_idempotent() {
    let harness = test_engine();
    let mut events = harness.engine.subscribe();
    let execution = single_stage_pipeline("multiTask");
    let stage_id = execution.stages[0].id.clone();
    harness.engine.start(&execution).await.unwrap();

    harness.step().await; // StartExecution
    harness.step().await; // StartStage

    // the same StartStage arrives again
    harness
        .engine
        .queue()
        .push(Message::StartStage {
            execution_type: ExecutionType::Pipeline,
            execution_id: execution.id.clone(),
            application: "app".to_string(),
            stage_id,
        })
        .await
        .unwrap();
    harness.drain().await;

    let finished = harness.load(&execution).await;
    assert_eq!(finished.status, ExecutionStatus::Succeeded);
    assert_eq!(finished.stages[0].tasks.len(), 3);

    let events = collect_events(&mut events);
    let stage_starts = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::StageStarted { .. }))
        .count();
    assert_eq!(stage_starts, 1, "redelivery must not re-announce the stage");
}

#[tokio::test]
async fn terminal_task_fails_the_pipeline_by_default() {
    let harness = test_engine();
    let execution = Execution::builder(ExecutionType::Pipeline, "app")
        .stage("1", "failingStage")
        .stage_with("2", "multiTask", vec!["1"], HashMap::new())
        .build();
    harness.engine.start(&execution).await.unwrap();
    harness.drain().await;

    let finished = harness.load(&execution).await;
    assert_eq!(finished.status, ExecutionStatus::Terminal);
    assert_eq!(finished.stage_by_ref("1").unwrap().status, ExecutionStatus::Terminal);
    // downstream never started
    assert_eq!(finished.stage_by_ref("2").unwrap().status, ExecutionStatus::NotStarted);
}

#[tokio::test]
async fn continue_pipeline_downgrades_failure_and_keeps_going() {
    let harness = test_engine();
    let execution = Execution::builder(ExecutionType::Pipeline, "app")
        .stage_with(
            "1",
            "failingStage",
            vec![],
            stage_context(&[(context_keys::CONTINUE_PIPELINE, json!(true))]),
        )
        .stage_with("2", "multiTask", vec!["1"], HashMap::new())
        .build();
    harness.engine.start(&execution).await.unwrap();
    harness.drain().await;

    let finished = harness.load(&execution).await;
    assert_eq!(finished.status, ExecutionStatus::Succeeded);
    assert_eq!(
        finished.stage_by_ref("1").unwrap().status,
        ExecutionStatus::FailedContinue
    );
    assert_eq!(finished.stage_by_ref("2").unwrap().status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn fail_pipeline_false_stops_the_branch_quietly() {
    let harness = test_engine();
    let execution = Execution::builder(ExecutionType::Pipeline, "app")
        .stage_with(
            "1",
            "failingStage",
            vec![],
            stage_context(&[(context_keys::FAIL_PIPELINE, json!(false))]),
        )
        .stage_with("2", "multiTask", vec!["1"], HashMap::new())
        .build();
    harness.engine.start(&execution).await.unwrap();
    harness.drain().await;

    let finished = harness.load(&execution).await;
    assert_eq!(finished.status, ExecutionStatus::Succeeded);
    assert_eq!(finished.stage_by_ref("1").unwrap().status, ExecutionStatus::Stopped);
    assert_eq!(finished.stage_by_ref("2").unwrap().status, ExecutionStatus::NotStarted);
}

#[tokio::test]
async fn orchestration_runs_stages_sequentially() {
    let harness = test_engine();
    let mut events = harness.engine.subscribe();
    let execution = Execution::builder(ExecutionType::Orchestration, "app")
        .stage("1", "singleTask")
        .stage("2", "singleTask")
        .build();
    harness.engine.start(&execution).await.unwrap();
    harness.drain().await;

    let finished = harness.load(&execution).await;
    assert_eq!(finished.status, ExecutionStatus::Succeeded);
    assert!(finished
        .stages
        .iter()
        .all(|s| s.status == ExecutionStatus::Succeeded));

    // stage 1 completed before stage 2 started
    let events = collect_events(&mut events);
    let stage1_id = finished.stage_by_ref("1").unwrap().id.clone();
    let stage2_id = finished.stage_by_ref("2").unwrap().id.clone();
    let complete1 = events
        .iter()
        .position(|e| matches!(e, EngineEvent::StageComplete { stage_id, .. } if *stage_id == stage1_id))
        .unwrap();
    let start2 = events
        .iter()
        .position(|e| matches!(e, EngineEvent::StageStarted { stage_id, .. } if *stage_id == stage2_id))
        .unwrap();
    assert!(complete1 < start2);
}

#[tokio::test]
async fn after_stages_run_between_tasks_and_completion() {
    let harness = test_engine();
    let mut events = harness.engine.subscribe();
    let execution = single_stage_pipeline("stageWithSyntheticAfter");
    let parent_id = execution.stages[0].id.clone();
    harness.engine.start(&execution).await.unwrap();
    harness.drain().await;

    let finished = harness.load(&execution).await;
    assert_eq!(finished.status, ExecutionStatus::Succeeded);
    assert_eq!(finished.stages.len(), 2);
    let after = finished
        .synthetic_children(&parent_id, SyntheticStageOwner::StageAfter)
        .into_iter()
        .next()
        .unwrap();
    assert_eq!(after.status, ExecutionStatus::Succeeded);

    // the after-child finishes before its parent settles
    let events = collect_events(&mut events);
    let after_complete = events
        .iter()
        .position(|e| matches!(e, EngineEvent::StageComplete { stage_id, .. } if *stage_id == after.id))
        .unwrap();
    let parent_complete = events
        .iter()
        .position(|e| matches!(e, EngineEvent::StageComplete { stage_id, .. } if *stage_id == parent_id))
        .unwrap();
    assert!(after_complete < parent_complete);
}

#[tokio::test]
async fn loop_markers_reiterate_until_continuation_clears() {
    let harness = test_engine();
    let execution = single_stage_pipeline("loopingStage");
    harness.engine.start(&execution).await.unwrap();
    harness.drain().await;

    let finished = harness.load(&execution).await;
    assert_eq!(finished.status, ExecutionStatus::Succeeded);
    let stage = &finished.stages[0];
    assert_eq!(stage.context.get("iterations"), Some(&json!(3)));
    // the consumed flag never leaks into the settled context
    assert!(stage.context.get(context_keys::LOOP_CONTINUE).is_none());
}

#[tokio::test]
async fn cancellation_is_observed_by_polling_tasks() {
    let harness = test_engine();
    let execution = single_stage_pipeline("waitingStage");
    harness.engine.start(&execution).await.unwrap();
    harness.drain().await;

    // the waiting task is parked on a delayed RunTask
    let running = harness.load(&execution).await;
    assert_eq!(running.stages[0].status, ExecutionStatus::Running);

    harness
        .engine
        .cancel(
            ExecutionType::Pipeline,
            &execution.id,
            "app",
            Some("tester".to_string()),
            Some("no longer needed".to_string()),
        )
        .await
        .unwrap();
    harness.drain().await;
    harness.clock.advance(Duration::from_millis(100));
    harness.drain().await;

    let finished = harness.load(&execution).await;
    assert_eq!(finished.status, ExecutionStatus::Canceled);
    assert!(finished.canceled);
    assert_eq!(finished.canceled_by.as_deref(), Some("tester"));
    assert_eq!(finished.stages[0].status, ExecutionStatus::Canceled);
    assert!(finished.end_time.is_some());
}

#[tokio::test]
async fn paused_stage_defers_task_dispatch_until_resumed() {
    let harness = test_engine();
    let execution = single_stage_pipeline("multiTask");
    let stage_id = execution.stages[0].id.clone();
    harness.engine.start(&execution).await.unwrap();

    harness.step().await; // StartExecution

    // the pause lands between StartStage and its first StartTask
    harness
        .engine
        .queue()
        .push(Message::PauseStage {
            execution_type: ExecutionType::Pipeline,
            execution_id: execution.id.clone(),
            application: "app".to_string(),
            stage_id: stage_id.clone(),
        })
        .await
        .unwrap();
    harness.drain().await;

    // dispatch parked on a delayed recheck, no task ran
    let paused = harness.load(&execution).await;
    assert!(paused.stages[0].paused);
    assert!(paused.stages[0]
        .tasks
        .iter()
        .all(|t| t.status == ExecutionStatus::NotStarted));

    harness
        .engine
        .queue()
        .push(Message::ResumeStage {
            execution_type: ExecutionType::Pipeline,
            execution_id: execution.id.clone(),
            application: "app".to_string(),
            stage_id,
        })
        .await
        .unwrap();
    harness.drain().await;
    harness.clock.advance(Duration::from_secs(11));
    harness.drain().await;

    let finished = harness.load(&execution).await;
    assert!(!finished.stages[0].paused);
    assert_eq!(finished.status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn pause_and_resume_whole_execution() {
    let harness = test_engine();
    let execution = single_stage_pipeline("multiTask");
    harness.engine.start(&execution).await.unwrap();
    harness.step().await; // StartExecution
    harness.step().await; // StartStage

    harness
        .engine
        .pause(ExecutionType::Pipeline, &execution.id, "app")
        .await
        .unwrap();
    harness.drain().await;
    let paused = harness.load(&execution).await;
    assert_eq!(paused.status, ExecutionStatus::Paused);

    harness
        .engine
        .resume(ExecutionType::Pipeline, &execution.id, "app")
        .await
        .unwrap();
    harness.drain().await;
    harness.clock.advance(Duration::from_secs(11));
    harness.drain().await;

    let finished = harness.load(&execution).await;
    assert_eq!(finished.status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn task_timeout_converts_to_terminal() {
    let harness = test_engine();
    let execution = single_stage_pipeline("timedStage");
    harness.engine.start(&execution).await.unwrap();
    harness.drain().await;

    // still polling within budget
    let polling = harness.load(&execution).await;
    assert_eq!(polling.stages[0].status, ExecutionStatus::Running);

    harness.clock.advance(Duration::from_secs(3));
    harness.drain().await;

    let finished = harness.load(&execution).await;
    assert_eq!(finished.status, ExecutionStatus::Terminal);
    let stage = &finished.stages[0];
    assert_eq!(stage.status, ExecutionStatus::Terminal);
    let error = stage.context.get(context_keys::ERROR).unwrap();
    assert!(error.as_str().unwrap().contains("timed out"));
}

#[tokio::test]
async fn execution_window_holds_the_stage_until_open() {
    let harness = test_engine();
    // clock starts at 08:00; the window opens at 10:00
    let execution = Execution::builder(ExecutionType::Pipeline, "app")
        .stage_with(
            "1",
            "multiTask",
            vec![],
            stage_context(&[
                (context_keys::RESTRICT_EXECUTION_WINDOW, json!(true)),
                (
                    context_keys::EXECUTION_WINDOW,
                    json!({"whitelist": [{"startHour": 10, "endHour": 12}]}),
                ),
            ]),
        )
        .build();
    let parent_id = execution.stages[0].id.clone();
    harness.engine.start(&execution).await.unwrap();
    harness.drain().await;

    let held = harness.load(&execution).await;
    let window = held
        .synthetic_children(&parent_id, SyntheticStageOwner::StageBefore)
        .into_iter()
        .next()
        .expect("window synthetic prepended");
    assert_eq!(window.stage_type, "restrictExecutionDuringTimeWindow");
    assert_eq!(window.status, ExecutionStatus::Running);
    assert_eq!(held.stage(&parent_id).unwrap().status, ExecutionStatus::NotStarted);

    // cross into the window and let the delayed poll fire
    harness.clock.advance(Duration::from_secs(3 * 3600));
    harness.drain().await;

    let finished = harness.load(&execution).await;
    assert_eq!(finished.status, ExecutionStatus::Succeeded);
    assert_eq!(finished.stage(&parent_id).unwrap().status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn unknown_task_class_fails_the_stage() {
    let harness = test_engine();
    let execution = single_stage_pipeline("unknownTaskStage");
    harness.engine.start(&execution).await.unwrap();
    harness.drain().await;

    let finished = harness.load(&execution).await;
    assert_eq!(finished.status, ExecutionStatus::Terminal);
    let stage = &finished.stages[0];
    assert_eq!(stage.status, ExecutionStatus::Terminal);
    assert!(stage
        .context
        .get(context_keys::ERROR)
        .and_then(|v| v.as_str())
        .unwrap()
        .contains("missingTask"));
}

#[tokio::test]
async fn missing_execution_routes_to_invalid_execution_id() {
    let harness = test_engine();
    harness
        .engine
        .queue()
        .push(Message::StartStage {
            execution_type: ExecutionType::Pipeline,
            execution_id: "no-such-execution".to_string(),
            application: "app".to_string(),
            stage_id: "s-1".to_string(),
        })
        .await
        .unwrap();

    harness.step().await;
    let pending = harness.queue.pending_messages();
    assert!(matches!(
        &pending[..],
        [Message::InvalidExecutionId { execution_id, .. }] if execution_id == "no-such-execution"
    ));
    // the invalid-id token itself is terminal
    harness.drain().await;
    assert!(harness.queue.pending_messages().is_empty());
}

#[tokio::test]
async fn missing_stage_routes_to_invalid_stage_id() {
    let harness = test_engine();
    let mut execution = single_stage_pipeline("multiTask");
    execution.status = ExecutionStatus::Running;
    harness.engine.store().store(&execution).await.unwrap();

    harness
        .engine
        .queue()
        .push(Message::StartStage {
            execution_type: ExecutionType::Pipeline,
            execution_id: execution.id.clone(),
            application: "app".to_string(),
            stage_id: "no-such-stage".to_string(),
        })
        .await
        .unwrap();

    harness.step().await;
    let pending = harness.queue.pending_messages();
    assert!(matches!(
        &pending[..],
        [Message::InvalidStageId { stage_id, .. }] if stage_id == "no-such-stage"
    ));
}

#[tokio::test]
async fn expression_substitution_flows_into_stage_context() {
    let harness = test_engine();
    let execution = Execution::builder(ExecutionType::Pipeline, "app")
        .context("environment", json!("staging"))
        .stage_with(
            "1",
            "multiTask",
            vec![],
            stage_context(&[("clusterName", json!("app-${environment}"))]),
        )
        .build();
    harness.engine.start(&execution).await.unwrap();
    harness.drain().await;

    let finished = harness.load(&execution).await;
    assert_eq!(finished.status, ExecutionStatus::Succeeded);
    assert_eq!(
        finished.stages[0].context.get("clusterName"),
        Some(&json!("app-staging"))
    );
}

#[tokio::test]
async fn worker_pool_drives_execution_to_completion() {
    let harness = test_engine();
    let mut events = harness.engine.subscribe();
    let execution = single_stage_pipeline("multiTask");
    harness.engine.start(&execution).await.unwrap();

    let pool = harness.engine.spawn_workers();
    assert_eq!(pool.size(), 4);

    let completion = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let published = events.recv().await.expect("event channel closed");
            if let EngineEvent::ExecutionComplete { status, .. } = published.event {
                return status;
            }
        }
    })
    .await
    .expect("workers did not finish the execution in time");
    assert_eq!(completion, ExecutionStatus::Succeeded);
    pool.shutdown().await;

    let finished = harness.load(&execution).await;
    assert_eq!(finished.status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn terminal_execution_leaves_no_stage_running() {
    let harness = test_engine();
    // two parallel roots: one fails the pipeline while the other polls
    let execution = Execution::builder(ExecutionType::Pipeline, "app")
        .stage("1", "waitingStage")
        .stage("2", "failingStage")
        .build();
    harness.engine.start(&execution).await.unwrap();
    harness.drain().await;

    let finished = harness.load(&execution).await;
    assert_eq!(finished.status, ExecutionStatus::Terminal);
    for stage in &finished.stages {
        assert!(
            stage.status.is_complete() || stage.status == ExecutionStatus::NotStarted,
            "stage {} left in {}",
            stage.ref_id,
            stage.status
        );
    }
}
