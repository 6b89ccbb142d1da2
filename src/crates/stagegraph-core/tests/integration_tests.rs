//! Integration tests for complete workflows
//!
//! These tests drive the engine end to end over real checkpoint stores:
//! linear graphs, bounded loops, crash/resume, contract violations,
//! cancellation and concurrent workflows.

use async_trait::async_trait;
use parking_lot::Mutex;
use stagegraph_checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
use stagegraph_core::{
    BroadcastRecorder, CancelHandle, Decision, DynamicFields, DynamicPatch, Engine, EngineError,
    EventRecorder, FnStage, LoopSpec, Phase, RecordError, RetentionPolicy, Route, Scheduler,
    StageResult, Workflow, WorkflowBuilder, WorkflowEvent, WorkflowSnapshot,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Calls = Arc<Mutex<Vec<String>>>;

fn recording_stage(
    id: &'static str,
    status: &'static str,
    calls: Calls,
) -> FnStage<DynamicFields> {
    FnStage::new(id, &[status], move |_| {
        let calls = calls.clone();
        async move {
            calls.lock().push(id.to_string());
            Ok(StageResult::new(status).log(format!("[{}] ran", id)))
        }
    })
}

fn count(calls: &Calls, id: &str) -> usize {
    calls.lock().iter().filter(|c| c.as_str() == id).count()
}

/// Cancels a run once `stage` has completed `after` times
struct CancelAfter {
    stage: &'static str,
    after: usize,
    seen: AtomicUsize,
    handle: CancelHandle,
}

#[async_trait]
impl EventRecorder for CancelAfter {
    async fn record(&self, event: &WorkflowEvent) -> Result<(), RecordError> {
        if let WorkflowEvent::StageCompleted { stage, .. } = event {
            if stage == self.stage && self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
                self.handle.cancel();
            }
        }
        Ok(())
    }
}

struct AlwaysFails;

#[async_trait]
impl EventRecorder for AlwaysFails {
    async fn record(&self, _event: &WorkflowEvent) -> Result<(), RecordError> {
        Err(RecordError("statistics database offline".into()))
    }
}

/// Linear graph a -> b -> c -> d, ending with status "done"
fn linear(calls: Calls) -> Workflow<DynamicFields> {
    WorkflowBuilder::new("linear")
        .stage(recording_stage("a", "a_ok", calls.clone()))
        .stage(recording_stage("b", "b_ok", calls.clone()))
        .stage(recording_stage("c", "c_ok", calls.clone()))
        .stage(recording_stage("d", "done", calls))
        .entry("a")
        .edge("a", "a_ok", Decision::to("b"))
        .edge("b", "b_ok", Decision::to("c"))
        .edge("c", "c_ok", Decision::to("d"))
        .edge("d", "done", Decision::terminal())
        .build()
        .unwrap()
}

/// Stage a increments `n`; stage b loops back to a until `n` reaches `target`
fn counting_loop(target: i64, ceiling: u32, calls: Calls) -> Workflow<DynamicFields> {
    let a_calls = calls.clone();
    WorkflowBuilder::new("counting")
        .stage(FnStage::new("a", &["incremented"], move |snap: WorkflowSnapshot<DynamicFields>| {
            let calls = a_calls.clone();
            async move {
                calls.lock().push("a".into());
                let n = snap.fields.get_i64("n").unwrap_or(0) + 1;
                Ok(StageResult::new("incremented")
                    .with_patch(DynamicPatch::new().set("n", n))
                    .log(format!("[a] n={}", n)))
            }
        }))
        .stage(FnStage::new("b", &["enough", "more"], move |snap: WorkflowSnapshot<DynamicFields>| {
            let calls = calls.clone();
            async move {
                calls.lock().push("b".into());
                let status = if snap.fields.get_i64("n").unwrap_or(0) >= target {
                    "enough"
                } else {
                    "more"
                };
                Ok(StageResult::new(status))
            }
        }))
        .entry("a")
        .loop_spec(LoopSpec::new("count", ceiling, "increment until target"))
        .edge("a", "incremented", Decision::to("b"))
        .edge("b", "enough", Decision::terminal())
        .edge(
            "b",
            "more",
            Decision::looping("count", "a", Route::Terminal)
                .with_metric(|s: &WorkflowSnapshot<DynamicFields>| {
                    format!("n={}", s.fields.get_i64("n").unwrap_or(0))
                }),
        )
        .build()
        .unwrap()
}

fn memory() -> Arc<dyn CheckpointStore> {
    Arc::new(InMemoryCheckpointStore::new())
}

#[tokio::test]
async fn test_linear_graph_runs_all_stages_in_order() {
    let calls: Calls = Arc::default();
    let engine = Engine::new(linear(calls.clone()), memory());

    let snapshot = engine.run("order-1", DynamicFields::new()).await.unwrap();

    assert_eq!(*calls.lock(), vec!["a", "b", "c", "d"]);
    assert_eq!(snapshot.status, "done");
    assert_eq!(snapshot.phase, Phase::Succeeded);
    assert_eq!(snapshot.steps, 4);
    assert_eq!(
        snapshot.audit_log,
        vec!["[a] ran", "[b] ran", "[c] ran", "[d] ran"]
    );
}

#[tokio::test]
async fn test_loop_back_until_flag_set() {
    // the test double reports ok=false twice, then ok=true
    let a_runs = Arc::new(AtomicUsize::new(0));
    let runs = a_runs.clone();
    let workflow = WorkflowBuilder::<DynamicFields>::new("flagged")
        .stage(FnStage::new("a", &["produced"], move |_| {
            let runs = runs.clone();
            async move {
                let call = runs.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(StageResult::new("produced").with_patch(DynamicPatch::new().set("ok", call >= 3)))
            }
        }))
        .stage(FnStage::new("b", &["accepted", "rejected"], |snap: WorkflowSnapshot<DynamicFields>| async move {
            if snap.fields.get_bool("ok").unwrap_or(false) {
                Ok(StageResult::new("accepted"))
            } else {
                Ok(StageResult::new("rejected"))
            }
        }))
        .entry("a")
        .loop_spec(LoopSpec::new("redo_a", 2, "redo a until ok"))
        .edge("a", "produced", Decision::to("b"))
        .edge("b", "accepted", Decision::terminal())
        .edge("b", "rejected", Decision::looping("redo_a", "a", Route::Terminal))
        .build()
        .unwrap();
    let engine = Engine::new(workflow, memory());

    let snapshot = engine.run("wf", DynamicFields::new()).await.unwrap();

    assert_eq!(a_runs.load(Ordering::SeqCst), 3);
    assert_eq!(snapshot.fields.get_bool("ok"), Some(true));
    assert_eq!(snapshot.status, "accepted");
    assert_eq!(snapshot.attempts.get("redo_a"), 2);
    assert!(!snapshot
        .audit_log
        .iter()
        .any(|line| line.contains("max attempts")));
}

#[tokio::test]
async fn test_ceiling_three_loops_three_times_then_forced_forward() {
    let calls: Calls = Arc::default();
    let always = calls.clone();
    let workflow = WorkflowBuilder::<DynamicFields>::new("stubborn")
        .stage(FnStage::new("check", &["retry"], move |_| {
            let calls = always.clone();
            async move {
                calls.lock().push("check".into());
                Ok(StageResult::new("retry"))
            }
        }))
        .stage(recording_stage("finish", "done", calls.clone()))
        .entry("check")
        .loop_spec(LoopSpec::new("always", 3, "never satisfied"))
        .edge(
            "check",
            "retry",
            Decision::looping("always", "check", Route::stage("finish"))
                .with_metric(|_: &WorkflowSnapshot<DynamicFields>| "score=12".to_string()),
        )
        .edge("finish", "done", Decision::terminal())
        .build()
        .unwrap();
    let engine = Engine::new(workflow, memory());

    let snapshot = engine.run("wf", DynamicFields::new()).await.unwrap();

    assert_eq!(count(&calls, "check"), 4); // first pass plus 3 loops
    assert_eq!(count(&calls, "finish"), 1);
    assert_eq!(snapshot.attempts.get("always"), 3);
    assert_eq!(snapshot.phase, Phase::Succeeded);

    let loop_lines: Vec<_> = snapshot
        .audit_log
        .iter()
        .filter(|l| l.starts_with("[router] loop 'always'"))
        .collect();
    assert_eq!(loop_lines.len(), 3);
    assert!(snapshot.audit_log.contains(
        &"[router] max attempts reached for loop 'always' (3/3); proceeding to finish with best effort; last metric: score=12"
            .to_string()
    ));
}

#[tokio::test]
async fn test_crash_after_first_checkpoint_then_resume() {
    let reference = Engine::new(linear(Arc::default()), memory())
        .run("order-9", DynamicFields::new())
        .await
        .unwrap();

    let store = memory();
    let first_calls: Calls = Arc::default();
    let handle = CancelHandle::new();
    let crashing = Engine::new(linear(first_calls.clone()), store.clone()).with_recorder(Arc::new(
        CancelAfter {
            stage: "a",
            after: 1,
            seen: AtomicUsize::new(0),
            handle: handle.clone(),
        },
    ));
    let interrupted = crashing
        .run_with_cancel("order-9", DynamicFields::new(), &handle)
        .await;
    assert!(matches!(
        interrupted,
        Err(EngineError::Cancelled { steps: 1, .. })
    ));
    assert_eq!(*first_calls.lock(), vec!["a"]);
    drop(crashing);

    // fresh engine, nothing kept in memory but the store
    let calls: Calls = Arc::default();
    let engine = Engine::new(linear(calls.clone()), store);
    let resumed = engine.resume("order-9").await.unwrap();

    assert_eq!(*calls.lock(), vec!["b", "c", "d"]);
    assert_eq!(count(&calls, "b"), 1);
    assert_eq!(resumed, reference);
}

#[tokio::test]
async fn test_resume_mid_loop_matches_uninterrupted_run() {
    let reference = Engine::new(counting_loop(4, 10, Arc::default()), memory())
        .run("wf", DynamicFields::new())
        .await
        .unwrap();
    assert_eq!(reference.fields.get_i64("n"), Some(4));

    for crash_after in 1..=3 {
        let store = memory();
        let handle = CancelHandle::new();
        let crashing = Engine::new(counting_loop(4, 10, Arc::default()), store.clone())
            .with_recorder(Arc::new(CancelAfter {
                stage: "b",
                after: crash_after,
                seen: AtomicUsize::new(0),
                handle: handle.clone(),
            }));
        let interrupted = crashing
            .run_with_cancel("wf", DynamicFields::new(), &handle)
            .await;
        assert!(matches!(interrupted, Err(EngineError::Cancelled { .. })));

        let resumed = Engine::new(counting_loop(4, 10, Arc::default()), store)
            .resume("wf")
            .await
            .unwrap();
        assert_eq!(resumed, reference, "crash after b #{}", crash_after);
    }
}

#[tokio::test]
async fn test_run_or_resume_picks_up_checkpoint() {
    let store = memory();
    let handle = CancelHandle::new();
    let engine = Engine::new(linear(Arc::default()), store.clone()).with_recorder(Arc::new(
        CancelAfter {
            stage: "b",
            after: 1,
            seen: AtomicUsize::new(0),
            handle: handle.clone(),
        },
    ));
    let _ = engine
        .run_with_cancel("wf", DynamicFields::new(), &handle)
        .await;

    let calls: Calls = Arc::default();
    let snapshot = Engine::new(linear(calls.clone()), store)
        .run_or_resume("wf", DynamicFields::new())
        .await
        .unwrap();
    assert_eq!(*calls.lock(), vec!["c", "d"]);
    assert_eq!(snapshot.steps, 4);
}

#[tokio::test]
async fn test_run_replaces_existing_checkpoint() {
    let store = memory();
    let calls: Calls = Arc::default();
    let engine = Engine::new(linear(calls.clone()), store);
    engine.run("wf", DynamicFields::new()).await.unwrap();
    let again = engine.run("wf", DynamicFields::new()).await.unwrap();

    assert_eq!(calls.lock().len(), 8);
    assert_eq!(again.steps, 4);
    assert_eq!(again.audit_log.len(), 4);
}

#[tokio::test]
async fn test_undeclared_status_is_contract_violation() {
    let workflow = WorkflowBuilder::<DynamicFields>::new("liar")
        .stage(FnStage::new("a", &["ok"], |_| async {
            Ok(StageResult::new("surprise")
                .with_patch(DynamicPatch::new().set("leaked", true))
                .log("[a] tried an unlisted outcome"))
        }))
        .entry("a")
        .edge("a", "ok", Decision::terminal())
        .build()
        .unwrap();
    let store = memory();
    let engine = Engine::new(workflow, store.clone());

    let snapshot = engine.run("wf", DynamicFields::new()).await.unwrap();
    assert_eq!(snapshot.phase, Phase::Failed);
    assert_eq!(
        snapshot.error.as_deref(),
        Some("contract violation: stage 'a' returned undeclared status 'surprise'")
    );
    // the stage's audit lines survive, its patch does not
    assert_eq!(
        snapshot.audit_log,
        vec![
            "[a] tried an unlisted outcome".to_string(),
            "[engine] contract violation: stage 'a' returned undeclared status 'surprise'".to_string(),
        ]
    );
    assert!(snapshot.fields.get("leaked").is_none());
    // failure is checkpointed
    let stored = engine.inspect("wf").await.unwrap().unwrap();
    assert_eq!(stored.phase, Phase::Failed);
    assert_eq!(stored.audit_log, snapshot.audit_log);
}

#[tokio::test]
async fn test_computed_route_to_unknown_stage_fails() {
    let workflow = WorkflowBuilder::<DynamicFields>::new("lost")
        .stage(FnStage::new("a", &["ok"], |_| async { Ok(StageResult::new("ok")) }))
        .entry("a")
        .edge(
            "a",
            "ok",
            Decision::branch(|_: &WorkflowSnapshot<DynamicFields>| Route::stage("nowhere")),
        )
        .build()
        .unwrap();
    let engine = Engine::new(workflow, memory());

    let snapshot = engine.run("wf", DynamicFields::new()).await.unwrap();
    assert!(snapshot.phase.is_failed());
    assert_eq!(
        snapshot.error.as_deref(),
        Some("contract violation: route targets unknown stage 'nowhere'")
    );
}

#[tokio::test]
async fn test_panicking_stage_does_not_crash_caller() {
    let workflow = WorkflowBuilder::<DynamicFields>::new("panicky")
        .stage(FnStage::new("a", &["ok"], |_| async { Ok(StageResult::new("ok")) }))
        .stage(FnStage::new("b", &["ok"], |snap| async move {
            if snap.steps > 0 {
                panic!("collaborator returned garbage");
            }
            Ok(StageResult::new("ok"))
        }))
        .entry("a")
        .edge("a", "ok", Decision::to("b"))
        .edge("b", "ok", Decision::terminal())
        .build()
        .unwrap();
    let engine = Engine::new(workflow, memory());

    let snapshot = engine.run("wf", DynamicFields::new()).await.unwrap();
    assert_eq!(snapshot.phase, Phase::Failed);
    assert_eq!(snapshot.steps, 1);
    assert_eq!(
        snapshot.error.as_deref(),
        Some("stage 'b' panicked: collaborator returned garbage")
    );
    assert_eq!(
        snapshot.audit_log.last().map(String::as_str),
        Some("[engine] stage 'b' panicked: collaborator returned garbage")
    );
}

#[tokio::test]
async fn test_global_step_ceiling_stops_unintended_cycle() {
    let workflow = WorkflowBuilder::<DynamicFields>::new("cycle")
        .stage(FnStage::new("ping", &["ponged"], |_| async { Ok(StageResult::new("ponged")) }))
        .stage(FnStage::new("pong", &["pinged"], |_| async { Ok(StageResult::new("pinged")) }))
        .entry("ping")
        .edge("ping", "ponged", Decision::to("pong"))
        .edge("pong", "pinged", Decision::to("ping"))
        .build()
        .unwrap();
    let engine = Engine::new(workflow, memory()).with_max_steps(10);

    let snapshot = engine.run("wf", DynamicFields::new()).await.unwrap();
    assert_eq!(snapshot.steps, 10);
    assert_eq!(snapshot.phase, Phase::Failed);
    assert!(snapshot
        .error
        .as_deref()
        .is_some_and(|e| e.starts_with("step ceiling of 10 stage executions reached")));
}

#[tokio::test]
async fn test_exhausted_retry_with_fail_route() {
    let workflow = WorkflowBuilder::<DynamicFields>::new("flaky")
        .stage(FnStage::new("fetch", &["unavailable"], |_| async {
            Ok(StageResult::new("unavailable"))
        }))
        .entry("fetch")
        .loop_spec(LoopSpec::new("fetch_retry", 2, "retry fetch"))
        .edge(
            "fetch",
            "unavailable",
            Decision::looping("fetch_retry", "fetch", Route::fail("fetch unavailable after retries")),
        )
        .build()
        .unwrap();
    let engine = Engine::new(workflow, memory());

    let snapshot = engine.run("wf", DynamicFields::new()).await.unwrap();
    assert_eq!(snapshot.steps, 3);
    assert_eq!(snapshot.phase, Phase::Failed);
    assert_eq!(
        snapshot.error.as_deref(),
        Some("fetch unavailable after retries")
    );
}

#[tokio::test]
async fn test_cancel_mid_stage_discards_result() {
    let calls: Calls = Arc::default();
    let slow_calls = calls.clone();
    let make = move |calls: Calls| {
        WorkflowBuilder::<DynamicFields>::new("slow")
            .stage(recording_stage("a", "a_ok", calls.clone()))
            .stage(FnStage::new("slow", &["done"], move |_| {
                let calls = calls.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    calls.lock().push("slow".into());
                    Ok(StageResult::new("done").with_patch(DynamicPatch::new().set("slow", true)))
                }
            }))
            .entry("a")
            .edge("a", "a_ok", Decision::to("slow"))
            .edge("slow", "done", Decision::terminal())
            .build()
            .unwrap()
    };

    let store = memory();
    let scheduler = Scheduler::new(Arc::new(Engine::new(make(slow_calls), store.clone())), 2);
    let task = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run("wf", DynamicFields::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(scheduler.cancel("wf"));

    let outcome = task.await.unwrap();
    assert!(matches!(outcome, Err(EngineError::Cancelled { steps: 1, .. })));
    // the slow stage finished but its result was not merged
    assert_eq!(*calls.lock(), vec!["a", "slow"]);
    let stored = scheduler.engine().inspect("wf").await.unwrap().unwrap();
    assert_eq!(stored.steps, 1);
    assert!(!stored.fields.contains("slow"));

    let resumed = Engine::new(make(Arc::default()), store)
        .resume("wf")
        .await
        .unwrap();
    assert_eq!(resumed.fields.get_bool("slow"), Some(true));
    assert_eq!(resumed.phase, Phase::Succeeded);
}

#[tokio::test]
async fn test_concurrent_workflows_on_file_store_are_isolated() {
    let dir = tempfile::TempDir::new().unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::open(dir.path()).await.unwrap());
    let engine = Arc::new(Engine::new(counting_loop(5, 10, Arc::default()), store.clone()));
    let scheduler = Scheduler::new(engine, 2);

    let jobs = vec![
        ("left".to_string(), DynamicFields::new().with("side", "left")),
        ("right".to_string(), DynamicFields::new().with("side", "right")),
    ];
    let results = scheduler.run_batch(jobs).await;

    for (id, result) in &results {
        let snapshot = result.as_ref().unwrap();
        assert_eq!(&snapshot.workflow_id, id);
        assert_eq!(snapshot.fields.get_str("side"), Some(id.as_str()));
        assert_eq!(snapshot.fields.get_i64("n"), Some(5));
    }
    assert_eq!(store.list().await.unwrap(), vec!["left", "right"]);
    let left = store.load("left").await.unwrap().unwrap();
    assert_eq!(left.workflow_id, "left");
    assert_eq!(left.state["fields"]["side"], "left");
}

#[tokio::test]
async fn test_every_audit_line_reaches_recorder() {
    let recorder = BroadcastRecorder::new(256);
    let mut events = recorder.subscribe();
    let engine = Engine::new(counting_loop(2, 5, Arc::default()), memory())
        .with_recorder(Arc::new(recorder));

    let snapshot = engine.run("wf", DynamicFields::new()).await.unwrap();

    let mut forwarded = Vec::new();
    let mut finished = None;
    while let Ok(event) = events.try_recv() {
        match event {
            WorkflowEvent::AuditAppended { line, .. } => forwarded.push(line),
            WorkflowEvent::WorkflowFinished { phase, .. } => finished = Some(phase),
            _ => {}
        }
    }
    assert_eq!(forwarded, snapshot.audit_log);
    assert_eq!(finished, Some(Phase::Succeeded));
}

#[tokio::test]
async fn test_resume_forwards_only_new_audit_lines() {
    let store = memory();
    let handle = CancelHandle::new();
    let interrupted = Engine::new(counting_loop(3, 5, Arc::default()), store.clone())
        .with_recorder(Arc::new(CancelAfter {
            stage: "b",
            after: 2,
            seen: AtomicUsize::new(0),
            handle: handle.clone(),
        }))
        .run_with_cancel("wf", DynamicFields::new(), &handle)
        .await;
    assert!(matches!(interrupted, Err(EngineError::Cancelled { .. })));

    let recorder = BroadcastRecorder::new(256);
    let mut events = recorder.subscribe();
    let engine = Engine::new(counting_loop(3, 5, Arc::default()), store)
        .with_recorder(Arc::new(recorder));
    let checkpointed = engine.inspect("wf").await.unwrap().unwrap();
    assert!(checkpointed
        .audit_log
        .iter()
        .any(|line| line.starts_with("[router] loop 'count'")));

    let resumed = engine.resume("wf").await.unwrap();

    let mut forwarded = Vec::new();
    let mut loop_backs = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            WorkflowEvent::AuditAppended { line, .. } => forwarded.push(line),
            WorkflowEvent::LoopBack { .. } => loop_backs += 1,
            _ => {}
        }
    }
    assert_eq!(forwarded, resumed.audit_log[checkpointed.audit_log.len()..].to_vec());
    // loop backs recorded in the checkpoint are not reported again
    assert_eq!(loop_backs, 1);
    assert_eq!(resumed.fields.get_i64("n"), Some(3));
}

#[tokio::test]
async fn test_recorder_failure_does_not_fail_workflow() {
    let engine = Engine::new(linear(Arc::default()), memory()).with_recorder(Arc::new(AlwaysFails));
    let snapshot = engine.run("wf", DynamicFields::new()).await.unwrap();
    assert_eq!(snapshot.phase, Phase::Succeeded);
}

#[tokio::test]
async fn test_retention_policies() {
    let store = memory();
    let engine = Engine::new(linear(Arc::default()), store.clone())
        .with_retention(RetentionPolicy::ClearOnTerminal);
    engine.run("wf", DynamicFields::new()).await.unwrap();
    assert!(!store.exists("wf").await.unwrap());

    let failing = WorkflowBuilder::<DynamicFields>::new("failing")
        .stage(FnStage::new("a", &["failed"], |_| async {
            Ok(StageResult::new("failed").with_error("requirements unreadable"))
        }))
        .entry("a")
        .edge("a", "failed", Decision::terminal())
        .build()
        .unwrap();
    let engine = Engine::new(failing, store.clone()).with_retention(RetentionPolicy::ClearOnSuccess);
    let snapshot = engine.run("bad", DynamicFields::new()).await.unwrap();
    assert_eq!(snapshot.phase, Phase::Failed);
    assert!(store.exists("bad").await.unwrap());
}
