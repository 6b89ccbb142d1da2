//! The workflow engine
//!
//! [`Engine`] drives one workflow instance through its graph:
//!
//! ```text
//!  ┌────────────┐   ┌───────────────┐   ┌─────────┐   ┌────────────┐
//!  │ route from │──►│ execute stage │──►│  merge  │──►│ checkpoint │──┐
//!  │  snapshot  │   │ (timeout,     │   │ result  │   │            │  │
//!  └────────────┘   │  catch panic) │   └─────────┘   └────────────┘  │
//!        ▲          └───────────────┘                                 │
//!        └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The current stage is always derived from the snapshot through the router, so a
//! fresh run and a resumed run follow the exact same path. Loop counters are
//! incremented when a back edge is taken and become durable with the next
//! checkpoint; a crash in between re-derives the same decision on resume.
//!
//! # Failure semantics
//!
//! A stage that returns `Err`, panics, overruns the stage timeout or returns a
//! status it did not declare ends the workflow in [`Phase::Failed`] with a
//! diagnostic `error`. So do an unmapped status, a failure route and the global
//! step ceiling. The failed snapshot is checkpointed and returned as `Ok`;
//! `Err` is reserved for storage and schema problems, cancellation and
//! concurrent use.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use stagegraph_checkpoint::InMemoryCheckpointStore;
//! use stagegraph_core::{Decision, DynamicFields, Engine, FnStage, StageResult, WorkflowBuilder};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let workflow = WorkflowBuilder::<DynamicFields>::new("hello")
//!     .stage(FnStage::new("greet", &["done"], |_| async { Ok(StageResult::new("done")) }))
//!     .entry("greet")
//!     .edge("greet", "done", Decision::terminal())
//!     .build()?;
//!
//! let engine = Engine::new(workflow, Arc::new(InMemoryCheckpointStore::new()));
//! let snapshot = engine.run("wf-1", DynamicFields::new()).await?;
//! assert_eq!(snapshot.status, "done");
//! # Ok(())
//! # }
//! ```

use futures::FutureExt;
use serde_json::Value;
use stagegraph_checkpoint::{
    Checkpoint, CheckpointError, CheckpointMetadata, CheckpointSource, CheckpointStore,
};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cancel::CancelHandle;
use crate::config::{EngineConfig, RetentionPolicy};
use crate::error::{EngineError, Result};
use crate::events::{EventRecorder, NoopRecorder, WorkflowEvent};
use crate::fields::FieldSet;
use crate::router::{Route, Transition};
use crate::snapshot::{Phase, WorkflowSnapshot};
use crate::stage::{Stage, StageId, StageResult};
use crate::workflow::Workflow;

/// Smallest global step ceiling; raised to the workflow's step budget when that is larger
pub const DEFAULT_MAX_STEPS: u64 = 200;

/// Drives workflows of one graph over one checkpoint store
pub struct Engine<F: FieldSet> {
    workflow: Workflow<F>,
    store: Arc<dyn CheckpointStore>,
    recorder: Arc<dyn EventRecorder>,
    max_steps: u64,
    stage_timeout: Option<Duration>,
    retention: RetentionPolicy,
}

impl<F: FieldSet> fmt::Debug for Engine<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("workflow", &self.workflow.name())
            .field("max_steps", &self.max_steps)
            .field("stage_timeout", &self.stage_timeout)
            .field("retention", &self.retention)
            .finish()
    }
}

impl<F: FieldSet> Engine<F> {
    /// Engine with default limits and no event recorder
    pub fn new(workflow: Workflow<F>, store: Arc<dyn CheckpointStore>) -> Self {
        let max_steps = DEFAULT_MAX_STEPS.max(workflow.step_budget());
        Self {
            workflow,
            store,
            recorder: Arc::new(NoopRecorder),
            max_steps,
            stage_timeout: None,
            retention: RetentionPolicy::Keep,
        }
    }

    /// Apply `[engine]` configuration: limits, retention and loop ceilings
    ///
    /// An explicit `max_steps` below the step budget of the configured loop
    /// ceilings is rejected; unset, the ceiling follows the budget.
    pub fn with_config(mut self, config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        self.workflow = self.workflow.with_loop_ceilings(&config.loops)?;
        let budget = self.workflow.step_budget();
        self.max_steps = match config.max_steps {
            Some(max_steps) if max_steps < budget => {
                return Err(EngineError::Config(format!(
                    "engine.max_steps = {} is below the {} stage executions the loop ceilings of workflow '{}' allow",
                    max_steps,
                    budget,
                    self.workflow.name()
                )))
            }
            Some(max_steps) => max_steps,
            None => DEFAULT_MAX_STEPS.max(budget),
        };
        self.stage_timeout = config.stage_timeout();
        self.retention = config.retention;
        Ok(self)
    }

    /// Set the event recorder
    pub fn with_recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Set the global step ceiling without checking it against the step budget
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Set (or disable) the per-stage backstop timeout
    pub fn with_stage_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Set the terminal checkpoint retention policy
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Workflow definition
    pub fn workflow(&self) -> &Workflow<F> {
        &self.workflow
    }

    /// Checkpoint store
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Global step ceiling
    pub fn max_steps(&self) -> u64 {
        self.max_steps
    }

    /// Start a fresh run, replacing any checkpoint of `workflow_id`
    pub async fn run(&self, workflow_id: &str, initial: F) -> Result<WorkflowSnapshot<F>> {
        self.run_with_cancel(workflow_id, initial, &CancelHandle::new())
            .await
    }

    /// [`run`](Self::run) with a cancellation handle
    #[tracing::instrument(skip(self, initial, cancel), fields(workflow = %self.workflow.name()))]
    pub async fn run_with_cancel(
        &self,
        workflow_id: &str,
        initial: F,
        cancel: &CancelHandle,
    ) -> Result<WorkflowSnapshot<F>> {
        if self.store.exists(workflow_id).await? {
            tracing::warn!(workflow_id = %workflow_id, "Replacing existing checkpoint with a fresh run");
        }

        let snapshot = WorkflowSnapshot::new(workflow_id, initial);
        self.save(&snapshot, CheckpointSource::Input, None).await?;

        tracing::info!(workflow_id = %workflow_id, entry = %self.workflow.entry(), "Starting workflow");
        self.emit(WorkflowEvent::WorkflowStarted {
            workflow_id: workflow_id.to_string(),
            workflow: self.workflow.name().to_string(),
            timestamp: WorkflowEvent::now(),
        })
        .await;

        self.drive(snapshot, cancel).await
    }

    /// Continue from the latest checkpoint of `workflow_id`
    ///
    /// A terminal checkpoint is returned unchanged.
    pub async fn resume(&self, workflow_id: &str) -> Result<WorkflowSnapshot<F>> {
        self.resume_with_cancel(workflow_id, &CancelHandle::new())
            .await
    }

    /// [`resume`](Self::resume) with a cancellation handle
    #[tracing::instrument(skip(self, cancel), fields(workflow = %self.workflow.name()))]
    pub async fn resume_with_cancel(
        &self,
        workflow_id: &str,
        cancel: &CancelHandle,
    ) -> Result<WorkflowSnapshot<F>> {
        let snapshot = self
            .load(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(workflow_id.to_string()))?;
        self.continue_from(snapshot, cancel).await
    }

    /// Resume if a checkpoint exists, otherwise start fresh with `initial`
    pub async fn run_or_resume(&self, workflow_id: &str, initial: F) -> Result<WorkflowSnapshot<F>> {
        self.run_or_resume_with_cancel(workflow_id, initial, &CancelHandle::new())
            .await
    }

    /// [`run_or_resume`](Self::run_or_resume) with a cancellation handle
    pub async fn run_or_resume_with_cancel(
        &self,
        workflow_id: &str,
        initial: F,
        cancel: &CancelHandle,
    ) -> Result<WorkflowSnapshot<F>> {
        match self.load(workflow_id).await? {
            Some(snapshot) => self.continue_from(snapshot, cancel).await,
            None => self.run_with_cancel(workflow_id, initial, cancel).await,
        }
    }

    /// Latest checkpointed snapshot, if any
    pub async fn inspect(&self, workflow_id: &str) -> Result<Option<WorkflowSnapshot<F>>> {
        self.load(workflow_id).await
    }

    /// Drop the checkpoint of `workflow_id`
    pub async fn clear(&self, workflow_id: &str) -> Result<()> {
        self.store.clear(workflow_id).await?;
        tracing::debug!(workflow_id = %workflow_id, "Checkpoint cleared");
        Ok(())
    }

    async fn continue_from(
        &self,
        snapshot: WorkflowSnapshot<F>,
        cancel: &CancelHandle,
    ) -> Result<WorkflowSnapshot<F>> {
        if snapshot.is_terminal() {
            tracing::info!(
                workflow_id = %snapshot.workflow_id,
                phase = %snapshot.phase,
                "Checkpoint is terminal, nothing to resume"
            );
            return Ok(snapshot);
        }

        tracing::info!(
            workflow_id = %snapshot.workflow_id,
            steps = snapshot.steps,
            status = %snapshot.status,
            "Resuming workflow"
        );
        self.emit(WorkflowEvent::WorkflowResumed {
            workflow_id: snapshot.workflow_id.clone(),
            steps: snapshot.steps,
            status: snapshot.status.to_string(),
            timestamp: WorkflowEvent::now(),
        })
        .await;

        self.drive(snapshot, cancel).await
    }

    async fn drive(
        &self,
        mut snapshot: WorkflowSnapshot<F>,
        cancel: &CancelHandle,
    ) -> Result<WorkflowSnapshot<F>> {
        // lines already in the checkpoint were forwarded by an earlier run
        let mut forwarded = snapshot.audit_log.len();

        loop {
            let stage_id = match self.workflow.router().next(&snapshot) {
                Ok(Transition::Next(id)) => id,
                Ok(Transition::LoopBack {
                    loop_key,
                    to,
                    attempt,
                    ceiling,
                }) => {
                    tracing::debug!(
                        workflow_id = %snapshot.workflow_id,
                        loop_key = %loop_key,
                        attempt,
                        ceiling,
                        to = %to,
                        "Taking loop back edge"
                    );
                    snapshot = snapshot.with_attempt(&loop_key).with_audit(format!(
                        "[router] loop '{}' attempt {}/{}: back to {}",
                        loop_key, attempt, ceiling, to
                    ));
                    self.emit(WorkflowEvent::LoopBack {
                        workflow_id: snapshot.workflow_id.clone(),
                        loop_key,
                        attempt,
                        ceiling,
                        timestamp: WorkflowEvent::now(),
                    })
                    .await;
                    to
                }
                Ok(Transition::Demoted {
                    loop_key,
                    attempts,
                    ceiling,
                    to,
                    metric,
                }) => {
                    tracing::warn!(
                        workflow_id = %snapshot.workflow_id,
                        loop_key = %loop_key,
                        attempts,
                        ceiling,
                        "Loop ceiling reached, proceeding with best effort"
                    );
                    snapshot = snapshot.with_audit(format!(
                        "[router] max attempts reached for loop '{}' ({}/{}); proceeding to {} with best effort; last metric: {}",
                        loop_key,
                        attempts,
                        ceiling,
                        to,
                        metric.as_deref().unwrap_or("n/a")
                    ));
                    self.emit(WorkflowEvent::LoopDemoted {
                        workflow_id: snapshot.workflow_id.clone(),
                        loop_key,
                        attempts,
                        ceiling,
                        metric,
                        timestamp: WorkflowEvent::now(),
                    })
                    .await;
                    match to {
                        Route::Stage(id) => id,
                        Route::Terminal => {
                            return self.finish(snapshot.finished(), &mut forwarded).await
                        }
                        Route::Fail(reason) => {
                            return self.finish(snapshot.failed(reason), &mut forwarded).await
                        }
                    }
                }
                Ok(Transition::Terminal) => {
                    return self.finish(snapshot.finished(), &mut forwarded).await
                }
                Ok(Transition::Fail(reason)) => {
                    return self.finish(snapshot.failed(reason), &mut forwarded).await
                }
                Err(e) => {
                    let failed = snapshot.failed(format!("contract violation: {}", e));
                    return self.finish(failed, &mut forwarded).await;
                }
            };
            self.forward_audit(&snapshot, &mut forwarded).await;

            if snapshot.steps >= self.max_steps {
                let failed = snapshot.failed(format!(
                    "step ceiling of {} stage executions reached before stage '{}'",
                    self.max_steps, stage_id
                ));
                return self.finish(failed, &mut forwarded).await;
            }

            if cancel.is_cancelled() {
                return self.cancelled(&snapshot).await;
            }

            let Some(stage) = self.workflow.stage(&stage_id).cloned() else {
                let failed = snapshot.failed(format!("routed to unknown stage '{}'", stage_id));
                return self.finish(failed, &mut forwarded).await;
            };

            self.emit(WorkflowEvent::StageStarted {
                workflow_id: snapshot.workflow_id.clone(),
                stage: stage_id.clone(),
                step: snapshot.steps + 1,
                timestamp: WorkflowEvent::now(),
            })
            .await;

            let started = Instant::now();
            let outcome = self.execute(stage.as_ref(), &snapshot).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            if cancel.is_cancelled() {
                tracing::info!(
                    workflow_id = %snapshot.workflow_id,
                    stage = %stage_id,
                    "Discarding result of stage finished after cancellation"
                );
                return self.cancelled(&snapshot).await;
            }

            let result = match outcome {
                Ok(result) => result,
                Err(reason) => {
                    tracing::error!(workflow_id = %snapshot.workflow_id, stage = %stage_id, error = %reason, "Stage broke its contract");
                    return self.finish(snapshot.failed(reason), &mut forwarded).await;
                }
            };

            if !stage
                .outcomes()
                .iter()
                .any(|outcome| *outcome == result.status.as_str())
            {
                // keep what the stage logged, its fields are not merged
                let mut failed = snapshot.clone();
                failed.audit_log.extend(result.audit.iter().cloned());
                let failed = failed.failed(format!(
                    "contract violation: stage '{}' returned undeclared status '{}'",
                    stage_id, result.status
                ));
                return self.finish(failed, &mut forwarded).await;
            }

            snapshot = snapshot.merge(&stage_id, &result);
            self.save(&snapshot, CheckpointSource::Stage, Some(&stage_id))
                .await?;

            tracing::info!(
                workflow_id = %snapshot.workflow_id,
                stage = %stage_id,
                status = %snapshot.status,
                step = snapshot.steps,
                duration_ms,
                "Stage completed"
            );
            self.emit(WorkflowEvent::StageCompleted {
                workflow_id: snapshot.workflow_id.clone(),
                stage: stage_id,
                status: snapshot.status.to_string(),
                timestamp: WorkflowEvent::now(),
                duration_ms,
            })
            .await;
            self.forward_audit(&snapshot, &mut forwarded).await;
        }
    }

    async fn execute(
        &self,
        stage: &dyn Stage<F>,
        snapshot: &WorkflowSnapshot<F>,
    ) -> std::result::Result<StageResult<F::Patch>, String> {
        let guarded = AssertUnwindSafe(stage.execute(snapshot)).catch_unwind();
        let outcome = match self.stage_timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(format!(
                        "stage '{}' exceeded the stage timeout of {}ms",
                        stage.id(),
                        limit.as_millis()
                    ))
                }
            },
            None => guarded.await,
        };

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(format!("stage '{}' failed: {}", stage.id(), e)),
            Err(panic) => Err(format!(
                "stage '{}' panicked: {}",
                stage.id(),
                panic_message(panic.as_ref())
            )),
        }
    }

    async fn finish(
        &self,
        snapshot: WorkflowSnapshot<F>,
        forwarded: &mut usize,
    ) -> Result<WorkflowSnapshot<F>> {
        self.save(&snapshot, CheckpointSource::Terminal, None).await?;
        self.forward_audit(&snapshot, forwarded).await;

        match snapshot.phase {
            Phase::Failed => tracing::error!(
                workflow_id = %snapshot.workflow_id,
                status = %snapshot.status,
                steps = snapshot.steps,
                error = snapshot.error.as_deref().unwrap_or(""),
                "Workflow failed"
            ),
            _ => tracing::info!(
                workflow_id = %snapshot.workflow_id,
                status = %snapshot.status,
                steps = snapshot.steps,
                "Workflow succeeded"
            ),
        }

        self.emit(WorkflowEvent::WorkflowFinished {
            workflow_id: snapshot.workflow_id.clone(),
            phase: snapshot.phase,
            status: snapshot.status.to_string(),
            error: snapshot.error.clone(),
            steps: snapshot.steps,
            timestamp: WorkflowEvent::now(),
        })
        .await;

        if self.retention.clears(snapshot.phase.is_failed()) {
            self.store.clear(&snapshot.workflow_id).await?;
            tracing::debug!(
                workflow_id = %snapshot.workflow_id,
                retention = ?self.retention,
                "Terminal checkpoint cleared"
            );
        }

        Ok(snapshot)
    }

    async fn cancelled(&self, snapshot: &WorkflowSnapshot<F>) -> Result<WorkflowSnapshot<F>> {
        tracing::info!(
            workflow_id = %snapshot.workflow_id,
            steps = snapshot.steps,
            "Workflow cancelled; last checkpoint kept for resume"
        );
        self.emit(WorkflowEvent::WorkflowCancelled {
            workflow_id: snapshot.workflow_id.clone(),
            steps: snapshot.steps,
            timestamp: WorkflowEvent::now(),
        })
        .await;
        Err(EngineError::Cancelled {
            workflow_id: snapshot.workflow_id.clone(),
            steps: snapshot.steps,
        })
    }

    async fn save(
        &self,
        snapshot: &WorkflowSnapshot<F>,
        source: CheckpointSource,
        stage: Option<&StageId>,
    ) -> Result<()> {
        let mut metadata = CheckpointMetadata::new()
            .with_source(source)
            .with_status(snapshot.status.as_str());
        if let Some(stage) = stage {
            metadata = metadata.with_stage(stage.as_str());
        }

        let checkpoint = Checkpoint::new(
            snapshot.workflow_id.as_str(),
            snapshot.steps,
            serde_json::to_value(snapshot)?,
        )
        .with_metadata(metadata);

        self.store.save(&snapshot.workflow_id, checkpoint).await?;
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowSnapshot<F>>> {
        let Some(checkpoint) = self.store.load(workflow_id).await? else {
            return Ok(None);
        };

        let found = checkpoint
            .state
            .get("schema_version")
            .and_then(Value::as_u64)
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
            .unwrap_or(0);
        if found != F::SCHEMA_VERSION {
            return Err(EngineError::SchemaMismatch {
                workflow_id: workflow_id.to_string(),
                expected: F::SCHEMA_VERSION,
                found,
            });
        }

        let snapshot: WorkflowSnapshot<F> = serde_json::from_value(checkpoint.state)?;
        if snapshot.workflow_id != workflow_id {
            return Err(CheckpointError::Invalid(format!(
                "checkpoint under '{}' holds workflow '{}'",
                workflow_id, snapshot.workflow_id
            ))
            .into());
        }
        Ok(Some(snapshot))
    }

    async fn forward_audit(&self, snapshot: &WorkflowSnapshot<F>, forwarded: &mut usize) {
        let start = (*forwarded).min(snapshot.audit_log.len());
        for line in &snapshot.audit_log[start..] {
            self.emit(WorkflowEvent::AuditAppended {
                workflow_id: snapshot.workflow_id.clone(),
                line: line.clone(),
                timestamp: WorkflowEvent::now(),
            })
            .await;
        }
        *forwarded = snapshot.audit_log.len();
    }

    async fn emit(&self, event: WorkflowEvent) {
        if let Err(e) = self.recorder.record(&event).await {
            tracing::warn!(event = event.kind(), error = %e, "Event recorder failed");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
