//! Concurrent workflow scheduling
//!
//! A [`Scheduler`] runs many workflows of one engine at the same time, each in its
//! own sequential task:
//!
//! - a semaphore bounds how many workflows execute concurrently
//! - a workflow id already queued or running is refused with
//!   [`EngineError::AlreadyRunning`], which keeps one writer per checkpoint
//! - [`Scheduler::cancel`] reaches the cancellation handle of a running workflow
//!
//! Ordering across workflows is not guaranteed.

use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cancel::CancelHandle;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::fields::FieldSet;
use crate::snapshot::WorkflowSnapshot;

type Running = Arc<Mutex<HashMap<String, CancelHandle>>>;

enum Job<F> {
    Run(F),
    Resume,
    RunOrResume(F),
}

/// Bounded concurrent runner over a shared engine
pub struct Scheduler<F: FieldSet> {
    engine: Arc<Engine<F>>,
    permits: Arc<Semaphore>,
    running: Running,
    capacity: usize,
}

impl<F: FieldSet> Clone for Scheduler<F> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            permits: self.permits.clone(),
            running: self.running.clone(),
            capacity: self.capacity,
        }
    }
}

impl<F: FieldSet> std::fmt::Debug for Scheduler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("capacity", &self.capacity)
            .field("running", &self.running.lock().len())
            .finish()
    }
}

/// Removes a workflow id from the running set when dropped
struct RunningGuard {
    id: String,
    running: Running,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.lock().remove(&self.id);
    }
}

impl<F: FieldSet> Scheduler<F> {
    /// Scheduler allowing `max_concurrent` workflows at once (at least one)
    pub fn new(engine: Arc<Engine<F>>, max_concurrent: usize) -> Self {
        let capacity = max_concurrent.max(1);
        Self {
            engine,
            permits: Arc::new(Semaphore::new(capacity)),
            running: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    /// Scheduler sized by `engine.max_concurrent_workflows`
    pub fn from_config(engine: Arc<Engine<F>>, config: &EngineConfig) -> Self {
        Self::new(engine, config.max_concurrent_workflows)
    }

    /// Shared engine
    pub fn engine(&self) -> &Arc<Engine<F>> {
        &self.engine
    }

    /// Maximum concurrent workflows
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether a workflow id is queued or running
    pub fn is_running(&self, workflow_id: &str) -> bool {
        self.running.lock().contains_key(workflow_id)
    }

    /// Queued or running workflow ids, sorted
    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Request cancellation of a queued or running workflow
    ///
    /// Returns `false` if the id is unknown or already cancelled.
    pub fn cancel(&self, workflow_id: &str) -> bool {
        match self.running.lock().get(workflow_id) {
            Some(handle) => handle.cancel(),
            None => false,
        }
    }

    /// Cancel everything queued or running
    pub fn cancel_all(&self) {
        for handle in self.running.lock().values() {
            handle.cancel();
        }
    }

    /// Fresh run of `workflow_id`
    pub async fn run(&self, workflow_id: &str, initial: F) -> Result<WorkflowSnapshot<F>> {
        self.submit(workflow_id, Job::Run(initial)).await
    }

    /// Resume `workflow_id` from its checkpoint
    pub async fn resume(&self, workflow_id: &str) -> Result<WorkflowSnapshot<F>> {
        self.submit(workflow_id, Job::Resume).await
    }

    /// Resume if checkpointed, else start fresh
    pub async fn run_or_resume(&self, workflow_id: &str, initial: F) -> Result<WorkflowSnapshot<F>> {
        self.submit(workflow_id, Job::RunOrResume(initial)).await
    }

    /// Run (or resume) a batch of workflows concurrently
    ///
    /// Every id gets exactly one result; results are sorted by workflow id.
    pub async fn run_batch(
        &self,
        jobs: Vec<(String, F)>,
    ) -> Vec<(String, Result<WorkflowSnapshot<F>>)> {
        let mut set = JoinSet::new();
        for (workflow_id, initial) in jobs {
            let scheduler = self.clone();
            set.spawn(async move {
                let outcome = AssertUnwindSafe(scheduler.run_or_resume(&workflow_id, initial))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(EngineError::Join(format!(
                            "task for workflow '{}' panicked",
                            workflow_id
                        )))
                    });
                (workflow_id, outcome)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(pair) => results.push(pair),
                Err(e) => tracing::error!(error = %e, "Batch task failed to join"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    async fn submit(&self, workflow_id: &str, job: Job<F>) -> Result<WorkflowSnapshot<F>> {
        let (guard, cancel) = self.claim(workflow_id)?;

        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Join("scheduler semaphore closed".to_string()))?;
        tracing::debug!(
            workflow_id = %workflow_id,
            available = self.permits.available_permits(),
            "Workflow admitted"
        );

        let outcome = match job {
            Job::Run(initial) => self.engine.run_with_cancel(workflow_id, initial, &cancel).await,
            Job::Resume => self.engine.resume_with_cancel(workflow_id, &cancel).await,
            Job::RunOrResume(initial) => {
                self.engine
                    .run_or_resume_with_cancel(workflow_id, initial, &cancel)
                    .await
            }
        };
        drop(guard);
        outcome
    }

    fn claim(&self, workflow_id: &str) -> Result<(RunningGuard, CancelHandle)> {
        let mut running = self.running.lock();
        if running.contains_key(workflow_id) {
            return Err(EngineError::AlreadyRunning(workflow_id.to_string()));
        }
        let cancel = CancelHandle::new();
        running.insert(workflow_id.to_string(), cancel.clone());
        Ok((
            RunningGuard {
                id: workflow_id.to_string(),
                running: self.running.clone(),
            },
            cancel,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::DynamicFields;
    use crate::router::Decision;
    use crate::stage::{FnStage, StageResult};
    use crate::workflow::WorkflowBuilder;
    use stagegraph_checkpoint::InMemoryCheckpointStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn slow_engine(active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Arc<Engine<DynamicFields>> {
        let workflow = WorkflowBuilder::new("slow")
            .stage(FnStage::new("work", &["done"], move |_| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(StageResult::new("done"))
                }
            }))
            .entry("work")
            .edge("work", "done", Decision::terminal())
            .build()
            .unwrap();
        Arc::new(Engine::new(workflow, Arc::new(InMemoryCheckpointStore::new())))
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(slow_engine(active, peak.clone()), 2);

        let jobs = (0..6)
            .map(|i| (format!("wf-{}", i), DynamicFields::new()))
            .collect();
        let results = scheduler.run_batch(jobs).await;

        assert_eq!(results.len(), 6);
        assert!(results.iter().all(|(_, r)| r.as_ref().is_ok_and(|s| s.status == "done")));
        assert_eq!(results[0].0, "wf-0");
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(scheduler.running().is_empty());
    }

    #[tokio::test]
    async fn test_same_id_rejected_while_running() {
        let scheduler = Scheduler::new(
            slow_engine(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0))),
            4,
        );

        let first = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run("dup", DynamicFields::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(scheduler.is_running("dup"));

        let second = scheduler.run("dup", DynamicFields::new()).await;
        assert!(matches!(second, Err(EngineError::AlreadyRunning(id)) if id == "dup"));

        assert!(first.await.unwrap().is_ok());
        assert!(!scheduler.is_running("dup"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_id() {
        let scheduler = Scheduler::new(
            slow_engine(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0))),
            1,
        );
        assert!(!scheduler.cancel("nobody"));
    }
}
