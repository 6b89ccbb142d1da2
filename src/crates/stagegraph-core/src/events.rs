//! Workflow events for observability
//!
//! The engine reports what it does to an [`EventRecorder`]: workflow start and
//! resume, each stage execution, every appended audit line, loop-backs,
//! demotions and the terminal phase. The surrounding application turns these
//! into progress messages or statistics.
//!
//! Recording is best effort. A recorder that fails is logged at `warn` and the
//! workflow carries on.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::snapshot::Phase;

/// Event types emitted by the engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// Fresh run started
    WorkflowStarted {
        workflow_id: String,
        workflow: String,
        timestamp: i64,
    },
    /// Run resumed from a checkpoint
    WorkflowResumed {
        workflow_id: String,
        steps: u64,
        status: String,
        timestamp: i64,
    },
    /// Stage execution starting
    StageStarted {
        workflow_id: String,
        stage: String,
        step: u64,
        timestamp: i64,
    },
    /// Stage result merged and checkpointed
    StageCompleted {
        workflow_id: String,
        stage: String,
        status: String,
        timestamp: i64,
        duration_ms: u64,
    },
    /// Line appended to the audit log
    AuditAppended {
        workflow_id: String,
        line: String,
        timestamp: i64,
    },
    /// Loop back edge taken
    LoopBack {
        workflow_id: String,
        loop_key: String,
        attempt: u32,
        ceiling: u32,
        timestamp: i64,
    },
    /// Loop ceiling reached, proceeding with best effort
    LoopDemoted {
        workflow_id: String,
        loop_key: String,
        attempts: u32,
        ceiling: u32,
        metric: Option<String>,
        timestamp: i64,
    },
    /// Terminal phase reached
    WorkflowFinished {
        workflow_id: String,
        phase: Phase,
        status: String,
        error: Option<String>,
        steps: u64,
        timestamp: i64,
    },
    /// Cancelled between stages
    WorkflowCancelled {
        workflow_id: String,
        steps: u64,
        timestamp: i64,
    },
}

impl WorkflowEvent {
    /// Current timestamp in milliseconds
    pub fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Workflow the event belongs to
    pub fn workflow_id(&self) -> &str {
        match self {
            WorkflowEvent::WorkflowStarted { workflow_id, .. }
            | WorkflowEvent::WorkflowResumed { workflow_id, .. }
            | WorkflowEvent::StageStarted { workflow_id, .. }
            | WorkflowEvent::StageCompleted { workflow_id, .. }
            | WorkflowEvent::AuditAppended { workflow_id, .. }
            | WorkflowEvent::LoopBack { workflow_id, .. }
            | WorkflowEvent::LoopDemoted { workflow_id, .. }
            | WorkflowEvent::WorkflowFinished { workflow_id, .. }
            | WorkflowEvent::WorkflowCancelled { workflow_id, .. } => workflow_id,
        }
    }

    /// Timestamp of the event
    pub fn timestamp(&self) -> i64 {
        match self {
            WorkflowEvent::WorkflowStarted { timestamp, .. }
            | WorkflowEvent::WorkflowResumed { timestamp, .. }
            | WorkflowEvent::StageStarted { timestamp, .. }
            | WorkflowEvent::StageCompleted { timestamp, .. }
            | WorkflowEvent::AuditAppended { timestamp, .. }
            | WorkflowEvent::LoopBack { timestamp, .. }
            | WorkflowEvent::LoopDemoted { timestamp, .. }
            | WorkflowEvent::WorkflowFinished { timestamp, .. }
            | WorkflowEvent::WorkflowCancelled { timestamp, .. } => *timestamp,
        }
    }

    /// Event type name as serialized
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowEvent::WorkflowStarted { .. } => "workflow_started",
            WorkflowEvent::WorkflowResumed { .. } => "workflow_resumed",
            WorkflowEvent::StageStarted { .. } => "stage_started",
            WorkflowEvent::StageCompleted { .. } => "stage_completed",
            WorkflowEvent::AuditAppended { .. } => "audit_appended",
            WorkflowEvent::LoopBack { .. } => "loop_back",
            WorkflowEvent::LoopDemoted { .. } => "loop_demoted",
            WorkflowEvent::WorkflowFinished { .. } => "workflow_finished",
            WorkflowEvent::WorkflowCancelled { .. } => "workflow_cancelled",
        }
    }
}

/// Recorder failure; never fails a workflow
#[derive(Error, Debug)]
#[error("event recorder failed: {0}")]
pub struct RecordError(pub String);

/// Sink for workflow events
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Record one event
    async fn record(&self, event: &WorkflowEvent) -> Result<(), RecordError>;
}

/// Recorder that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

#[async_trait]
impl EventRecorder for NoopRecorder {
    async fn record(&self, _event: &WorkflowEvent) -> Result<(), RecordError> {
        Ok(())
    }
}

/// Recorder that writes events to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRecorder;

#[async_trait]
impl EventRecorder for TracingRecorder {
    async fn record(&self, event: &WorkflowEvent) -> Result<(), RecordError> {
        match event {
            WorkflowEvent::AuditAppended { workflow_id, line, .. } => {
                tracing::info!(workflow_id = %workflow_id, "{}", line);
            }
            WorkflowEvent::LoopDemoted {
                workflow_id,
                loop_key,
                attempts,
                ceiling,
                ..
            } => {
                tracing::warn!(
                    workflow_id = %workflow_id,
                    loop_key = %loop_key,
                    attempts,
                    ceiling,
                    "Loop ceiling reached"
                );
            }
            other => {
                tracing::debug!(
                    workflow_id = %other.workflow_id(),
                    event = other.kind(),
                    "Workflow event"
                );
            }
        }
        Ok(())
    }
}

/// Recorder fanning events out over a tokio broadcast channel
///
/// Slow subscribers lag and miss events; the engine never waits for them.
#[derive(Debug, Clone)]
pub struct BroadcastRecorder {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl BroadcastRecorder {
    /// Channel with room for `capacity` undelivered events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// New receiver
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// New receiver as a `Stream`
    pub fn stream(&self) -> BroadcastStream<WorkflowEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

impl Default for BroadcastRecorder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventRecorder for BroadcastRecorder {
    async fn record(&self, event: &WorkflowEvent) -> Result<(), RecordError> {
        // no subscribers is not a failure
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}

/// Recorder forwarding to several recorders; reports the first failure after
/// delivering to all of them
#[derive(Clone, Default)]
pub struct CompositeRecorder {
    recorders: Vec<Arc<dyn EventRecorder>>,
}

impl CompositeRecorder {
    /// Empty composite
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a recorder
    pub fn with(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorders.push(recorder);
        self
    }

    /// Number of recorders
    pub fn len(&self) -> usize {
        self.recorders.len()
    }

    /// Whether the composite has no recorder
    pub fn is_empty(&self) -> bool {
        self.recorders.is_empty()
    }
}

impl std::fmt::Debug for CompositeRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeRecorder")
            .field("recorders", &self.recorders.len())
            .finish()
    }
}

#[async_trait]
impl EventRecorder for CompositeRecorder {
    async fn record(&self, event: &WorkflowEvent) -> Result<(), RecordError> {
        let mut first_error = None;
        for recorder in &self.recorders {
            if let Err(e) = recorder.record(event).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collecting(Mutex<Vec<WorkflowEvent>>);

    #[async_trait]
    impl EventRecorder for Collecting {
        async fn record(&self, event: &WorkflowEvent) -> Result<(), RecordError> {
            self.0.lock().push(event.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventRecorder for Failing {
        async fn record(&self, _event: &WorkflowEvent) -> Result<(), RecordError> {
            Err(RecordError("offline".into()))
        }
    }

    fn audit(line: &str) -> WorkflowEvent {
        WorkflowEvent::AuditAppended {
            workflow_id: "wf".into(),
            line: line.into(),
            timestamp: 1,
        }
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let value = serde_json::to_value(audit("[write] done")).unwrap();
        assert_eq!(value["type"], "audit_appended");
        assert_eq!(value["line"], "[write] done");

        let finished = WorkflowEvent::WorkflowFinished {
            workflow_id: "wf".into(),
            phase: Phase::Succeeded,
            status: "completed".into(),
            error: None,
            steps: 9,
            timestamp: 2,
        };
        let value = serde_json::to_value(&finished).unwrap();
        assert_eq!(value["phase"], "succeeded");
        assert_eq!(finished.kind(), "workflow_finished");
        assert_eq!(finished.workflow_id(), "wf");
        assert_eq!(finished.timestamp(), 2);
    }

    #[tokio::test]
    async fn test_broadcast_recorder_delivers() {
        let recorder = BroadcastRecorder::new(8);
        let mut stream = recorder.stream();
        recorder.record(&audit("one")).await.unwrap();

        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received, audit("one"));
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_ok() {
        let recorder = BroadcastRecorder::default();
        assert!(recorder.record(&audit("nobody listens")).await.is_ok());
    }

    #[tokio::test]
    async fn test_composite_delivers_past_failures() {
        let collecting = Arc::new(Collecting::default());
        let composite = CompositeRecorder::new()
            .with(Arc::new(Failing))
            .with(collecting.clone());

        let result = composite.record(&audit("x")).await;
        assert!(result.is_err());
        assert_eq!(collecting.0.lock().len(), 1);
    }
}
