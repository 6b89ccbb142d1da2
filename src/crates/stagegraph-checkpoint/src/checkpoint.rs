//! Checkpoint record types
//!
//! A [`Checkpoint`] is the persisted copy of the latest workflow snapshot for one
//! workflow id. Only the latest checkpoint per workflow is kept; the snapshot's own
//! audit log carries the history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier of a single checkpoint write
pub type CheckpointId = String;

/// What produced a checkpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Fresh workflow start, before any stage ran
    Input,
    /// Written after a stage result was merged
    Stage,
    /// Written by routing bookkeeping (loop demotion into a terminal route, step ceiling)
    Route,
    /// Final checkpoint of a workflow that reached a terminal phase
    Terminal,
}

/// Metadata stored alongside a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointMetadata {
    /// What produced this checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CheckpointSource>,

    /// Stage whose result this checkpoint contains
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,

    /// Status tag of the snapshot at write time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Additional metadata
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CheckpointMetadata {
    /// Create empty metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the source
    pub fn with_source(mut self, source: CheckpointSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the stage
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Set the status tag
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Add an extra key
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Persisted copy of a workflow snapshot
///
/// The snapshot itself is stored as a JSON value so that storage backends stay
/// independent of the field types a workflow uses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// Checkpoint format version
    pub v: i32,

    /// Unique id of this write
    pub id: CheckpointId,

    /// Workflow the checkpoint belongs to
    pub workflow_id: String,

    /// Time of the write
    pub ts: DateTime<Utc>,

    /// Number of stage executions contained in the snapshot
    pub step: u64,

    /// Serialized snapshot
    pub state: serde_json::Value,

    /// Write metadata
    #[serde(default)]
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// Format version written by this build
    pub const CURRENT_VERSION: i32 = 1;

    /// Create a checkpoint for a workflow
    pub fn new(workflow_id: impl Into<String>, step: u64, state: serde_json::Value) -> Self {
        Self {
            v: Self::CURRENT_VERSION,
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            ts: Utc::now(),
            step,
            state,
            metadata: CheckpointMetadata::default(),
        }
    }

    /// Attach metadata
    pub fn with_metadata(mut self, metadata: CheckpointMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checkpoint_new() {
        let cp = Checkpoint::new("order-1", 3, json!({"status": "text_written"}));
        assert_eq!(cp.v, Checkpoint::CURRENT_VERSION);
        assert_eq!(cp.workflow_id, "order-1");
        assert_eq!(cp.step, 3);
        assert!(!cp.id.is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Checkpoint::new("w", 0, json!(null));
        let b = Checkpoint::new("w", 0, json!(null));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_metadata_serialization_skips_empty() {
        let metadata = CheckpointMetadata::new().with_source(CheckpointSource::Stage);
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value, json!({"source": "stage"}));

        let metadata = metadata
            .with_stage("write")
            .with_status("text_written")
            .with_extra("attempt", json!(2));
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["stage"], "write");
        assert_eq!(value["status"], "text_written");
        assert_eq!(value["attempt"], 2);
    }

    #[test]
    fn test_missing_metadata_defaults() {
        let raw = json!({
            "v": 1,
            "id": "abc",
            "workflow_id": "w1",
            "ts": "2024-01-01T00:00:00Z",
            "step": 0,
            "state": {}
        });
        let cp: Checkpoint = serde_json::from_value(raw).unwrap();
        assert_eq!(cp.metadata, CheckpointMetadata::default());
    }
}
