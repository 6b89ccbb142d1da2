//! Checkpoint storage trait for pluggable backends
//!
//! [`CheckpointStore`] is the key-value contract every backend implements:
//!
//! - **`save()`** replaces the checkpoint kept for a workflow id
//! - **`load()`** returns the latest checkpoint, or `None`
//! - **`clear()`** drops the checkpoint (retention policy, manual cleanup)
//! - **`list()`** enumerates workflow ids that currently have a checkpoint
//!
//! Checkpoints are not versioned history. A backend keeps exactly one record per
//! workflow id and the newest write wins.
//!
//! # Concurrency
//!
//! Callers guarantee at most one writer per workflow id. Backends must make sure
//! that writes for two *different* workflow ids neither corrupt nor wait on each
//! other for longer than a short critical section.
//!
//! # Implementing a backend
//!
//! ```rust,ignore
//! use stagegraph_checkpoint::{Checkpoint, CheckpointStore, Result};
//! use async_trait::async_trait;
//!
//! struct RedisCheckpointStore {
//!     client: redis::Client,
//! }
//!
//! #[async_trait]
//! impl CheckpointStore for RedisCheckpointStore {
//!     async fn save(&self, workflow_id: &str, checkpoint: Checkpoint) -> Result<()> {
//!         let data = serde_json::to_string(&checkpoint)?;
//!         // SET checkpoint:{workflow_id} data
//!         Ok(())
//!     }
//!
//!     async fn load(&self, workflow_id: &str) -> Result<Option<Checkpoint>> {
//!         // GET checkpoint:{workflow_id}
//!         Ok(None)
//!     }
//!
//!     async fn clear(&self, workflow_id: &str) -> Result<()> {
//!         // DEL checkpoint:{workflow_id}
//!         Ok(())
//!     }
//!
//!     async fn list(&self) -> Result<Vec<String>> {
//!         // SCAN MATCH checkpoint:*
//!         Ok(vec![])
//!     }
//! }
//! ```

use crate::{
    checkpoint::Checkpoint,
    error::{CheckpointError, Result},
};
use async_trait::async_trait;
use std::sync::Arc;

/// Storage backend for workflow checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Durably persist `checkpoint` as the latest checkpoint of `workflow_id`,
    /// replacing any prior one.
    ///
    /// Implementations must reject a checkpoint whose `workflow_id` differs from
    /// the key it is saved under; [`ensure_matches`] does the check.
    async fn save(&self, workflow_id: &str, checkpoint: Checkpoint) -> Result<()>;

    /// Load the latest checkpoint of `workflow_id`
    ///
    /// Returns `Ok(None)` (not an error) when nothing is stored.
    async fn load(&self, workflow_id: &str) -> Result<Option<Checkpoint>>;

    /// Drop the checkpoint of `workflow_id`. Clearing a missing id is not an error.
    async fn clear(&self, workflow_id: &str) -> Result<()>;

    /// Workflow ids that currently have a checkpoint, sorted
    async fn list(&self) -> Result<Vec<String>>;

    /// Whether a checkpoint exists for `workflow_id`
    async fn exists(&self, workflow_id: &str) -> Result<bool> {
        Ok(self.load(workflow_id).await?.is_some())
    }
}

#[async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointStore for Arc<T> {
    async fn save(&self, workflow_id: &str, checkpoint: Checkpoint) -> Result<()> {
        (**self).save(workflow_id, checkpoint).await
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<Checkpoint>> {
        (**self).load(workflow_id).await
    }

    async fn clear(&self, workflow_id: &str) -> Result<()> {
        (**self).clear(workflow_id).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        (**self).list().await
    }

    async fn exists(&self, workflow_id: &str) -> Result<bool> {
        (**self).exists(workflow_id).await
    }
}

/// Check that a checkpoint is being saved under its own workflow id, and that its
/// format version is one this build understands.
pub fn ensure_matches(workflow_id: &str, checkpoint: &Checkpoint) -> Result<()> {
    if checkpoint.workflow_id != workflow_id {
        return Err(CheckpointError::Invalid(format!(
            "checkpoint for workflow '{}' saved under key '{}'",
            checkpoint.workflow_id, workflow_id
        )));
    }
    ensure_version(checkpoint)
}

/// Reject checkpoints written with a different format version
pub fn ensure_version(checkpoint: &Checkpoint) -> Result<()> {
    if checkpoint.v != Checkpoint::CURRENT_VERSION {
        return Err(CheckpointError::VersionMismatch {
            expected: Checkpoint::CURRENT_VERSION,
            found: checkpoint.v,
        });
    }
    Ok(())
}
