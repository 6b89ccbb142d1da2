//! Error types for workflow construction and execution
//!
//! Two families of failure are kept apart:
//!
//! - **Infrastructure failures** surface as [`EngineError`]: the checkpoint store is
//!   unreachable, a stored snapshot belongs to another schema, the workflow was
//!   cancelled, or the same workflow id is already running.
//! - **Workflow failures** never surface as `Err`. A stage that returns
//!   [`StageError`], panics, or emits an undeclared status, a route that cannot be
//!   resolved ([`RouteError`]) and an exceeded step ceiling are all converted into a
//!   snapshot in the `Failed` phase, checkpointed and returned as `Ok`.
//!
//! ```text
//! EngineError
//! ├── Checkpoint      - Storage backend failures
//! ├── Serialization   - Snapshot (de)serialization
//! ├── SchemaMismatch  - Checkpoint written by another field schema
//! ├── Validation      - Workflow definition is inconsistent
//! ├── Config          - Engine configuration rejected
//! ├── NotFound        - Resume without a checkpoint
//! ├── AlreadyRunning  - Second concurrent run of one workflow id
//! ├── Cancelled       - Cancelled between stages
//! └── Join            - Scheduler task panicked or was aborted
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! match engine.resume("order-7").await {
//!     Ok(snapshot) if snapshot.phase.is_failed() => {
//!         eprintln!("workflow failed: {:?}", snapshot.error);
//!     }
//!     Ok(snapshot) => println!("done: {}", snapshot.status),
//!     Err(EngineError::NotFound(id)) => eprintln!("nothing to resume for {}", id),
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use stagegraph_checkpoint::CheckpointError;
use thiserror::Error;

use crate::collaborator::CollaboratorError;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Infrastructure errors returned by the engine and scheduler
#[derive(Error, Debug)]
pub enum EngineError {
    /// Checkpoint storage failed
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Snapshot could not be serialized or deserialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A checkpoint was written by a different field schema version
    #[error("Schema mismatch for workflow '{workflow_id}': expected v{expected}, found v{found}")]
    SchemaMismatch {
        /// Workflow whose checkpoint was rejected
        workflow_id: String,
        /// Version of the running field set
        expected: u32,
        /// Version found in the checkpoint
        found: u32,
    },

    /// Workflow definition is inconsistent (missing stage, unmapped outcome, ...)
    #[error("Workflow validation error: {0}")]
    Validation(String),

    /// Engine configuration rejected
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resume requested but no checkpoint exists
    #[error("No checkpoint found for workflow '{0}'")]
    NotFound(String),

    /// The workflow id is already being processed
    #[error("Workflow '{0}' is already running")]
    AlreadyRunning(String),

    /// Cancelled between stages; the last checkpoint stays valid for resume
    #[error("Workflow '{workflow_id}' cancelled after {steps} stage executions")]
    Cancelled {
        /// Cancelled workflow
        workflow_id: String,
        /// Stage executions contained in the last checkpoint
        steps: u64,
    },

    /// A scheduled workflow task failed to join
    #[error("Workflow task failed: {0}")]
    Join(String),
}

/// A stage broke its contract by returning an error instead of a status
#[derive(Error, Debug)]
pub enum StageError {
    /// Unrecoverable stage failure
    #[error("{0}")]
    Failed(String),

    /// Collaborator failure the stage chose not to translate into a status
    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),
}

impl StageError {
    /// Create a generic stage failure
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Routing could not produce a next step
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// No edge for the (stage, status) pair
    #[error("no route from stage '{stage}' for status '{status}'")]
    Unmapped {
        /// Stage whose outcome was routed
        stage: String,
        /// Unmapped status
        status: String,
    },

    /// A computed target names a stage that is not part of the workflow
    #[error("route targets unknown stage '{0}'")]
    UnknownStage(String),

    /// A loop edge names a key missing from the loop registry
    #[error("loop '{0}' is not registered")]
    UnknownLoop(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = EngineError::SchemaMismatch {
            workflow_id: "w".into(),
            expected: 2,
            found: 1,
        };
        assert_eq!(
            err.to_string(),
            "Schema mismatch for workflow 'w': expected v2, found v1"
        );

        let err = RouteError::Unmapped {
            stage: "write".into(),
            status: "bogus".into(),
        };
        assert_eq!(err.to_string(), "no route from stage 'write' for status 'bogus'");
    }

    #[test]
    fn test_checkpoint_error_converts() {
        let err: EngineError = CheckpointError::Storage("disk full".into()).into();
        assert!(matches!(err, EngineError::Checkpoint(_)));
    }
}
