//! The stage contract
//!
//! A [`Stage`] turns the current snapshot into a [`StageResult`]: a partial field
//! update, the new status tag, audit lines and an optional terminal error. Stages
//! never mutate their input, and they translate collaborator failures into status
//! tags instead of returning `Err`.
//!
//! ```rust
//! use async_trait::async_trait;
//! use stagegraph_core::{DynamicFields, DynamicPatch, Stage, StageError, StageResult, WorkflowSnapshot};
//!
//! struct Greet;
//!
//! #[async_trait]
//! impl Stage<DynamicFields> for Greet {
//!     fn id(&self) -> &str {
//!         "greet"
//!     }
//!
//!     fn outcomes(&self) -> &[&'static str] {
//!         &["greeted"]
//!     }
//!
//!     async fn execute(
//!         &self,
//!         snapshot: &WorkflowSnapshot<DynamicFields>,
//!     ) -> Result<StageResult<DynamicPatch>, StageError> {
//!         let name = snapshot.fields.get_str("name").unwrap_or("world");
//!         Ok(StageResult::new("greeted")
//!             .with_patch(DynamicPatch::new().set("greeting", format!("hello {}", name)))
//!             .log("[greet] greeted"))
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::StageError;
use crate::fields::FieldSet;
use crate::snapshot::{Status, WorkflowSnapshot};

/// Identifier of a stage within a workflow
pub type StageId = String;

/// Value a stage returns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult<P> {
    /// Partial field update
    pub patch: P,

    /// New status; must be one of the stage's declared outcomes
    pub status: Status,

    /// Lines appended to the audit log
    #[serde(default)]
    pub audit: Vec<String>,

    /// Terminal failure description
    #[serde(default)]
    pub error: Option<String>,

    /// Loop counters to reset to zero
    #[serde(default)]
    pub reset_attempts: Vec<String>,
}

impl<P: Default> StageResult<P> {
    /// Result with an empty patch
    pub fn new(status: impl Into<Status>) -> Self {
        Self {
            patch: P::default(),
            status: status.into(),
            audit: Vec::new(),
            error: None,
            reset_attempts: Vec::new(),
        }
    }
}

impl<P> StageResult<P> {
    /// Set the patch
    pub fn with_patch(mut self, patch: P) -> Self {
        self.patch = patch;
        self
    }

    /// Append an audit line
    pub fn log(mut self, line: impl Into<String>) -> Self {
        self.audit.push(line.into());
        self
    }

    /// Mark the result with a terminal error
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Reset a loop counter; the reset is recorded in the audit log
    pub fn reset_attempts(mut self, loop_key: impl Into<String>) -> Self {
        let key = loop_key.into();
        self.audit
            .push(format!("[attempts] counter '{}' reset", key));
        self.reset_attempts.push(key);
        self
    }
}

/// A unit of work in a workflow graph
#[async_trait]
pub trait Stage<F: FieldSet>: Send + Sync {
    /// Stage id, unique within a workflow
    fn id(&self) -> &str;

    /// Every status tag `execute` may return
    fn outcomes(&self) -> &[&'static str];

    /// Produce the next partial update from the current snapshot
    async fn execute(
        &self,
        snapshot: &WorkflowSnapshot<F>,
    ) -> Result<StageResult<F::Patch>, StageError>;
}

type BoxedStageFn<F> = Arc<
    dyn Fn(
            WorkflowSnapshot<F>,
        ) -> futures::future::BoxFuture<
            'static,
            Result<StageResult<<F as FieldSet>::Patch>, StageError>,
        > + Send
        + Sync,
>;

/// Stage backed by an async closure
///
/// The closure receives an owned copy of the snapshot.
///
/// ```rust
/// use stagegraph_core::{DynamicFields, FnStage, StageResult};
///
/// let stage = FnStage::<DynamicFields>::new("noop", &["done"], |_snapshot| async move {
///     Ok(StageResult::new("done"))
/// });
/// ```
pub struct FnStage<F: FieldSet> {
    id: StageId,
    outcomes: Vec<&'static str>,
    func: BoxedStageFn<F>,
}

impl<F: FieldSet> FnStage<F> {
    /// Wrap an async closure as a stage
    pub fn new<Func, Fut>(id: impl Into<String>, outcomes: &[&'static str], func: Func) -> Self
    where
        Func: Fn(WorkflowSnapshot<F>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StageResult<F::Patch>, StageError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            outcomes: outcomes.to_vec(),
            func: Arc::new(move |snapshot| Box::pin(func(snapshot))),
        }
    }
}

impl<F: FieldSet> fmt::Debug for FnStage<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStage")
            .field("id", &self.id)
            .field("outcomes", &self.outcomes)
            .finish()
    }
}

#[async_trait]
impl<F: FieldSet> Stage<F> for FnStage<F> {
    fn id(&self) -> &str {
        &self.id
    }

    fn outcomes(&self) -> &[&'static str] {
        &self.outcomes
    }

    async fn execute(
        &self,
        snapshot: &WorkflowSnapshot<F>,
    ) -> Result<StageResult<F::Patch>, StageError> {
        (self.func)(snapshot.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{DynamicFields, DynamicPatch};

    #[tokio::test]
    async fn test_fn_stage_executes_closure() {
        let stage = FnStage::<DynamicFields>::new("double", &["doubled"], |snap| async move {
            let n = snap.fields.get_i64("n").unwrap_or(0);
            Ok(StageResult::new("doubled").with_patch(DynamicPatch::new().set("n", n * 2)))
        });

        assert_eq!(stage.id(), "double");
        assert_eq!(stage.outcomes(), &["doubled"]);

        let snapshot = WorkflowSnapshot::new("wf", DynamicFields::new().with("n", 21));
        let result = stage.execute(&snapshot).await.unwrap();
        assert_eq!(result.status, "doubled");
        assert_eq!(result.patch, DynamicPatch::new().set("n", 42));
    }

    #[test]
    fn test_result_builders() {
        let result: StageResult<DynamicPatch> = StageResult::new("failed")
            .log("[x] one")
            .with_error("boom")
            .reset_attempts("k");
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert_eq!(result.reset_attempts, vec!["k"]);
        assert_eq!(result.audit, vec!["[x] one", "[attempts] counter 'k' reset"]);
    }
}
