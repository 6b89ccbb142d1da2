//! # stagegraph-core - Checkpointed Stage Graphs with Bounded Loops
//!
//! **A workflow engine for long-running, externally-dependent pipelines** built
//! from asynchronous stages joined by conditional edges. Each stage reads an
//! immutable snapshot and returns a partial update; the engine merges it,
//! checkpoints it and asks the router what runs next.
//!
//! ## Overview
//!
//! - **Typed fields** - [`FieldSet`] pairs a record with its patch type and an
//!   explicit, versioned merge
//! - **Conditional routing** - [`Router`] edges keyed by `(stage, status)`
//! - **Bounded loops** - every loop is named in a [`LoopRegistry`] with its own
//!   ceiling; an exhausted loop is demoted to best-effort progress, never repeated
//!   forever
//! - **Checkpoint/resume** - the snapshot is persisted after every stage through
//!   any [`CheckpointStore`](stagegraph_checkpoint::CheckpointStore)
//! - **Failure containment** - stage errors, panics and unmapped statuses end the
//!   workflow in a failed snapshot instead of crashing the caller
//! - **Concurrency** - [`Scheduler`] runs many workflows, each strictly sequential
//!
//! ## Core Concepts
//!
//! ### 1. Snapshot
//!
//! [`WorkflowSnapshot`] carries the workflow id, the fields, the per-loop
//! [`AttemptCounters`], the last [`Status`], an append-only audit log, an optional
//! error and the engine [`Phase`].
//!
//! ### 2. Stage
//!
//! [`Stage::execute`] maps a snapshot to a [`StageResult`]. Stages declare every
//! status they may return, and the [`WorkflowBuilder`] checks that each one has an
//! edge.
//!
//! ### 3. Router and Attempt Guard
//!
//! [`Decision::Direct`] edges go somewhere; [`Decision::Loop`] edges go back
//! while [`guard::exceeded`] says the budget lasts, and forward once it does not.
//!
//! ### 4. Engine
//!
//! [`Engine::run`] starts fresh, [`Engine::resume`] continues from a checkpoint.
//! A global step ceiling stops graphs with unintended cycles.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use stagegraph_checkpoint::InMemoryCheckpointStore;
//! use stagegraph_core::{
//!     Decision, DynamicFields, DynamicPatch, Engine, FnStage, LoopSpec, Route, StageResult,
//!     WorkflowBuilder, WorkflowSnapshot,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let workflow = WorkflowBuilder::<DynamicFields>::new("draft-review")
//!     .stage(FnStage::new("draft", &["drafted"], |snap: WorkflowSnapshot<DynamicFields>| async move {
//!         let n = snap.fields.get_i64("drafts").unwrap_or(0) + 1;
//!         Ok(StageResult::new("drafted").with_patch(DynamicPatch::new().set("drafts", n)))
//!     }))
//!     .stage(FnStage::new("review", &["approved", "rejected"], |snap: WorkflowSnapshot<DynamicFields>| async move {
//!         let status = if snap.fields.get_i64("drafts") >= Some(2) { "approved" } else { "rejected" };
//!         Ok(StageResult::new(status))
//!     }))
//!     .entry("draft")
//!     .loop_spec(LoopSpec::new("redraft", 5, "redraft after review"))
//!     .edge("draft", "drafted", Decision::to("review"))
//!     .edge("review", "approved", Decision::terminal())
//!     .edge("review", "rejected", Decision::looping("redraft", "draft", Route::Terminal))
//!     .build()?;
//!
//! let engine = Engine::new(workflow, Arc::new(InMemoryCheckpointStore::new()));
//! let done = engine.run("doc-1", DynamicFields::new()).await?;
//! assert_eq!(done.status, "approved");
//! assert_eq!(done.attempts.get("redraft"), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## See Also
//!
//! - `stagegraph-checkpoint` - checkpoint stores
//! - `stagegraph-content` - the order-processing content workflow built on this crate

pub mod cancel;
pub mod collaborator;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fields;
pub mod guard;
pub mod router;
pub mod scheduler;
pub mod snapshot;
pub mod stage;
pub mod workflow;

pub use cancel::CancelHandle;
pub use collaborator::{call_collaborator, CallPolicy, CollaboratorError};
pub use config::{EngineConfig, RetentionPolicy};
pub use engine::{Engine, DEFAULT_MAX_STEPS};
pub use error::{EngineError, Result, RouteError, StageError};
pub use events::{
    BroadcastRecorder, CompositeRecorder, EventRecorder, NoopRecorder, RecordError,
    TracingRecorder, WorkflowEvent,
};
pub use fields::{DynamicFields, DynamicPatch, FieldSet};
pub use guard::{LoopRegistry, LoopSpec};
pub use router::{Decision, Route, Router, Target, Transition};
pub use scheduler::Scheduler;
pub use snapshot::{AttemptCounters, Phase, Status, WorkflowSnapshot};
pub use stage::{FnStage, Stage, StageId, StageResult};
pub use workflow::{Workflow, WorkflowBuilder};
