//! Immutable workflow snapshots
//!
//! [`WorkflowSnapshot`] is the single source of truth for one workflow instance.
//! Every method that "changes" a snapshot takes `&self` and returns a new value;
//! the audit log is only ever extended.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::fields::FieldSet;
use crate::stage::{StageId, StageResult};

/// Outcome tag of the last completed stage
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Status(String);

impl Status {
    /// Status of a freshly created snapshot
    pub const START: &'static str = "start";

    /// Create a status tag
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The initial status
    pub fn start() -> Self {
        Self(Self::START.to_string())
    }

    /// Tag as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the initial status
    pub fn is_start(&self) -> bool {
        self.0 == Self::START
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Status {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

impl From<String> for Status {
    fn from(tag: String) -> Self {
        Self(tag)
    }
}

impl PartialEq<str> for Status {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Status {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Engine-level lifecycle of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Stages remain to be executed
    #[default]
    Running,
    /// Router reached the terminal route without an error
    Succeeded,
    /// Terminal with `error` populated
    Failed,
}

impl Phase {
    /// Whether the workflow is finished
    pub fn is_terminal(self) -> bool {
        !matches!(self, Phase::Running)
    }

    /// Whether the workflow ended in failure
    pub fn is_failed(self) -> bool {
        matches!(self, Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Running => "running",
            Phase::Succeeded => "succeeded",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One counter per named loop; absent keys read as zero
///
/// Counters only go up. The engine increments a counter each time the router
/// takes that loop's back edge; a stage may reset one explicitly through
/// [`StageResult::reset_attempts`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptCounters(BTreeMap<String, u32>);

impl AttemptCounters {
    /// Current value of a counter
    pub fn get(&self, loop_key: &str) -> u32 {
        self.0.get(loop_key).copied().unwrap_or(0)
    }

    /// Copy with one counter incremented
    pub fn incremented(&self, loop_key: &str) -> Self {
        let mut next = self.clone();
        let counter = next.0.entry(loop_key.to_string()).or_insert(0);
        *counter = counter.saturating_add(1);
        next
    }

    /// Copy with one counter back at zero
    pub fn reset(&self, loop_key: &str) -> Self {
        let mut next = self.clone();
        next.0.remove(loop_key);
        next
    }

    /// Non-zero counters in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Immutable state record of one workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "F: FieldSet")]
pub struct WorkflowSnapshot<F: FieldSet> {
    /// Stable workflow identity
    pub workflow_id: String,

    /// `F::SCHEMA_VERSION` at creation time
    pub schema_version: u32,

    /// Business data accumulated so far
    pub fields: F,

    /// Per-loop attempt counters
    #[serde(default)]
    pub attempts: AttemptCounters,

    /// Outcome of the last completed stage
    pub status: Status,

    /// Stage that produced `status`; `None` before the first stage
    #[serde(default)]
    pub last_stage: Option<StageId>,

    /// Append-only history
    #[serde(default)]
    pub audit_log: Vec<String>,

    /// Terminal failure description
    #[serde(default)]
    pub error: Option<String>,

    /// Stage executions so far
    #[serde(default)]
    pub steps: u64,

    /// Lifecycle phase
    #[serde(default)]
    pub phase: Phase,
}

impl<F: FieldSet> WorkflowSnapshot<F> {
    /// Fresh snapshot: status `start`, zero counters, empty log
    pub fn new(workflow_id: impl Into<String>, fields: F) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            schema_version: F::SCHEMA_VERSION,
            fields,
            attempts: AttemptCounters::default(),
            status: Status::start(),
            last_stage: None,
            audit_log: Vec::new(),
            error: None,
            steps: 0,
            phase: Phase::Running,
        }
    }

    /// Overlay a stage result, producing the next snapshot.
    ///
    /// Fields not named by the patch are preserved; the result's audit lines are
    /// appended after the existing log; a result error replaces no earlier error
    /// unless it is set.
    pub fn merge(&self, stage: &str, result: &StageResult<F::Patch>) -> Self {
        let mut attempts = self.attempts.clone();
        for key in &result.reset_attempts {
            attempts = attempts.reset(key);
        }

        let mut audit_log = Vec::with_capacity(self.audit_log.len() + result.audit.len());
        audit_log.extend(self.audit_log.iter().cloned());
        audit_log.extend(result.audit.iter().cloned());

        Self {
            workflow_id: self.workflow_id.clone(),
            schema_version: self.schema_version,
            fields: self.fields.apply(&result.patch),
            attempts,
            status: result.status.clone(),
            last_stage: Some(stage.to_string()),
            audit_log,
            error: result.error.clone().or_else(|| self.error.clone()),
            steps: self.steps + 1,
            phase: self.phase,
        }
    }

    /// Copy with one more audit line
    pub fn with_audit(&self, line: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.audit_log.push(line.into());
        next
    }

    /// Copy with a loop counter incremented
    pub fn with_attempt(&self, loop_key: &str) -> Self {
        let mut next = self.clone();
        next.attempts = self.attempts.incremented(loop_key);
        next
    }

    /// Terminal copy: `Failed` if an error is set, else `Succeeded`
    pub fn finished(&self) -> Self {
        let mut next = self.clone();
        next.phase = if self.error.is_some() {
            Phase::Failed
        } else {
            Phase::Succeeded
        };
        next
    }

    /// Terminal failure copy with a diagnostic error and audit line
    pub fn failed(&self, error: impl Into<String>) -> Self {
        let error = error.into();
        let mut next = self.with_audit(format!("[engine] {}", error));
        next.error = Some(error);
        next.phase = Phase::Failed;
        next
    }

    /// Whether the workflow is finished
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}
