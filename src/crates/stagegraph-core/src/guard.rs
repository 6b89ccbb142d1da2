//! Attempt guard and loop registry
//!
//! Every loop in a workflow graph is declared once in a [`LoopRegistry`] with its
//! key, its ceiling and a short description. The router consults the registry for
//! each loop edge it takes, and the guard answers one question: has this loop used
//! up its budget?
//!
//! Ceilings vary per loop. A cheap, usually convergent loop gets a high ceiling;
//! an expensive one a low ceiling. Operators override them per key through
//! configuration.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{EngineError, Result};
use crate::fields::FieldSet;
use crate::snapshot::WorkflowSnapshot;

/// Whether the loop identified by `loop_key` reached `ceiling`
///
/// Reads the snapshot's counter for the key (absent reads as zero). With a
/// ceiling of `n` the loop may take its back edge `n` times.
pub fn exceeded<F: FieldSet>(snapshot: &WorkflowSnapshot<F>, loop_key: &str, ceiling: u32) -> bool {
    snapshot.attempts.get(loop_key) >= ceiling
}

/// Declaration of one named loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopSpec {
    /// Counter key
    pub key: String,
    /// Maximum number of back-edge traversals
    pub ceiling: u32,
    /// What the loop retries
    #[serde(default)]
    pub description: String,
    /// Most stage executions one round of the loop can add
    #[serde(default = "one")]
    pub span: u32,
    /// Loops whose rounds may reset this loop's counter
    #[serde(default)]
    pub reset_by: Vec<String>,
}

fn one() -> u32 {
    1
}

impl LoopSpec {
    /// Declare a loop whose round is a single stage execution
    pub fn new(key: impl Into<String>, ceiling: u32, description: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ceiling,
            description: description.into(),
            span: 1,
            reset_by: Vec::new(),
        }
    }

    /// Set the stage executions per round
    pub fn with_span(mut self, span: u32) -> Self {
        self.span = span.max(1);
        self
    }

    /// Declare that a round of `loop_key` may reset this counter
    pub fn reset_by(mut self, loop_key: impl Into<String>) -> Self {
        self.reset_by.push(loop_key.into());
        self
    }
}

/// Central registry of every loop in a workflow
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopRegistry {
    loops: BTreeMap<String, LoopSpec>,
}

impl LoopRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration
    pub fn with(mut self, spec: LoopSpec) -> Self {
        self.register(spec);
        self
    }

    /// Register (or replace) a loop
    pub fn register(&mut self, spec: LoopSpec) {
        self.loops.insert(spec.key.clone(), spec);
    }

    /// Ceiling of a loop, `None` if unregistered
    pub fn ceiling(&self, loop_key: &str) -> Option<u32> {
        self.loops.get(loop_key).map(|spec| spec.ceiling)
    }

    /// Declaration of a loop
    pub fn get(&self, loop_key: &str) -> Option<&LoopSpec> {
        self.loops.get(loop_key)
    }

    /// Whether a key is registered
    pub fn contains(&self, loop_key: &str) -> bool {
        self.loops.contains_key(loop_key)
    }

    /// Loops in key order
    pub fn iter(&self) -> impl Iterator<Item = &LoopSpec> {
        self.loops.values()
    }

    /// Number of loops
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    /// Whether no loop is registered
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Upper bound on stage executions of a run that only takes bounded loops
    ///
    /// `stages` executions for the forward path, plus `ceiling * span` per loop for
    /// every time its counter can start from zero.
    pub fn step_budget(&self, stages: usize) -> u64 {
        let looping: u64 = self
            .iter()
            .map(|spec| {
                let restarts: u64 = spec
                    .reset_by
                    .iter()
                    .filter_map(|key| self.ceiling(key))
                    .map(u64::from)
                    .sum();
                (1 + restarts) * u64::from(spec.ceiling) * u64::from(spec.span)
            })
            .sum();
        stages as u64 + looping
    }

    /// Replace ceilings from configuration
    ///
    /// Unknown keys and zero ceilings are rejected so a typo in a config file
    /// cannot silently leave a loop at its default.
    pub fn apply_overrides(&mut self, overrides: &HashMap<String, u32>) -> Result<()> {
        for (key, ceiling) in overrides {
            if *ceiling == 0 {
                return Err(EngineError::Config(format!(
                    "ceiling for loop '{}' must be at least 1",
                    key
                )));
            }
            let spec = self.loops.get_mut(key).ok_or_else(|| {
                EngineError::Config(format!("unknown loop key '{}' in [loops]", key))
            })?;
            tracing::debug!(loop_key = %key, from = spec.ceiling, to = ceiling, "Loop ceiling overridden");
            spec.ceiling = *ceiling;
        }
        Ok(())
    }

    /// Whether the loop reached its ceiling; `None` if unregistered
    pub fn exceeded<F: FieldSet>(&self, snapshot: &WorkflowSnapshot<F>, loop_key: &str) -> Option<bool> {
        self.ceiling(loop_key)
            .map(|ceiling| exceeded(snapshot, loop_key, ceiling))
    }
}
