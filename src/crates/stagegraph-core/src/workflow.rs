//! Workflow definition and build-time validation
//!
//! A [`Workflow`] bundles the stages of a graph, its routing table and its loop
//! registry. It is assembled with [`WorkflowBuilder`], whose `build()` refuses
//! inconsistent graphs before anything runs:
//!
//! 1. an entry stage is set and registered
//! 2. every edge starts at a registered stage and names one of its declared outcomes
//! 3. every declared outcome of every stage has an edge
//! 4. every fixed target and every loop back edge points at a registered stage
//! 5. every loop edge names a registered loop key, and every `reset_by` key is registered
//!
//! Computed targets can only be checked when taken; the router reports them as
//! [`RouteError::UnknownStage`](crate::RouteError::UnknownStage).
//!
//! ```rust
//! use stagegraph_core::{Decision, DynamicFields, FnStage, StageResult, WorkflowBuilder};
//!
//! let workflow = WorkflowBuilder::<DynamicFields>::new("hello")
//!     .stage(FnStage::new("greet", &["done"], |_| async { Ok(StageResult::new("done")) }))
//!     .entry("greet")
//!     .edge("greet", "done", Decision::terminal())
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(workflow.entry(), "greet");
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::fields::FieldSet;
use crate::guard::{LoopRegistry, LoopSpec};
use crate::router::{Decision, Route, Router};
use crate::stage::{Stage, StageId};

/// Validated workflow graph
pub struct Workflow<F: FieldSet> {
    name: String,
    stages: HashMap<StageId, Arc<dyn Stage<F>>>,
    order: Vec<StageId>,
    router: Router<F>,
}

impl<F: FieldSet> Workflow<F> {
    /// Workflow name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entry stage id
    pub fn entry(&self) -> &str {
        self.router.entry()
    }

    /// Look up a stage
    pub fn stage(&self, id: &str) -> Option<&Arc<dyn Stage<F>>> {
        self.stages.get(id)
    }

    /// Stage ids in registration order
    pub fn stage_ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Routing table
    pub fn router(&self) -> &Router<F> {
        &self.router
    }

    /// Loop registry
    pub fn loops(&self) -> &LoopRegistry {
        self.router.loops()
    }

    /// Stage executions a run may need without any graph bug
    ///
    /// See [`LoopRegistry::step_budget`]; follows overridden ceilings.
    pub fn step_budget(&self) -> u64 {
        self.loops().step_budget(self.stages.len())
    }

    /// Override loop ceilings (from `[loops]` configuration)
    pub fn with_loop_ceilings(mut self, overrides: &HashMap<String, u32>) -> Result<Self> {
        self.router.loops_mut().apply_overrides(overrides)?;
        Ok(self)
    }

    /// Human-readable outline: stages with their outcomes, then loops
    pub fn describe(&self) -> String {
        let mut out = format!("workflow '{}' (entry: {})\n", self.name, self.entry());
        for id in &self.order {
            if let Some(stage) = self.stages.get(id) {
                out.push_str(&format!("  stage {}\n", id));
                for outcome in stage.outcomes() {
                    let edge = match self.router.decision(id, outcome) {
                        Some(Decision::Direct(target)) => match target.fixed() {
                            Some(route) => route.to_string(),
                            None => "<computed>".to_string(),
                        },
                        Some(Decision::Loop { key, back, .. }) => {
                            format!("loop '{}' -> {}", key, back)
                        }
                        None => "<unmapped>".to_string(),
                    };
                    out.push_str(&format!("    {} => {}\n", outcome, edge));
                }
            }
        }
        if !self.loops().is_empty() {
            out.push_str("  loops\n");
            for spec in self.loops().iter() {
                out.push_str(&format!(
                    "    {} (ceiling {}) {}\n",
                    spec.key, spec.ceiling, spec.description
                ));
            }
        }
        out
    }
}

impl<F: FieldSet> fmt::Debug for Workflow<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("stages", &self.order)
            .field("router", &self.router)
            .finish()
    }
}

/// Builder for [`Workflow`]
pub struct WorkflowBuilder<F: FieldSet> {
    name: String,
    entry: Option<StageId>,
    stages: HashMap<StageId, Arc<dyn Stage<F>>>,
    order: Vec<StageId>,
    edges: Vec<(StageId, String, Decision<F>)>,
    loops: LoopRegistry,
    duplicates: Vec<StageId>,
}

impl<F: FieldSet> WorkflowBuilder<F> {
    /// Start a workflow definition
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry: None,
            stages: HashMap::new(),
            order: Vec::new(),
            edges: Vec::new(),
            loops: LoopRegistry::new(),
            duplicates: Vec::new(),
        }
    }

    /// Register a stage
    pub fn stage(self, stage: impl Stage<F> + 'static) -> Self {
        self.shared_stage(Arc::new(stage))
    }

    /// Register an already shared stage
    pub fn shared_stage(mut self, stage: Arc<dyn Stage<F>>) -> Self {
        let id = stage.id().to_string();
        if self.stages.insert(id.clone(), stage).is_some() {
            self.duplicates.push(id);
        } else {
            self.order.push(id);
        }
        self
    }

    /// Set the entry stage
    pub fn entry(mut self, id: impl Into<String>) -> Self {
        self.entry = Some(id.into());
        self
    }

    /// Route `status` of `stage`
    pub fn edge(mut self, stage: impl Into<String>, status: impl Into<String>, decision: Decision<F>) -> Self {
        self.edges.push((stage.into(), status.into(), decision));
        self
    }

    /// Declare a loop
    pub fn loop_spec(mut self, spec: LoopSpec) -> Self {
        self.loops.register(spec);
        self
    }

    /// Declare several loops at once
    pub fn loops(mut self, registry: LoopRegistry) -> Self {
        for spec in registry.iter() {
            self.loops.register(spec.clone());
        }
        self
    }

    /// Validate and freeze the graph
    pub fn build(self) -> Result<Workflow<F>> {
        let WorkflowBuilder {
            name,
            entry,
            stages,
            order,
            edges,
            loops,
            duplicates,
        } = self;

        if let Some(id) = duplicates.first() {
            return Err(EngineError::Validation(format!("stage '{}' registered twice", id)));
        }

        let entry = entry.ok_or_else(|| EngineError::Validation("no entry stage set".to_string()))?;
        if !stages.contains_key(&entry) {
            return Err(EngineError::Validation(format!(
                "entry stage '{}' is not registered",
                entry
            )));
        }

        let known = |id: &str| -> Result<()> {
            if stages.contains_key(id) {
                Ok(())
            } else {
                Err(EngineError::Validation(format!("edge targets unknown stage '{}'", id)))
            }
        };

        let mut table: HashMap<StageId, HashMap<String, Decision<F>>> = HashMap::new();
        for (from, status, decision) in edges {
            let stage = stages.get(&from).ok_or_else(|| {
                EngineError::Validation(format!("edge from unknown stage '{}'", from))
            })?;
            if !stage.outcomes().iter().any(|outcome| *outcome == status) {
                return Err(EngineError::Validation(format!(
                    "edge for undeclared outcome '{}' of stage '{}'",
                    status, from
                )));
            }

            match &decision {
                Decision::Direct(target) => {
                    if let Some(Route::Stage(id)) = target.fixed() {
                        known(id)?;
                    }
                }
                Decision::Loop {
                    key, back, forward, ..
                } => {
                    if !loops.contains(key) {
                        return Err(EngineError::Validation(format!(
                            "edge {}/{} uses unregistered loop '{}'",
                            from, status, key
                        )));
                    }
                    known(back)?;
                    if let Some(Route::Stage(id)) = forward.fixed() {
                        known(id)?;
                    }
                }
            }

            let per_stage = table.entry(from.clone()).or_default();
            if per_stage.insert(status.clone(), decision).is_some() {
                return Err(EngineError::Validation(format!(
                    "duplicate edge for {}/{}",
                    from, status
                )));
            }
        }

        for spec in loops.iter() {
            if let Some(key) = spec.reset_by.iter().find(|key| !loops.contains(key)) {
                return Err(EngineError::Validation(format!(
                    "loop '{}' is reset by unregistered loop '{}'",
                    spec.key, key
                )));
            }
        }

        // sorted for a deterministic error message
        let mut unmapped: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (id, stage) in &stages {
            for outcome in stage.outcomes() {
                let mapped = table
                    .get(id)
                    .is_some_and(|per_stage| per_stage.contains_key(*outcome));
                if !mapped {
                    unmapped.entry(id.as_str()).or_default().push(*outcome);
                }
            }
        }
        if let Some((id, outcomes)) = unmapped.into_iter().next() {
            return Err(EngineError::Validation(format!(
                "stage '{}' has no edge for outcome(s): {}",
                id,
                outcomes.join(", ")
            )));
        }

        let ids: HashSet<StageId> = stages.keys().cloned().collect();
        tracing::debug!(
            workflow = %name,
            stages = ids.len(),
            loops = loops.len(),
            "Workflow validated"
        );

        Ok(Workflow {
            name,
            stages,
            order,
            router: Router::new(entry, ids, table, loops),
        })
    }
}
