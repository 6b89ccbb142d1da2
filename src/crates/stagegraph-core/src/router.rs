//! Conditional routing between stages
//!
//! The [`Router`] maps the outcome of the last completed stage to what runs next.
//! Edges are keyed by `(stage, status)` and hold a [`Decision`]:
//!
//! - [`Decision::Direct`] - go to a fixed or computed [`Route`]
//! - [`Decision::Loop`] - take a named loop's back edge unless its ceiling is
//!   reached, in which case proceed along the loop's forward route
//!
//! Routing is pure. [`Router::next`] reads the snapshot and answers with a
//! [`Transition`]; recording the loop attempt and the audit lines is the engine's
//! job.
//!
//! ```text
//!   (last_stage, status) ──► Decision ──► Transition
//!   (none, "start")      ──────────────► Next(entry)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::error::RouteError;
use crate::fields::FieldSet;
use crate::guard::{exceeded, LoopRegistry};
use crate::snapshot::WorkflowSnapshot;
use crate::stage::StageId;

/// Where a workflow goes next
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Execute a stage
    Stage(StageId),
    /// Stop; success unless the snapshot carries an error
    Terminal,
    /// Stop with a diagnostic failure
    Fail(String),
}

impl Route {
    /// Route to a stage
    pub fn stage(id: impl Into<String>) -> Self {
        Route::Stage(id.into())
    }

    /// Failure route
    pub fn fail(reason: impl Into<String>) -> Self {
        Route::Fail(reason.into())
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Stage(id) => write!(f, "{}", id),
            Route::Terminal => write!(f, "end"),
            Route::Fail(reason) => write!(f, "failure ({})", reason),
        }
    }
}

/// Computes a route from the snapshot
pub type RouteFn<F> = Arc<dyn Fn(&WorkflowSnapshot<F>) -> Route + Send + Sync>;

/// Renders the metric reported when a loop is demoted
pub type MetricFn<F> = Arc<dyn Fn(&WorkflowSnapshot<F>) -> String + Send + Sync>;

/// Fixed or computed route
pub enum Target<F: FieldSet> {
    /// Known at build time, validated by the workflow builder
    Fixed(Route),
    /// Depends on fields; validated when taken
    Computed(RouteFn<F>),
}

impl<F: FieldSet> Target<F> {
    /// Computed target from a closure
    pub fn computed<Func>(func: Func) -> Self
    where
        Func: Fn(&WorkflowSnapshot<F>) -> Route + Send + Sync + 'static,
    {
        Target::Computed(Arc::new(func))
    }

    /// Resolve against a snapshot
    pub fn resolve(&self, snapshot: &WorkflowSnapshot<F>) -> Route {
        match self {
            Target::Fixed(route) => route.clone(),
            Target::Computed(func) => func(snapshot),
        }
    }

    /// Route known at build time
    pub fn fixed(&self) -> Option<&Route> {
        match self {
            Target::Fixed(route) => Some(route),
            Target::Computed(_) => None,
        }
    }
}

impl<F: FieldSet> From<Route> for Target<F> {
    fn from(route: Route) -> Self {
        Target::Fixed(route)
    }
}

impl<F: FieldSet> fmt::Debug for Target<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Fixed(route) => f.debug_tuple("Fixed").field(route).finish(),
            Target::Computed(_) => f.write_str("Computed(<fn>)"),
        }
    }
}

/// Edge attached to one `(stage, status)` pair
pub enum Decision<F: FieldSet> {
    /// Unconditional (or field-dependent) forward edge
    Direct(Target<F>),
    /// Loop-back edge gated by an attempt ceiling
    Loop {
        /// Registered loop key
        key: String,
        /// Stage re-entered while the budget lasts
        back: StageId,
        /// Route taken once the ceiling is reached
        forward: Target<F>,
        /// Metric recorded in the demotion audit line
        metric: Option<MetricFn<F>>,
    },
}

impl<F: FieldSet> Decision<F> {
    /// Go to a stage
    pub fn to(stage: impl Into<String>) -> Self {
        Decision::Direct(Target::Fixed(Route::stage(stage)))
    }

    /// Stop
    pub fn terminal() -> Self {
        Decision::Direct(Target::Fixed(Route::Terminal))
    }

    /// Stop with a failure
    pub fn fail(reason: impl Into<String>) -> Self {
        Decision::Direct(Target::Fixed(Route::fail(reason)))
    }

    /// Field-dependent edge
    pub fn branch<Func>(func: Func) -> Self
    where
        Func: Fn(&WorkflowSnapshot<F>) -> Route + Send + Sync + 'static,
    {
        Decision::Direct(Target::computed(func))
    }

    /// Loop back to `back` until `key`'s ceiling, then follow `forward`
    pub fn looping(
        key: impl Into<String>,
        back: impl Into<String>,
        forward: impl Into<Target<F>>,
    ) -> Self {
        Decision::Loop {
            key: key.into(),
            back: back.into(),
            forward: forward.into(),
            metric: None,
        }
    }

    /// Attach a demotion metric to a loop edge (no effect on direct edges)
    pub fn with_metric<Func>(self, func: Func) -> Self
    where
        Func: Fn(&WorkflowSnapshot<F>) -> String + Send + Sync + 'static,
    {
        match self {
            Decision::Loop {
                key, back, forward, ..
            } => Decision::Loop {
                key,
                back,
                forward,
                metric: Some(Arc::new(func)),
            },
            direct => direct,
        }
    }
}

impl<F: FieldSet> fmt::Debug for Decision<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Direct(target) => f.debug_tuple("Direct").field(target).finish(),
            Decision::Loop {
                key, back, forward, ..
            } => f
                .debug_struct("Loop")
                .field("key", key)
                .field("back", back)
                .field("forward", forward)
                .finish(),
        }
    }
}

/// Router answer for the current snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Execute a stage
    Next(StageId),
    /// Take a loop's back edge; the engine records attempt `attempt`
    LoopBack {
        /// Loop key
        loop_key: String,
        /// Stage re-entered
        to: StageId,
        /// Attempt number being started (1-based)
        attempt: u32,
        /// Loop ceiling
        ceiling: u32,
    },
    /// Ceiling reached; proceed with best effort
    Demoted {
        /// Loop key
        loop_key: String,
        /// Counter value at demotion
        attempts: u32,
        /// Loop ceiling
        ceiling: u32,
        /// Forward route taken instead
        to: Route,
        /// Last metric, when the edge defines one
        metric: Option<String>,
    },
    /// Stop; phase derived from the snapshot error
    Terminal,
    /// Stop with a diagnostic failure
    Fail(String),
}

/// Routing table of a workflow
pub struct Router<F: FieldSet> {
    entry: StageId,
    stages: HashSet<StageId>,
    edges: HashMap<StageId, HashMap<String, Decision<F>>>,
    loops: LoopRegistry,
}

impl<F: FieldSet> Router<F> {
    pub(crate) fn new(
        entry: StageId,
        stages: HashSet<StageId>,
        edges: HashMap<StageId, HashMap<String, Decision<F>>>,
        loops: LoopRegistry,
    ) -> Self {
        Self {
            entry,
            stages,
            edges,
            loops,
        }
    }

    /// Entry stage
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Loop registry
    pub fn loops(&self) -> &LoopRegistry {
        &self.loops
    }

    pub(crate) fn loops_mut(&mut self) -> &mut LoopRegistry {
        &mut self.loops
    }

    /// Edge for a `(stage, status)` pair
    pub fn decision(&self, stage: &str, status: &str) -> Option<&Decision<F>> {
        self.edges.get(stage).and_then(|edges| edges.get(status))
    }

    /// Decide what follows `snapshot`
    pub fn next(&self, snapshot: &WorkflowSnapshot<F>) -> Result<Transition, RouteError> {
        let Some(stage) = snapshot.last_stage.as_deref() else {
            if snapshot.status.is_start() {
                return Ok(Transition::Next(self.entry.clone()));
            }
            return Err(RouteError::Unmapped {
                stage: "<none>".to_string(),
                status: snapshot.status.to_string(),
            });
        };

        let decision = self
            .decision(stage, snapshot.status.as_str())
            .ok_or_else(|| RouteError::Unmapped {
                stage: stage.to_string(),
                status: snapshot.status.to_string(),
            })?;

        match decision {
            Decision::Direct(target) => self.transition_for(target.resolve(snapshot)),
            Decision::Loop {
                key,
                back,
                forward,
                metric,
            } => {
                let ceiling = self
                    .loops
                    .ceiling(key)
                    .ok_or_else(|| RouteError::UnknownLoop(key.clone()))?;
                let attempts = snapshot.attempts.get(key);

                if exceeded(snapshot, key, ceiling) {
                    let to = self.checked(forward.resolve(snapshot))?;
                    Ok(Transition::Demoted {
                        loop_key: key.clone(),
                        attempts,
                        ceiling,
                        to,
                        metric: metric.as_ref().map(|m| m(snapshot)),
                    })
                } else {
                    self.check_stage(back)?;
                    Ok(Transition::LoopBack {
                        loop_key: key.clone(),
                        to: back.clone(),
                        attempt: attempts + 1,
                        ceiling,
                    })
                }
            }
        }
    }

    fn transition_for(&self, route: Route) -> Result<Transition, RouteError> {
        Ok(match self.checked(route)? {
            Route::Stage(id) => Transition::Next(id),
            Route::Terminal => Transition::Terminal,
            Route::Fail(reason) => Transition::Fail(reason),
        })
    }

    fn checked(&self, route: Route) -> Result<Route, RouteError> {
        if let Route::Stage(id) = &route {
            self.check_stage(id)?;
        }
        Ok(route)
    }

    fn check_stage(&self, id: &str) -> Result<(), RouteError> {
        if self.stages.contains(id) {
            Ok(())
        } else {
            Err(RouteError::UnknownStage(id.to_string()))
        }
    }
}

impl<F: FieldSet> fmt::Debug for Router<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("entry", &self.entry)
            .field("edges", &self.edges)
            .field("loops", &self.loops)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::DynamicFields;
    use crate::guard::LoopSpec;
    use crate::stage::StageResult;
    use proptest::prelude::*;

    type Snap = WorkflowSnapshot<DynamicFields>;

    fn router(ceiling: u32) -> Router<DynamicFields> {
        let stages: HashSet<StageId> = ["check", "revise", "publish"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut edges: HashMap<StageId, HashMap<String, Decision<DynamicFields>>> = HashMap::new();
        edges.entry("check".into()).or_default().insert(
            "needs_work".into(),
            Decision::looping("revision", "revise", Route::stage("publish"))
                .with_metric(|s: &Snap| format!("score={}", s.fields.get_i64("score").unwrap_or(0))),
        );
        edges
            .entry("check".into())
            .or_default()
            .insert("ok".into(), Decision::to("publish"));
        edges.entry("revise".into()).or_default().insert(
            "revised".into(),
            Decision::branch(|s: &Snap| {
                if s.fields.get_bool("skip_check").unwrap_or(false) {
                    Route::stage("publish")
                } else {
                    Route::stage("check")
                }
            }),
        );
        edges
            .entry("publish".into())
            .or_default()
            .insert("published".into(), Decision::terminal());

        Router::new(
            "check".into(),
            stages,
            edges,
            LoopRegistry::new().with(LoopSpec::new("revision", ceiling, "revise until ok")),
        )
    }

    fn after(stage: &str, status: &str, snap: &Snap) -> Snap {
        snap.merge(stage, &StageResult::new(status))
    }

    #[test]
    fn test_start_routes_to_entry() {
        let snap = Snap::new("wf", DynamicFields::new());
        assert_eq!(router(3).next(&snap), Ok(Transition::Next("check".into())));
    }

    #[test]
    fn test_direct_and_branch_edges() {
        let r = router(3);
        let snap = Snap::new("wf", DynamicFields::new());

        assert_eq!(
            r.next(&after("check", "ok", &snap)),
            Ok(Transition::Next("publish".into()))
        );
        assert_eq!(
            r.next(&after("revise", "revised", &snap)),
            Ok(Transition::Next("check".into()))
        );

        let skipping = Snap::new("wf", DynamicFields::new().with("skip_check", true));
        assert_eq!(
            r.next(&after("revise", "revised", &skipping)),
            Ok(Transition::Next("publish".into()))
        );
        assert_eq!(r.next(&after("publish", "published", &snap)), Ok(Transition::Terminal));
    }

    #[test]
    fn test_unmapped_status_is_error() {
        let snap = after("check", "bogus", &Snap::new("wf", DynamicFields::new()));
        assert_eq!(
            router(3).next(&snap),
            Err(RouteError::Unmapped {
                stage: "check".into(),
                status: "bogus".into()
            })
        );
    }

    #[test]
    fn test_loop_demotes_at_ceiling() {
        let r = router(2);
        let mut snap = after("check", "needs_work", &Snap::new("wf", DynamicFields::new().with("score", 41)));

        for expected_attempt in 1..=2 {
            match r.next(&snap).unwrap() {
                Transition::LoopBack { loop_key, to, attempt, ceiling } => {
                    assert_eq!(loop_key, "revision");
                    assert_eq!(to, "revise");
                    assert_eq!(attempt, expected_attempt);
                    assert_eq!(ceiling, 2);
                }
                other => panic!("expected loop back, got {:?}", other),
            }
            snap = snap.with_attempt("revision");
        }

        assert_eq!(
            r.next(&snap),
            Ok(Transition::Demoted {
                loop_key: "revision".into(),
                attempts: 2,
                ceiling: 2,
                to: Route::stage("publish"),
                metric: Some("score=41".into()),
            })
        );
    }

    #[test]
    fn test_computed_target_to_unknown_stage() {
        let stages: HashSet<StageId> = ["a".to_string()].into_iter().collect();
        let mut edges: HashMap<StageId, HashMap<String, Decision<DynamicFields>>> = HashMap::new();
        edges
            .entry("a".into())
            .or_default()
            .insert("x".into(), Decision::branch(|_: &Snap| Route::stage("ghost")));
        let r = Router::new("a".into(), stages, edges, LoopRegistry::new());

        let snap = after("a", "x", &Snap::new("wf", DynamicFields::new()));
        assert_eq!(r.next(&snap), Err(RouteError::UnknownStage("ghost".into())));
    }

    proptest! {
        #[test]
        fn prop_loops_terminate_within_ceiling_plus_one(ceiling in 0u32..60) {
            let r = router(ceiling);
            let mut snap = after("check", "needs_work", &Snap::new("wf", DynamicFields::new()));
            let mut calls = 0u32;
            loop {
                calls += 1;
                prop_assert!(calls <= ceiling + 1);
                match r.next(&snap).unwrap() {
                    Transition::LoopBack { loop_key, .. } => snap = snap.with_attempt(&loop_key),
                    Transition::Demoted { .. } => break,
                    other => prop_assert!(false, "unexpected {:?}", other),
                }
            }
            prop_assert_eq!(calls, ceiling + 1);
        }
    }
}
