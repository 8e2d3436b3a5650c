//! Dependency-ordered application of deployment units.
//!
//! Units apply strictly one at a time. Ties between units with no ordering
//! constraint are broken by registration order, so the same graph always
//! applies in the same sequence.

use crate::core::props::{OutputPropagator, Outputs, PropsBag, PropsView};
use crate::error::{DeployError, GraphError};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// A named group of resources with declared dependencies.
///
/// `C` is the deploy-time context handed to every unit (clients, state).
pub trait DeploymentUnit<C> {
    fn name(&self) -> &str;

    fn dependencies(&self) -> &[String];

    /// Create or update the unit's resources given the outputs of its
    /// dependencies, and return the outputs it publishes.
    fn apply(&mut self, ctx: &mut C, inputs: &PropsView) -> Result<Outputs, DeployError>;
}

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Apply only these units plus their transitive dependencies.
    pub only: Vec<String>,
    /// Attempts per unit when it fails with a retryable error.
    pub max_attempts: u32,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            only: Vec::new(),
            max_attempts: 1,
        }
    }
}

/// One entry of a computed apply order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub name: String,
    pub dependencies: Vec<String>,
}

/// Result of a run that did not fail.
#[derive(Debug)]
pub struct ApplyReport {
    pub applied: Vec<String>,
    /// Set when the operator stopped the run before this unit.
    pub aborted_before: Option<String>,
    pub not_attempted: Vec<String>,
    /// Registered units left out by the unit filter.
    pub excluded: Vec<String>,
    pub props: PropsBag,
}

impl ApplyReport {
    pub fn is_complete(&self) -> bool {
        self.aborted_before.is_none()
    }
}

/// A run halted by a failing unit, or by a graph defect before any unit ran.
#[derive(Debug, Error)]
#[error("unit '{}' failed ({}): {}", .unit.as_deref().unwrap_or("<graph>"), .error.kind(), .error)]
pub struct ApplyFailure {
    pub unit: Option<String>,
    pub error: DeployError,
    pub attempts: u32,
    pub applied: Vec<String>,
    pub not_attempted: Vec<String>,
    pub props: PropsBag,
}

pub struct DeploymentGraph<C> {
    units: Vec<Box<dyn DeploymentUnit<C>>>,
    index: HashMap<String, usize>,
}

impl<C> Default for DeploymentGraph<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> DeploymentGraph<C> {
    pub fn new() -> Self {
        Self {
            units: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Add a unit. Dependencies may name units registered later, but an
    /// edge that closes a cycle is rejected here, before anything applies.
    pub fn register(&mut self, unit: Box<dyn DeploymentUnit<C>>) -> Result<(), GraphError> {
        let name = unit.name().to_string();
        if self.index.contains_key(&name) {
            return Err(GraphError::DuplicateUnit(name));
        }
        for dep in unit.dependencies() {
            if *dep == name {
                return Err(GraphError::Cycle {
                    path: vec![name.clone(), name],
                });
            }
            if let Some(mut path) = self.path_between(dep, &name) {
                path.insert(0, name.clone());
                return Err(GraphError::Cycle { path });
            }
        }
        debug!(unit = %name, deps = ?unit.dependencies(), "registered unit");
        self.index.insert(name, self.units.len());
        self.units.push(unit);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Unit names in registration order.
    pub fn unit_names(&self) -> Vec<String> {
        self.units.iter().map(|u| u.name().to_string()).collect()
    }

    /// The apply order for `only` (empty = every unit), without applying.
    pub fn plan(&self, only: &[String]) -> Result<Vec<PlanEntry>, GraphError> {
        Ok(self
            .resolve_order(only)?
            .into_iter()
            .map(|i| PlanEntry {
                name: self.units[i].name().to_string(),
                dependencies: self.units[i].dependencies().to_vec(),
            })
            .collect())
    }

    /// Apply every unit in topological order, failing fast.
    pub fn apply_all(&mut self, ctx: &mut C) -> Result<ApplyReport, ApplyFailure> {
        self.apply(ctx, &ApplyOptions::default(), &mut |_| true)
    }

    /// Apply with a unit filter and retry budget. `proceed` is asked before
    /// each unit; returning false stops the run between units.
    pub fn apply(
        &mut self,
        ctx: &mut C,
        opts: &ApplyOptions,
        proceed: &mut dyn FnMut(&str) -> bool,
    ) -> Result<ApplyReport, ApplyFailure> {
        let order = self.resolve_order(&opts.only).map_err(|e| ApplyFailure {
            unit: graph_error_unit(&e),
            error: e.into(),
            attempts: 0,
            applied: Vec::new(),
            not_attempted: self.unit_names(),
            props: PropsBag::default(),
        })?;

        let names: Vec<String> = order
            .iter()
            .map(|&i| self.units[i].name().to_string())
            .collect();
        let excluded: Vec<String> = self
            .unit_names()
            .into_iter()
            .filter(|n| !names.contains(n))
            .collect();

        let mut propagator = OutputPropagator::new();
        for &i in &order {
            propagator.declare(self.units[i].name(), self.units[i].dependencies());
        }

        info!(units = ?names, "apply order resolved");
        let max_attempts = opts.max_attempts.max(1);
        let mut applied = Vec::new();

        for (pos, &i) in order.iter().enumerate() {
            let name = names[pos].clone();
            if !proceed(&name) {
                warn!(unit = %name, "run stopped by operator before unit");
                return Ok(ApplyReport {
                    applied,
                    aborted_before: Some(name),
                    not_attempted: names[pos..].to_vec(),
                    excluded,
                    props: propagator.into_bag(),
                });
            }

            let view = propagator.view_for(&name);
            let unit = &mut self.units[i];
            let mut attempts = 0u32;
            let outcome = loop {
                attempts += 1;
                info!(unit = %name, attempt = attempts, inputs = view.len(), "applying unit");
                match unit.apply(ctx, &view) {
                    Ok(outputs) => break Ok(outputs),
                    Err(e) if e.is_retryable() && attempts < max_attempts => {
                        warn!(unit = %name, attempt = attempts, kind = e.kind(), error = %e, "retrying unit");
                    }
                    Err(e) => break Err(e),
                }
            };

            let published = outcome.and_then(|outputs| {
                propagator
                    .publish_all(&name, outputs)
                    .map_err(DeployError::from)
            });

            match published {
                Ok(()) => {
                    info!(unit = %name, attempts, "unit applied");
                    applied.push(name);
                }
                Err(error) => {
                    error!(unit = %name, attempts, kind = error.kind(), error = %error, "unit failed");
                    return Err(ApplyFailure {
                        unit: Some(name),
                        error,
                        attempts,
                        applied,
                        not_attempted: names[pos + 1..].to_vec(),
                        props: propagator.into_bag(),
                    });
                }
            }
        }

        Ok(ApplyReport {
            applied,
            aborted_before: None,
            not_attempted: Vec::new(),
            excluded,
            props: propagator.into_bag(),
        })
    }

    /// Dependency path from `from` to `target` over registered edges.
    fn path_between(&self, from: &str, target: &str) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if self.dfs(from, target, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs<'a>(
        &'a self,
        node: &'a str,
        target: &str,
        visited: &mut HashSet<&'a str>,
        path: &mut Vec<String>,
    ) -> bool {
        path.push(node.to_string());
        if node == target {
            return true;
        }
        if visited.insert(node) {
            if let Some(&i) = self.index.get(node) {
                for dep in self.units[i].dependencies() {
                    if self.dfs(dep, target, visited, path) {
                        return true;
                    }
                }
            }
        }
        path.pop();
        false
    }

    fn resolve_order(&self, only: &[String]) -> Result<Vec<usize>, GraphError> {
        let selected = self.select(only)?;

        for &i in &selected {
            for dep in self.units[i].dependencies() {
                if !self.index.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        unit: self.units[i].name().to_string(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut done: HashSet<&str> = HashSet::new();
        let mut order = Vec::with_capacity(selected.len());
        while order.len() < selected.len() {
            let next = selected.iter().copied().find(|&i| {
                let unit = &self.units[i];
                !done.contains(unit.name())
                    && unit.dependencies().iter().all(|d| done.contains(d.as_str()))
            });
            match next {
                Some(i) => {
                    done.insert(self.units[i].name());
                    order.push(i);
                }
                None => {
                    let path = selected
                        .iter()
                        .map(|&i| self.units[i].name())
                        .filter(|n| !done.contains(n))
                        .map(|n| n.to_string())
                        .collect();
                    return Err(GraphError::Cycle { path });
                }
            }
        }
        Ok(order)
    }

    /// Indices of the selected units and their dependency closure, in
    /// registration order.
    fn select(&self, only: &[String]) -> Result<Vec<usize>, GraphError> {
        if only.is_empty() {
            return Ok((0..self.units.len()).collect());
        }
        let mut keep = HashSet::new();
        let mut stack = Vec::new();
        for name in only {
            let &i = self
                .index
                .get(name)
                .ok_or_else(|| GraphError::UnknownUnit(name.clone()))?;
            stack.push(i);
        }
        while let Some(i) = stack.pop() {
            if !keep.insert(i) {
                continue;
            }
            for dep in self.units[i].dependencies() {
                match self.index.get(dep) {
                    Some(&d) => stack.push(d),
                    None => {
                        return Err(GraphError::UnknownDependency {
                            unit: self.units[i].name().to_string(),
                            dependency: dep.clone(),
                        })
                    }
                }
            }
        }
        let mut selected: Vec<usize> = keep.into_iter().collect();
        selected.sort_unstable();
        Ok(selected)
    }
}

fn graph_error_unit(error: &GraphError) -> Option<String> {
    match error {
        GraphError::UnknownDependency { unit, .. } | GraphError::MissingInput { unit, .. } => {
            Some(unit.clone())
        }
        GraphError::KeyAlreadyPublished { unit, .. } => Some(unit.clone()),
        GraphError::DuplicateUnit(unit) | GraphError::UnknownUnit(unit) => Some(unit.clone()),
        GraphError::Cycle { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{InvocationError, ProvisioningError};
    use serde_json::json;
    use std::time::Duration;

    /// Records applied unit names in the context.
    struct TestUnit {
        name: String,
        deps: Vec<String>,
        outputs: Vec<(String, serde_json::Value)>,
        reads: Vec<String>,
        failures: Vec<DeployError>,
    }

    impl TestUnit {
        fn new(name: &str, deps: &[&str]) -> Self {
            Self {
                name: name.into(),
                deps: deps.iter().map(|d| d.to_string()).collect(),
                outputs: Vec::new(),
                reads: Vec::new(),
                failures: Vec::new(),
            }
        }

        fn output(mut self, key: &str, value: &str) -> Self {
            self.outputs.push((key.into(), json!(value)));
            self
        }

        fn reads(mut self, key: &str) -> Self {
            self.reads.push(key.into());
            self
        }

        fn failing(mut self, error: DeployError) -> Self {
            self.failures.push(error);
            self
        }

        fn boxed(self) -> Box<dyn DeploymentUnit<Vec<String>>> {
            Box::new(self)
        }
    }

    impl DeploymentUnit<Vec<String>> for TestUnit {
        fn name(&self) -> &str {
            &self.name
        }

        fn dependencies(&self) -> &[String] {
            &self.deps
        }

        fn apply(&mut self, ctx: &mut Vec<String>, inputs: &PropsView) -> Result<Outputs, DeployError> {
            ctx.push(self.name.clone());
            for key in &self.reads {
                inputs.require(key)?;
            }
            if !self.failures.is_empty() {
                return Err(self.failures.remove(0));
            }
            let mut out = Outputs::new();
            for (k, v) in &self.outputs {
                out.push(k.clone(), v.clone());
            }
            Ok(out)
        }
    }

    fn timeout() -> DeployError {
        InvocationError::Timeout {
            physical_resource_id: "id".into(),
            timeout: Duration::from_millis(10),
        }
        .into()
    }

    #[test]
    fn test_ties_broken_by_registration_order() {
        let mut graph = DeploymentGraph::new();
        graph.register(TestUnit::new("c", &["a"]).boxed()).unwrap();
        graph.register(TestUnit::new("a", &[]).boxed()).unwrap();
        graph.register(TestUnit::new("b", &[]).boxed()).unwrap();
        let mut visits = Vec::new();
        let report = graph.apply_all(&mut visits).unwrap();
        assert_eq!(visits, vec!["a", "c", "b"]);
        assert_eq!(report.applied, visits);
        assert!(report.is_complete());
    }

    #[test]
    fn test_diamond_visits_each_unit_once_after_dependencies() {
        let mut graph = DeploymentGraph::new();
        graph.register(TestUnit::new("d", &["b", "c"]).boxed()).unwrap();
        graph.register(TestUnit::new("b", &["a"]).boxed()).unwrap();
        graph.register(TestUnit::new("c", &["a"]).boxed()).unwrap();
        graph.register(TestUnit::new("a", &[]).boxed()).unwrap();
        let mut visits = Vec::new();
        graph.apply_all(&mut visits).unwrap();
        assert_eq!(visits, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_cycle_rejected_at_register() {
        let mut graph = DeploymentGraph::new();
        graph.register(TestUnit::new("a", &["b"]).boxed()).unwrap();
        let err = graph.register(TestUnit::new("b", &["a"]).boxed()).unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                path: vec!["b".into(), "a".into(), "b".into()]
            }
        );
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_longer_cycle_rejected() {
        let mut graph = DeploymentGraph::new();
        graph.register(TestUnit::new("a", &["b"]).boxed()).unwrap();
        graph.register(TestUnit::new("b", &["c"]).boxed()).unwrap();
        let err = graph.register(TestUnit::new("c", &["a"]).boxed()).unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let mut graph: DeploymentGraph<Vec<String>> = DeploymentGraph::new();
        let err = graph.register(TestUnit::new("a", &["a"]).boxed()).unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut graph = DeploymentGraph::new();
        graph.register(TestUnit::new("a", &[]).boxed()).unwrap();
        assert_eq!(
            graph.register(TestUnit::new("a", &[]).boxed()).unwrap_err(),
            GraphError::DuplicateUnit("a".into())
        );
    }

    #[test]
    fn test_unknown_dependency_fails_before_any_apply() {
        let mut graph = DeploymentGraph::new();
        graph.register(TestUnit::new("a", &[]).boxed()).unwrap();
        graph.register(TestUnit::new("b", &["ghost"]).boxed()).unwrap();
        let mut visits = Vec::new();
        let failure = graph.apply_all(&mut visits).unwrap_err();
        assert!(visits.is_empty());
        assert_eq!(failure.error.kind(), "UnknownDependencyError");
        assert_eq!(failure.unit.as_deref(), Some("b"));
    }

    #[test]
    fn test_failed_dependency_stops_dependents() {
        let mut graph = DeploymentGraph::new();
        graph.register(TestUnit::new("independent", &[]).boxed()).unwrap();
        graph
            .register(
                TestUnit::new("a", &[])
                    .failing(ProvisioningError::NameCollision { name: "k".into() }.into())
                    .boxed(),
            )
            .unwrap();
        graph.register(TestUnit::new("b", &["a"]).boxed()).unwrap();
        let mut visits = Vec::new();
        let failure = graph.apply_all(&mut visits).unwrap_err();
        assert_eq!(visits, vec!["independent", "a"]);
        assert_eq!(failure.unit.as_deref(), Some("a"));
        assert_eq!(failure.applied, vec!["independent"]);
        assert_eq!(failure.not_attempted, vec!["b"]);
        assert_eq!(failure.error.kind(), "NameCollisionError");
    }

    #[test]
    fn test_retryable_failure_retried_within_budget() {
        let mut graph = DeploymentGraph::new();
        graph
            .register(TestUnit::new("a", &[]).failing(timeout()).output("k", "v").boxed())
            .unwrap();
        let mut visits = Vec::new();
        let opts = ApplyOptions {
            max_attempts: 2,
            ..Default::default()
        };
        let report = graph.apply(&mut visits, &opts, &mut |_| true).unwrap();
        assert_eq!(visits, vec!["a", "a"]);
        assert_eq!(report.props.get("k"), Some(&json!("v")));
    }

    #[test]
    fn test_retry_budget_exhausted() {
        let mut graph = DeploymentGraph::new();
        graph
            .register(
                TestUnit::new("a", &[])
                    .failing(timeout())
                    .failing(timeout())
                    .boxed(),
            )
            .unwrap();
        let mut visits = Vec::new();
        let opts = ApplyOptions {
            max_attempts: 2,
            ..Default::default()
        };
        let failure = graph.apply(&mut visits, &opts, &mut |_| true).unwrap_err();
        assert_eq!(failure.attempts, 2);
        assert_eq!(failure.error.kind(), "TimeoutError");
    }

    #[test]
    fn test_reconciliation_errors_not_retried() {
        let mut graph = DeploymentGraph::new();
        graph
            .register(
                TestUnit::new("a", &[])
                    .failing(
                        ProvisioningError::SecretStore {
                            location: "p/k/private".into(),
                            message: "exists".into(),
                        }
                        .into(),
                    )
                    .boxed(),
            )
            .unwrap();
        let mut visits = Vec::new();
        let opts = ApplyOptions {
            max_attempts: 3,
            ..Default::default()
        };
        let failure = graph.apply(&mut visits, &opts, &mut |_| true).unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert_eq!(visits, vec!["a"]);
    }

    #[test]
    fn test_duplicate_key_fails_without_partial_merge() {
        let mut graph = DeploymentGraph::new();
        graph
            .register(TestUnit::new("a", &[]).output("shared", "1").boxed())
            .unwrap();
        graph
            .register(
                TestUnit::new("b", &["a"])
                    .output("own", "x")
                    .output("shared", "2")
                    .boxed(),
            )
            .unwrap();
        let mut visits = Vec::new();
        let failure = graph.apply_all(&mut visits).unwrap_err();
        assert_eq!(failure.error.kind(), "KeyAlreadyPublishedError");
        assert!(!failure.props.contains_key("own"));
        assert_eq!(failure.props.get("shared"), Some(&json!("1")));
    }

    #[test]
    fn test_sibling_outputs_invisible() {
        let mut graph = DeploymentGraph::new();
        graph.register(TestUnit::new("root", &[]).boxed()).unwrap();
        graph
            .register(TestUnit::new("left", &["root"]).output("left_key", "l").boxed())
            .unwrap();
        graph
            .register(TestUnit::new("right", &["root"]).reads("left_key").boxed())
            .unwrap();
        let mut visits = Vec::new();
        let failure = graph.apply_all(&mut visits).unwrap_err();
        assert_eq!(failure.error.kind(), "MissingInputError");
        assert_eq!(failure.unit.as_deref(), Some("right"));
    }

    #[test]
    fn test_filter_applies_dependency_closure() {
        let mut graph = DeploymentGraph::new();
        graph.register(TestUnit::new("a", &[]).boxed()).unwrap();
        graph.register(TestUnit::new("b", &[]).boxed()).unwrap();
        graph.register(TestUnit::new("c", &["a"]).boxed()).unwrap();
        let mut visits = Vec::new();
        let opts = ApplyOptions {
            only: vec!["c".into()],
            ..Default::default()
        };
        let report = graph.apply(&mut visits, &opts, &mut |_| true).unwrap();
        assert_eq!(visits, vec!["a", "c"]);
        assert_eq!(report.excluded, vec!["b"]);
    }

    #[test]
    fn test_filter_unknown_unit() {
        let mut graph: DeploymentGraph<Vec<String>> = DeploymentGraph::new();
        graph.register(TestUnit::new("a", &[]).boxed()).unwrap();
        assert_eq!(
            graph.plan(&["zzz".to_string()]).unwrap_err(),
            GraphError::UnknownUnit("zzz".into())
        );
    }

    #[test]
    fn test_operator_abort_between_units() {
        let mut graph = DeploymentGraph::new();
        graph.register(TestUnit::new("a", &[]).boxed()).unwrap();
        graph.register(TestUnit::new("b", &["a"]).boxed()).unwrap();
        graph.register(TestUnit::new("c", &["b"]).boxed()).unwrap();
        let mut visits = Vec::new();
        let report = graph
            .apply(&mut visits, &ApplyOptions::default(), &mut |name| name != "b")
            .unwrap();
        assert_eq!(visits, vec!["a"]);
        assert_eq!(report.aborted_before.as_deref(), Some("b"));
        assert_eq!(report.not_attempted, vec!["b", "c"]);
        assert!(!report.is_complete());
    }

    #[test]
    fn test_plan_lists_order_and_deps() {
        let mut graph: DeploymentGraph<Vec<String>> = DeploymentGraph::new();
        graph.register(TestUnit::new("b", &["a"]).boxed()).unwrap();
        graph.register(TestUnit::new("a", &[]).boxed()).unwrap();
        let plan = graph.plan(&[]).unwrap();
        assert_eq!(plan[0].name, "a");
        assert_eq!(plan[1].dependencies, vec!["a".to_string()]);
    }
}
