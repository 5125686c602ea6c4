//! Dependency resolution over the component catalog
//!
//! Nodes live in an arena indexed by catalog position. Cycle detection is an
//! iterative DFS with an explicit frame stack, so malformed catalogs of any
//! depth cannot overflow the call stack. Ordering uses Kahn's algorithm with
//! a min-heap on catalog index, which keeps siblings in declaration order.

use crate::error::{EngineError, Result};
use envsmith_core::Catalog;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Why a component was left out of the install order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionFailure {
    CircularDependency { component: String, cycle: Vec<String> },
    MissingDependency { component: String, missing: String },
    DependencyFailed { component: String, dependency: String },
}

impl ResolutionFailure {
    pub fn component(&self) -> &str {
        match self {
            ResolutionFailure::CircularDependency { component, .. }
            | ResolutionFailure::MissingDependency { component, .. }
            | ResolutionFailure::DependencyFailed { component, .. } => component,
        }
    }

    pub fn to_error(&self) -> EngineError {
        match self.clone() {
            ResolutionFailure::CircularDependency { component, cycle } => {
                EngineError::CircularDependency { component, cycle }
            }
            ResolutionFailure::MissingDependency { component, missing } => {
                EngineError::MissingDependency { component, missing }
            }
            ResolutionFailure::DependencyFailed {
                component,
                dependency,
            } => EngineError::DependencyFailed {
                component,
                dependency,
            },
        }
    }
}

/// Install order plus the components that could not be ordered
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Resolution {
    /// Dependencies always precede dependents
    pub order: Vec<String>,
    /// Sorted by catalog position
    pub failures: Vec<ResolutionFailure>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failure_for(&self, id: &str) -> Option<&ResolutionFailure> {
        self.failures.iter().find(|f| f.component() == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|o| o == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Unvisited,
    Visiting,
    Resolved,
}

#[derive(Debug, Clone)]
enum Edge {
    Known(usize),
    Missing(String),
}

/// Arena-indexed dependency graph
struct DependencyGraph<'a> {
    ids: Vec<&'a str>,
    edges: Vec<Vec<Edge>>,
    /// Nodes taking part in this resolution
    included: Vec<bool>,
}

impl<'a> DependencyGraph<'a> {
    fn build(catalog: &'a Catalog) -> Self {
        let components: Vec<_> = catalog.iter().collect();
        let ids: Vec<&str> = components.iter().map(|c| c.id.as_str()).collect();
        let edges = components
            .iter()
            .map(|c| {
                c.dependencies
                    .iter()
                    .map(|dep| match catalog.index_of(dep) {
                        Some(j) => Edge::Known(j),
                        None => Edge::Missing(dep.clone()),
                    })
                    .collect()
            })
            .collect();
        // Duplicate declarations resolve to the first one
        let included = components
            .iter()
            .enumerate()
            .map(|(i, c)| catalog.index_of(&c.id) == Some(i))
            .collect();

        Self {
            ids,
            edges,
            included,
        }
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn known_deps(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        self.edges[node].iter().filter_map(|e| match e {
            Edge::Known(j) => Some(*j),
            Edge::Missing(_) => None,
        })
    }

    /// Keep only `roots` and everything they transitively depend on
    fn restrict_to(&mut self, roots: &[usize]) {
        let mut keep = vec![false; self.len()];
        let mut stack: Vec<usize> = roots.to_vec();
        while let Some(node) = stack.pop() {
            if keep[node] || !self.included[node] {
                continue;
            }
            keep[node] = true;
            stack.extend(self.known_deps(node));
        }
        self.included = keep;
    }
}

/// Computes install order for a catalog; performs no I/O
pub struct DependencyResolver<'a> {
    catalog: &'a Catalog,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    /// Resolve the whole catalog
    pub fn resolve(&self) -> Resolution {
        let graph = DependencyGraph::build(self.catalog);
        Self::run(&graph)
    }

    /// Resolve `targets` and their transitive dependencies only
    pub fn resolve_for<S: AsRef<str>>(&self, targets: &[S]) -> Result<Resolution> {
        let mut roots = Vec::with_capacity(targets.len());
        for target in targets {
            let id = target.as_ref();
            let index = self
                .catalog
                .index_of(id)
                .ok_or_else(|| EngineError::UnknownComponent(id.to_string()))?;
            roots.push(index);
        }

        let mut graph = DependencyGraph::build(self.catalog);
        graph.restrict_to(&roots);
        Ok(Self::run(&graph))
    }

    fn run(graph: &DependencyGraph<'_>) -> Resolution {
        let n = graph.len();
        let mut failures: HashMap<usize, ResolutionFailure> = HashMap::new();

        // Unknown dependencies are marked up front and never descended into
        for node in (0..n).filter(|&i| graph.included[i]) {
            let missing = graph.edges[node].iter().find_map(|e| match e {
                Edge::Missing(dep) => Some(dep.clone()),
                Edge::Known(_) => None,
            });
            if let Some(missing) = missing {
                failures.insert(
                    node,
                    ResolutionFailure::MissingDependency {
                        component: graph.ids[node].to_string(),
                        missing,
                    },
                );
            }
        }

        Self::detect_cycles(graph, &mut failures);
        Self::propagate_failures(graph, &mut failures);
        let order = Self::topological_order(graph, &failures);

        let mut failures: Vec<(usize, ResolutionFailure)> = failures.into_iter().collect();
        failures.sort_by_key(|(index, _)| *index);

        Resolution {
            order,
            failures: failures.into_iter().map(|(_, f)| f).collect(),
        }
    }

    fn detect_cycles(graph: &DependencyGraph<'_>, failures: &mut HashMap<usize, ResolutionFailure>) {
        let n = graph.len();
        let mut color = vec![Color::Unvisited; n];
        // (node, next edge to explore)
        let mut stack: Vec<(usize, usize)> = Vec::new();

        for root in 0..n {
            if !graph.included[root] || color[root] != Color::Unvisited {
                continue;
            }
            if failures.contains_key(&root) {
                color[root] = Color::Resolved;
                continue;
            }

            color[root] = Color::Visiting;
            stack.push((root, 0));

            while let Some(frame) = stack.last_mut() {
                let (node, cursor) = *frame;
                let Some(edge) = graph.edges[node].get(cursor) else {
                    color[node] = Color::Resolved;
                    stack.pop();
                    continue;
                };
                frame.1 += 1;

                let Edge::Known(next) = *edge else {
                    continue;
                };

                match color[next] {
                    Color::Unvisited if failures.contains_key(&next) => {
                        color[next] = Color::Resolved;
                    }
                    Color::Unvisited => {
                        color[next] = Color::Visiting;
                        stack.push((next, 0));
                    }
                    Color::Visiting => {
                        let start = stack
                            .iter()
                            .position(|(n, _)| *n == next)
                            .unwrap_or(0);
                        let members: Vec<usize> = stack[start..].iter().map(|(n, _)| *n).collect();
                        let mut cycle: Vec<String> =
                            members.iter().map(|&m| graph.ids[m].to_string()).collect();
                        cycle.push(graph.ids[next].to_string());

                        tracing::debug!("dependency cycle: {}", cycle.join(" -> "));
                        for member in members {
                            failures.entry(member).or_insert_with(|| {
                                ResolutionFailure::CircularDependency {
                                    component: graph.ids[member].to_string(),
                                    cycle: cycle.clone(),
                                }
                            });
                        }
                    }
                    Color::Resolved => {}
                }
            }
        }
    }

    /// Fail every node that depends, directly or not, on a failed node
    fn propagate_failures(
        graph: &DependencyGraph<'_>,
        failures: &mut HashMap<usize, ResolutionFailure>,
    ) {
        loop {
            let mut newly_failed = Vec::new();
            for node in (0..graph.len()).filter(|&i| graph.included[i]) {
                if failures.contains_key(&node) {
                    continue;
                }
                if let Some(dep) = graph.known_deps(node).find(|d| failures.contains_key(d)) {
                    newly_failed.push((node, dep));
                }
            }
            if newly_failed.is_empty() {
                break;
            }
            for (node, dep) in newly_failed {
                failures.insert(
                    node,
                    ResolutionFailure::DependencyFailed {
                        component: graph.ids[node].to_string(),
                        dependency: graph.ids[dep].to_string(),
                    },
                );
            }
        }
    }

    fn topological_order(
        graph: &DependencyGraph<'_>,
        failures: &HashMap<usize, ResolutionFailure>,
    ) -> Vec<String> {
        let n = graph.len();
        let active = |i: usize| graph.included[i] && !failures.contains_key(&i);

        let mut in_degree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for node in (0..n).filter(|&i| active(i)) {
            for dep in graph.known_deps(node) {
                in_degree[node] += 1;
                dependents[dep].push(node);
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
            .filter(|&i| active(i) && in_degree[i] == 0)
            .map(Reverse)
            .collect();

        let mut order = Vec::new();
        while let Some(Reverse(node)) = ready.pop() {
            order.push(graph.ids[node].to_string());
            for &dependent in &dependents[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envsmith_core::types::{Component, InstallMethod, InstallSpec};

    fn component(id: &str, deps: &[&str]) -> Component {
        Component {
            id: id.to_string(),
            category: "general".to_string(),
            version: None,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            install_method: InstallMethod::Manual,
            source: None,
            verify_actions: Vec::new(),
            uninstall_hint: None,
            package_name: None,
            install: InstallSpec::default(),
        }
    }

    #[test]
    fn test_linear_chain() {
        let catalog = Catalog::new(vec![
            component("app", &["lib"]),
            component("lib", &["base"]),
            component("base", &[]),
        ]);
        let resolution = DependencyResolver::new(&catalog).resolve();
        assert_eq!(resolution.order, vec!["base", "lib", "app"]);
        assert!(resolution.is_complete());
    }

    #[test]
    fn test_three_node_cycle_path() {
        let catalog = Catalog::new(vec![
            component("a", &["b"]),
            component("b", &["c"]),
            component("c", &["a"]),
        ]);
        let resolution = DependencyResolver::new(&catalog).resolve();
        assert!(resolution.order.is_empty());
        assert_eq!(
            resolution.failure_for("a"),
            Some(&ResolutionFailure::CircularDependency {
                component: "a".into(),
                cycle: vec!["a".into(), "b".into(), "c".into(), "a".into()],
            })
        );
        assert_eq!(resolution.failures.len(), 3);
    }

    #[test]
    fn test_self_dependency() {
        let catalog = Catalog::new(vec![component("a", &["a"]), component("b", &[])]);
        let resolution = DependencyResolver::new(&catalog).resolve();
        assert_eq!(resolution.order, vec!["b"]);
        assert_eq!(
            resolution.failure_for("a"),
            Some(&ResolutionFailure::CircularDependency {
                component: "a".into(),
                cycle: vec!["a".into(), "a".into()],
            })
        );
    }

    #[test]
    fn test_missing_dependency_and_dependents() {
        let catalog = Catalog::new(vec![
            component("top", &["mid"]),
            component("mid", &["ghost"]),
            component("free", &[]),
        ]);
        let resolution = DependencyResolver::new(&catalog).resolve();
        assert_eq!(resolution.order, vec!["free"]);
        assert_eq!(
            resolution.failures,
            vec![
                ResolutionFailure::DependencyFailed {
                    component: "top".into(),
                    dependency: "mid".into(),
                },
                ResolutionFailure::MissingDependency {
                    component: "mid".into(),
                    missing: "ghost".into(),
                },
            ]
        );
    }

    #[test]
    fn test_siblings_keep_declaration_order() {
        let catalog = Catalog::new(vec![
            component("zeta", &["root"]),
            component("alpha", &["root"]),
            component("root", &[]),
            component("mid", &["root"]),
        ]);
        let resolution = DependencyResolver::new(&catalog).resolve();
        assert_eq!(resolution.order, vec!["root", "zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_resolve_for_restricts_to_closure() {
        let catalog = Catalog::new(vec![
            component("a", &["b"]),
            component("b", &[]),
            component("c", &["d"]),
            component("d", &["c"]),
        ]);
        let resolver = DependencyResolver::new(&catalog);

        let resolution = resolver.resolve_for(&["a"]).unwrap();
        assert_eq!(resolution.order, vec!["b", "a"]);
        assert!(resolution.is_complete());

        assert!(matches!(
            resolver.resolve_for(&["nope"]),
            Err(EngineError::UnknownComponent(_))
        ));
    }

    #[test]
    fn test_dependent_of_cycle_fails() {
        let catalog = Catalog::new(vec![
            component("x", &["y"]),
            component("y", &["x"]),
            component("user", &["x"]),
        ]);
        let resolution = DependencyResolver::new(&catalog).resolve();
        assert!(resolution.order.is_empty());
        assert!(matches!(
            resolution.failure_for("user"),
            Some(ResolutionFailure::DependencyFailed { .. })
        ));
    }

    #[test]
    fn test_deep_chain_does_not_overflow() {
        let n = 50_000;
        let components: Vec<Component> = (0..n)
            .map(|i| {
                let id = format!("c{}", i);
                if i + 1 < n {
                    component(&id, &[&format!("c{}", i + 1)])
                } else {
                    component(&id, &[])
                }
            })
            .collect();
        let catalog = Catalog::new(components);
        let resolution = DependencyResolver::new(&catalog).resolve();
        assert_eq!(resolution.order.len(), n);
        assert_eq!(resolution.order[0], format!("c{}", n - 1));
    }
}
