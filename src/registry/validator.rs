use std::collections::{BTreeSet, HashMap};

use crate::error::RegistrationError;
use crate::types::CapabilityDescriptor;

/// Name -> declared dependencies for every registered capability.
pub type DependencyGraph = HashMap<String, BTreeSet<String>>;

/// Checks a candidate descriptor against the registered graph: every
/// dependency must resolve (all missing names reported together), and the
/// union graph must stay acyclic.
pub fn validate(
    descriptor: &CapabilityDescriptor,
    graph: &DependencyGraph,
) -> Result<(), RegistrationError> {
    let missing: Vec<String> = descriptor
        .dependencies
        .iter()
        .filter(|dep| *dep != &descriptor.name && !graph.contains_key(*dep))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(RegistrationError::UnresolvedDependency { missing });
    }

    let mut union = graph.clone();
    union.insert(descriptor.name.clone(), descriptor.dependencies.clone());
    if let Some(cycle) = find_cycle(&descriptor.name, &union) {
        return Err(RegistrationError::CyclicDependency { cycle });
    }
    Ok(())
}

/// Depth-first walk from `start`; returns the first dependency cycle found
/// as the path that closes it.
fn find_cycle(start: &str, graph: &DependencyGraph) -> Option<Vec<String>> {
    let mut path: Vec<String> = Vec::new();
    let mut visited: BTreeSet<String> = BTreeSet::new();
    walk(start, graph, &mut path, &mut visited)
}

fn walk(
    node: &str,
    graph: &DependencyGraph,
    path: &mut Vec<String>,
    visited: &mut BTreeSet<String>,
) -> Option<Vec<String>> {
    if let Some(pos) = path.iter().position(|n| n == node) {
        let mut cycle: Vec<String> = path[pos..].to_vec();
        cycle.push(node.to_string());
        return Some(cycle);
    }
    if visited.contains(node) {
        return None;
    }

    path.push(node.to_string());
    if let Some(deps) = graph.get(node) {
        for dep in deps {
            if let Some(cycle) = walk(dep, graph, path, visited) {
                return Some(cycle);
            }
        }
    }
    path.pop();
    visited.insert(node.to_string());
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::Value;

    use crate::capability::{Capability, ExecutionContext};
    use crate::types::AnalysisInput;

    struct Noop;

    #[async_trait]
    impl Capability for Noop {
        async fn execute(&self, _input: &AnalysisInput, _ctx: &ExecutionContext) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    fn descriptor(name: &str, deps: &[&str]) -> CapabilityDescriptor {
        CapabilityDescriptor::new(name, "1.0.0", Arc::new(Noop))
            .with_dependencies(deps.iter().copied())
    }

    fn graph(edges: &[(&str, &[&str])]) -> DependencyGraph {
        edges
            .iter()
            .map(|(name, deps)| {
                (
                    name.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_reports_every_missing_dependency_at_once() {
        let g = graph(&[("qc", &[])]);
        let err = validate(&descriptor("doe", &["pca", "qc", "interval"]), &g).unwrap_err();
        assert_eq!(
            err,
            RegistrationError::UnresolvedDependency {
                missing: vec!["interval".to_string(), "pca".to_string()],
            },
        );
    }

    #[test]
    fn test_satisfied_dependencies_validate() {
        let g = graph(&[("qc", &[]), ("pca", &["qc"])]);
        validate(&descriptor("doe", &["pca", "qc"]), &g).unwrap();
    }

    #[test]
    fn test_two_node_cycle_is_named() {
        let g = graph(&[("a", &["b"]), ("b", &["a"])]);
        let err = validate(&descriptor("a", &["b"]), &g).unwrap_err();
        assert_eq!(
            err,
            RegistrationError::CyclicDependency {
                cycle: vec!["a".to_string(), "b".to_string(), "a".to_string()],
            },
        );
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = validate(&descriptor("a", &["a"]), &DependencyGraph::new()).unwrap_err();
        assert_eq!(
            err,
            RegistrationError::CyclicDependency {
                cycle: vec!["a".to_string(), "a".to_string()],
            },
        );
    }

    #[test]
    fn test_longer_cycle_through_registered_nodes() {
        let g = graph(&[("b", &["c"]), ("c", &["a"])]);
        let err = validate(&descriptor("a", &["b"]), &g).unwrap_err();
        match err {
            RegistrationError::CyclicDependency { cycle } => {
                assert_eq!(cycle, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_diamond_dependencies_are_not_cycles() {
        let g = graph(&[("base", &[]), ("left", &["base"]), ("right", &["base"])]);
        validate(&descriptor("top", &["left", "right"]), &g).unwrap();
    }
}
