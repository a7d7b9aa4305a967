//! Turns resource definitions into a validated [`ResourceGraph`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use super::dag::ResourceGraph;
use super::node::ResourceNode;
use super::reference::collect_references;
use crate::config::ResourceSpec;
use crate::error::BuildError;
use crate::provider::ProviderRegistry;

/// Builds resource graphs, checking types against a provider registry.
#[derive(Debug)]
pub struct GraphBuilder<'a> {
    registry: &'a ProviderRegistry,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl<'a> GraphBuilder<'a> {
    /// Creates a builder using `registry` to recognise resource types.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Builds the graph for a set of resource definitions.
    ///
    /// # Errors
    ///
    /// Returns a [`BuildError`] if a type is unknown, properties are
    /// rejected by the provider, a reference is malformed or dangling, or
    /// the dependencies form a cycle.
    pub fn build(
        &self,
        resources: &BTreeMap<String, ResourceSpec>,
    ) -> Result<ResourceGraph, BuildError> {
        let mut nodes = BTreeMap::new();

        for (name, spec) in resources {
            let node = self.build_node(name, spec, resources)?;
            debug!(
                "Resource '{}' ({}) depends on {:?}",
                name, node.resource_type, node.dependencies
            );
            nodes.insert(name.clone(), node);
        }

        if let Some(cycle) = find_cycle(&nodes) {
            return Err(BuildError::CyclicDependency { cycle });
        }

        Ok(ResourceGraph::from_nodes(nodes))
    }

    fn build_node(
        &self,
        name: &str,
        spec: &ResourceSpec,
        resources: &BTreeMap<String, ResourceSpec>,
    ) -> Result<ResourceNode, BuildError> {
        let provider = self.registry.get(&spec.resource_type).ok_or_else(|| {
            BuildError::UnknownResourceType {
                resource: name.to_string(),
                resource_type: spec.resource_type.clone(),
            }
        })?;

        let references =
            collect_references(&spec.properties).map_err(|message| BuildError::InvalidReference {
                resource: name.to_string(),
                message,
            })?;

        provider
            .validate(&spec.properties)
            .map_err(|message| BuildError::InvalidProperties {
                resource: name.to_string(),
                message,
            })?;

        let mut dependencies = BTreeSet::new();
        let targets = spec
            .depends_on
            .iter()
            .map(String::as_str)
            .chain(references.iter().map(|r| r.target.as_str()));

        for target in targets {
            if !resources.contains_key(target) {
                return Err(BuildError::UnresolvedReference {
                    resource: name.to_string(),
                    reference: target.to_string(),
                });
            }
            dependencies.insert(target.to_string());
        }

        Ok(ResourceNode {
            name: name.to_string(),
            resource_type: spec.resource_type.clone(),
            properties: spec.properties.clone(),
            dependencies,
            protect: spec.protect,
        })
    }
}

/// Finds a dependency cycle, returned with its first node repeated at the end.
fn find_cycle(nodes: &BTreeMap<String, ResourceNode>) -> Option<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();

    for name in nodes.keys() {
        if !marks.contains_key(name.as_str())
            && let Some(cycle) = visit(name, nodes, &mut marks, &mut stack)
        {
            return Some(cycle);
        }
    }
    None
}

fn visit<'n>(
    name: &'n str,
    nodes: &'n BTreeMap<String, ResourceNode>,
    marks: &mut HashMap<&'n str, Mark>,
    stack: &mut Vec<&'n str>,
) -> Option<Vec<String>> {
    marks.insert(name, Mark::Visiting);
    stack.push(name);

    if let Some(node) = nodes.get(name) {
        for dep in &node.dependencies {
            match marks.get(dep.as_str()) {
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|n| *n == dep)?;
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(ToString::to_string).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                Some(Mark::Done) => {}
                None => {
                    if let Some(cycle) = visit(dep, nodes, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
        }
    }

    stack.pop();
    marks.insert(name, Mark::Done);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::with_builtins(".")
    }

    fn resources(items: Vec<(&str, ResourceSpec)>) -> BTreeMap<String, ResourceSpec> {
        items.into_iter().map(|(n, s)| (n.to_string(), s)).collect()
    }

    #[test]
    fn test_infers_dependencies_from_references() {
        let registry = registry();
        let graph = GraphBuilder::new(&registry)
            .build(&resources(vec![
                ("vpc", ResourceSpec::new("noop", json!({"cidr": "10.0.0.0/16"}))),
                ("subnet", ResourceSpec::new("noop", json!({"vpc_id": {"ref": "vpc"}}))),
                (
                    "app",
                    ResourceSpec::new("noop", json!({"cidr": "${vpc.cidr}"})).depends_on("subnet"),
                ),
            ]))
            .unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.dependencies("app"), vec!["subnet", "vpc"]);
        assert_eq!(graph.dependencies("subnet"), vec!["vpc"]);
    }

    #[test]
    fn test_two_node_cycle_names_both() {
        let registry = registry();
        let err = GraphBuilder::new(&registry)
            .build(&resources(vec![
                ("a", ResourceSpec::new("noop", json!({"x": {"ref": "b"}}))),
                ("b", ResourceSpec::new("noop", json!({"x": {"ref": "a.id"}}))),
            ]))
            .unwrap_err();

        match err {
            BuildError::CyclicDependency { cycle } => assert_eq!(cycle, vec!["a", "b", "a"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let registry = registry();
        let err = GraphBuilder::new(&registry)
            .build(&resources(vec![(
                "a",
                ResourceSpec::new("noop", json!({"me": "${a}"})),
            )]))
            .unwrap_err();

        assert_eq!(err.to_string(), "Cyclic dependency detected: a -> a");
    }

    #[test]
    fn test_longer_cycle_is_reported_in_order() {
        let registry = registry();
        let err = GraphBuilder::new(&registry)
            .build(&resources(vec![
                ("root", ResourceSpec::new("noop", json!({})).depends_on("x")),
                ("x", ResourceSpec::new("noop", json!({})).depends_on("y")),
                ("y", ResourceSpec::new("noop", json!({})).depends_on("z")),
                ("z", ResourceSpec::new("noop", json!({})).depends_on("x")),
            ]))
            .unwrap_err();

        assert_eq!(err.to_string(), "Cyclic dependency detected: x -> y -> z -> x");
    }

    #[test]
    fn test_unresolved_reference() {
        let registry = registry();
        let err = GraphBuilder::new(&registry)
            .build(&resources(vec![(
                "app",
                ResourceSpec::new("noop", json!({"db": {"ref": "database.host"}})),
            )]))
            .unwrap_err();

        assert!(matches!(
            err,
            BuildError::UnresolvedReference { ref resource, ref reference }
                if resource == "app" && reference == "database"
        ));
    }

    #[test]
    fn test_unresolved_depends_on() {
        let registry = registry();
        let err = GraphBuilder::new(&registry)
            .build(&resources(vec![(
                "app",
                ResourceSpec::new("noop", json!({})).depends_on("ghost"),
            )]))
            .unwrap_err();

        assert!(matches!(err, BuildError::UnresolvedReference { .. }));
    }

    #[test]
    fn test_unknown_type_and_invalid_properties() {
        let registry = registry();
        let builder = GraphBuilder::new(&registry);

        let err = builder
            .build(&resources(vec![("vpc", ResourceSpec::new("aws_vpc", json!({})))]))
            .unwrap_err();
        assert!(matches!(err, BuildError::UnknownResourceType { .. }));

        let err = builder
            .build(&resources(vec![("f", ResourceSpec::new("file", json!({"path": "../x"})))]))
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidProperties { .. }));

        let err = builder
            .build(&resources(vec![("n", ResourceSpec::new("noop", json!({"a": "${"})))]))
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidReference { .. }));
    }
}
