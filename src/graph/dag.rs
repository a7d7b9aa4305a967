//! The resource dependency graph.

use std::collections::{BTreeMap, BTreeSet};

use super::node::ResourceNode;

/// A directed acyclic graph of desired resources.
///
/// Edges point from a resource to the resources it depends on. Only
/// [`GraphBuilder`](super::GraphBuilder) constructs non-empty graphs, so
/// every edge target exists and there are no cycles.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: BTreeMap<String, ResourceNode>,
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl ResourceGraph {
    /// Creates a graph with no resources.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a graph from validated nodes.
    pub(super) fn from_nodes(nodes: BTreeMap<String, ResourceNode>) -> Self {
        let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for node in nodes.values() {
            for dep in &node.dependencies {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(node.name.clone());
            }
        }
        Self { nodes, dependents }
    }

    /// Looks up a node by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceNode> {
        self.nodes.get(name)
    }

    /// Returns true if the graph contains `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates nodes in name order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    /// Names of the resources `name` depends on.
    #[must_use]
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        self.nodes
            .get(name)
            .map(|n| n.dependencies.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Names of the resources that depend on `name`.
    #[must_use]
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.dependents
            .get(name)
            .map(|d| d.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Returns nodes so that every node comes after its dependencies.
    ///
    /// Among nodes that are ready at the same time, names sort first.
    #[must_use]
    pub fn topological_order(&self) -> Vec<&ResourceNode> {
        let mut remaining: BTreeMap<&str, usize> = self
            .nodes
            .values()
            .map(|n| (n.name.as_str(), n.dependencies.len()))
            .collect();
        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(name) = ready.pop_first() {
            remaining.remove(name);
            if let Some(node) = self.nodes.get(name) {
                order.push(node);
            }
            for dependent in self.dependents(name) {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        order
    }
}
