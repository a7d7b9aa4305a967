//! Resource graph nodes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// A desired resource, as declared in the deploy spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    /// Logical name, unique within the graph.
    pub name: String,
    /// Type tag selecting the provider.
    pub resource_type: String,
    /// Desired properties in unresolved form.
    pub properties: Value,
    /// Names of every resource this one depends on, explicit or inferred.
    pub dependencies: BTreeSet<String>,
    /// Refuse plans that delete or replace this resource.
    pub protect: bool,
}

impl ResourceNode {
    /// Returns true if this node depends on `name`.
    #[must_use]
    pub fn depends_on(&self, name: &str) -> bool {
        self.dependencies.contains(name)
    }
}
