//! Configuration hashing for change detection.
//!
//! This module provides deterministic hashing of specs and property
//! mappings. Hashes are recorded in state and deployment history.

use sha2::{Digest, Sha256};

use super::spec::{DeploySpec, ResourceSpec};

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the entire deployment spec.
    ///
    /// This hash changes when any resource definition changes.
    #[must_use]
    pub fn hash_spec(&self, spec: &DeploySpec) -> String {
        let mut hasher = Sha256::new();

        hasher.update(spec.project.name.as_bytes());
        hasher.update(spec.project.environment.as_bytes());

        // BTreeMap iteration is already sorted by name
        for (name, resource) in &spec.resources {
            hasher.update(name.as_bytes());
            hasher.update(self.hash_resource(resource).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single resource definition.
    #[must_use]
    pub fn hash_resource(&self, resource: &ResourceSpec) -> String {
        let mut hasher = Sha256::new();

        hasher.update(resource.resource_type.as_bytes());
        hasher.update(self.hash_properties(&resource.properties).as_bytes());

        let mut deps: Vec<&String> = resource.depends_on.iter().collect();
        deps.sort_unstable();
        for dep in deps {
            hasher.update(dep.as_bytes());
        }

        hasher.update(if resource.protect { [1u8] } else { [0u8] });

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of a property mapping.
    ///
    /// Object keys serialize in sorted order, so structurally equal
    /// values always hash the same.
    #[must_use]
    pub fn hash_properties(&self, properties: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(properties.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}
