//! Diff engine for comparing the desired graph against recorded state.
//!
//! Properties are compared in their unresolved form, exactly as written
//! in the deploy spec and as recorded by the last apply.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::PlanError;
use crate::graph::reference::collect_references;
use crate::graph::{ResourceGraph, ResourceNode};
use crate::provider::ProviderRegistry;
use crate::state::{DeploymentState, ResourceState, ResourceStatus};

use super::changeset::{ChangeOp, ChangeRecord, ChangeSet, PropertyChange, PropertyChangeKind};

/// Engine for computing change sets.
#[derive(Debug)]
pub struct DiffEngine<'a> {
    registry: &'a ProviderRegistry,
}

impl<'a> DiffEngine<'a> {
    /// Creates a diff engine using `registry` for replacement decisions.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Computes the change set turning `state` into `desired`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::InconsistentState`] if the snapshot contradicts
    /// itself.
    pub fn diff(
        &self,
        desired: &ResourceGraph,
        state: &DeploymentState,
    ) -> Result<ChangeSet, PlanError> {
        validate_snapshot(state)?;

        let mut records = Vec::new();
        let mut changed: BTreeMap<&str, &'static str> = BTreeMap::new();

        // Dependencies come first so their changes are known to dependents.
        for node in desired.topological_order() {
            let current = state.get(&node.name);
            let diffed = self.diff_node(node, current, &changed);

            if let Some(verb) = change_verb(&diffed) {
                changed.insert(node.name.as_str(), verb);
            }
            for record in &diffed {
                debug!("{} {}: {}", record.operation, record.name, record.reason);
            }
            records.extend(diffed);
        }

        for (name, current) in &state.resources {
            if !desired.contains(name) {
                debug!("delete {}: removed from spec", name);
                records.push(delete_record(current, false, "removed from spec"));
            }
        }

        Ok(ChangeSet::new(records))
    }

    fn diff_node(
        &self,
        node: &ResourceNode,
        current: Option<&ResourceState>,
        changed: &BTreeMap<&str, &'static str>,
    ) -> Vec<ChangeRecord> {
        let Some(current) = current else {
            return vec![create_record(node, None, false, "new resource")];
        };

        if current.physical_id.is_none() {
            return vec![create_record(
                node,
                Some(current),
                false,
                "no physical resource recorded",
            )];
        }

        if current.resource_type != node.resource_type {
            let reason = format!(
                "type changed from '{}' to '{}'",
                current.resource_type, node.resource_type
            );
            return replacement(node, current, &reason);
        }

        if current.properties != node.properties {
            let requires_replacement = self
                .registry
                .get(&node.resource_type)
                .is_some_and(|p| p.is_replacement_required(&current.properties, &node.properties));

            if requires_replacement {
                return replacement(node, current, "change requires replacement");
            }
            return vec![update_record(node, current, "properties changed")];
        }

        let reason = match current.status {
            ResourceStatus::Failed => Some("retrying failed resource"),
            ResourceStatus::Applied => None,
            _ => Some("last operation did not complete"),
        };
        if let Some(reason) = reason {
            return vec![update_record(node, current, reason)];
        }

        // Resolved inputs move with the outputs of referenced resources.
        let referenced: BTreeSet<String> = collect_references(&node.properties)
            .unwrap_or_default()
            .into_iter()
            .map(|r| r.target)
            .collect();
        if let Some((dep, verb)) = referenced
            .iter()
            .find_map(|d| changed.get(d.as_str()).map(|verb| (d, verb)))
        {
            let reason = format!("dependency '{dep}' {verb}");
            return vec![update_record(node, current, &reason)];
        }

        vec![ChangeRecord {
            operation: ChangeOp::NoOp,
            details: Vec::new(),
            reason: String::new(),
            ..update_record(node, current, "")
        }]
    }
}

/// Describes how a node's records change its outputs, if at all.
fn change_verb(records: &[ChangeRecord]) -> Option<&'static str> {
    if records.iter().any(|r| r.replacement) {
        return Some("replaced");
    }
    records.iter().find_map(|r| match r.operation {
        ChangeOp::Create => Some("created"),
        ChangeOp::Update => Some("updated"),
        _ => None,
    })
}

/// Checks the snapshot for internal contradictions.
fn validate_snapshot(state: &DeploymentState) -> Result<(), PlanError> {
    for (key, resource) in &state.resources {
        if *key != resource.name {
            return Err(PlanError::InconsistentState {
                message: format!("entry '{key}' records resource name '{}'", resource.name),
            });
        }

        if matches!(resource.status, ResourceStatus::Applied | ResourceStatus::Failed)
            && resource.physical_id.is_none()
        {
            return Err(PlanError::InconsistentState {
                message: format!("resource '{key}' is {} but has no physical id", resource.status),
            });
        }

        if let Some(dep) = resource
            .dependencies
            .iter()
            .find(|d| !state.resources.contains_key(*d))
        {
            return Err(PlanError::InconsistentState {
                message: format!("resource '{key}' depends on untracked resource '{dep}'"),
            });
        }
    }
    Ok(())
}

fn replacement(node: &ResourceNode, current: &ResourceState, reason: &str) -> Vec<ChangeRecord> {
    let mut delete = delete_record(current, true, reason);
    delete.protect |= node.protect;
    vec![delete, create_record(node, Some(current), true, reason)]
}

fn create_record(
    node: &ResourceNode,
    current: Option<&ResourceState>,
    replacement: bool,
    reason: &str,
) -> ChangeRecord {
    let prior = current.map(|c| &c.properties);
    ChangeRecord {
        name: node.name.clone(),
        resource_type: node.resource_type.clone(),
        operation: ChangeOp::Create,
        dependencies: node.dependencies.clone(),
        prior_dependencies: current.map(|c| c.dependencies.clone()).unwrap_or_default(),
        properties: Some(node.properties.clone()),
        prior_properties: prior.cloned(),
        physical_id: None,
        replacement,
        reason: reason.to_string(),
        details: property_changes(prior, &node.properties),
        protect: node.protect,
    }
}

fn update_record(node: &ResourceNode, current: &ResourceState, reason: &str) -> ChangeRecord {
    ChangeRecord {
        name: node.name.clone(),
        resource_type: node.resource_type.clone(),
        operation: ChangeOp::Update,
        dependencies: node.dependencies.clone(),
        prior_dependencies: current.dependencies.clone(),
        properties: Some(node.properties.clone()),
        prior_properties: Some(current.properties.clone()),
        physical_id: current.physical_id.clone(),
        replacement: false,
        reason: reason.to_string(),
        details: property_changes(Some(&current.properties), &node.properties),
        protect: node.protect,
    }
}

fn delete_record(current: &ResourceState, replacement: bool, reason: &str) -> ChangeRecord {
    ChangeRecord {
        name: current.name.clone(),
        resource_type: current.resource_type.clone(),
        operation: ChangeOp::Delete,
        dependencies: current.dependencies.clone(),
        prior_dependencies: current.dependencies.clone(),
        properties: None,
        prior_properties: Some(current.properties.clone()),
        physical_id: current.physical_id.clone(),
        replacement,
        reason: reason.to_string(),
        details: Vec::new(),
        protect: current.protect,
    }
}

/// Lists top-level keys that were added, changed or removed.
fn property_changes(old: Option<&Value>, new: &Value) -> Vec<PropertyChange> {
    let empty = serde_json::Map::new();
    let old_map = old.and_then(Value::as_object).unwrap_or(&empty);
    let new_map = new.as_object().unwrap_or(&empty);

    let keys: BTreeSet<&String> = old_map.keys().chain(new_map.keys()).collect();
    let mut changes = Vec::new();

    for key in keys {
        let (before, after) = (old_map.get(key), new_map.get(key));
        let kind = match (before, after) {
            (None, Some(_)) => PropertyChangeKind::Added,
            (Some(_), None) => PropertyChangeKind::Removed,
            (Some(a), Some(b)) if a != b => PropertyChangeKind::Changed,
            _ => continue,
        };
        changes.push(PropertyChange {
            key: key.clone(),
            kind,
            old: before.cloned(),
            new: after.cloned(),
        });
    }

    changes
}

/// Counts records per operation, for logging.
#[must_use]
pub fn summarize(changes: &ChangeSet) -> BTreeMap<ChangeOp, usize> {
    let mut counts = BTreeMap::new();
    for record in changes.records() {
        *counts.entry(record.operation).or_insert(0) += 1;
    }
    counts
}
