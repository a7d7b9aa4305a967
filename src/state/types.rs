//! State types for tracking deployed resources.
//!
//! These types form the persisted snapshot of the last apply. Properties
//! are stored in their unresolved form so the next plan can diff them
//! directly against the deploy spec.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1";

/// Maximum number of history entries kept in a snapshot.
pub const MAX_HISTORY: usize = 100;

/// The complete deployment state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentState {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Incremented on every save.
    #[serde(default)]
    pub serial: u64,
    /// Identifies this state's history; fixed when the state is created.
    pub lineage: String,
    /// Hash of the last applied spec.
    #[serde(default)]
    pub config_hash: String,
    /// Tracked resources keyed by logical name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Deployment history (recent entries).
    #[serde(default)]
    pub history: Vec<DeploymentHistoryEntry>,
}

/// State of a single resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceState {
    /// Logical name (from the deploy spec).
    pub name: String,
    /// Type tag.
    pub resource_type: String,
    /// Identifier assigned by the provider.
    #[serde(default)]
    pub physical_id: Option<String>,
    /// Last applied properties, unresolved.
    #[serde(default)]
    pub properties: Value,
    /// Outputs reported by the provider.
    #[serde(default)]
    pub outputs: Map<String, Value>,
    /// Dependencies as of the last apply.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Current status.
    pub status: ResourceStatus,
    /// Error from the last failed operation.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Hash of the last applied properties.
    #[serde(default)]
    pub properties_hash: String,
    /// Whether the resource was protected when last applied.
    #[serde(default)]
    pub protect: bool,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Resource status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// Known but not yet applied.
    Pending,
    /// Create in progress.
    Creating,
    /// Update in progress.
    Updating,
    /// Delete in progress.
    Deleting,
    /// Matches its last applied properties.
    Applied,
    /// The last operation failed.
    Failed,
}

/// A single entry in the deployment history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentHistoryEntry {
    /// When the deployment occurred.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: DeploymentOperation,
    /// Spec hash at time of deployment.
    pub config_hash: String,
    /// Resources affected.
    pub resources: Vec<String>,
    /// Whether the deployment succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of deployment operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentOperation {
    /// Converge to the deploy spec.
    Apply,
    /// Tear everything down.
    Destroy,
    /// Stop tracking a resource without touching it.
    Forget,
}

impl DeploymentState {
    /// Creates a new empty deployment state with a fresh lineage.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            serial: 0,
            lineage: Uuid::new_v4().to_string(),
            config_hash: String::new(),
            resources: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a resource by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceState> {
        self.resources.get(name)
    }

    /// Gets a mutable reference to a resource by name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut ResourceState> {
        self.resources.get_mut(name)
    }

    /// Adds or replaces a resource.
    pub fn set(&mut self, resource: ResourceState) {
        self.resources.insert(resource.name.clone(), resource);
        self.last_updated = Utc::now();
    }

    /// Removes a resource by name.
    pub fn remove(&mut self, name: &str) -> Option<ResourceState> {
        let result = self.resources.remove(name);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Adds a history entry, dropping the oldest beyond [`MAX_HISTORY`].
    pub fn add_history(&mut self, entry: DeploymentHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            let excess = self.history.len() + 1 - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.history.push(entry);
    }

    /// Returns resources whose last operation failed.
    #[must_use]
    pub fn failed_resources(&self) -> Vec<&ResourceState> {
        self.resources
            .values()
            .filter(|r| r.status == ResourceStatus::Failed)
            .collect()
    }

    /// Returns all resource names in sorted order.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }
}

impl ResourceState {
    /// Creates a pending resource state.
    #[must_use]
    pub fn new(name: &str, resource_type: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            physical_id: None,
            properties: Value::Object(Map::new()),
            outputs: Map::new(),
            dependencies: BTreeSet::new(),
            status: ResourceStatus::Pending,
            last_error: None,
            properties_hash: String::new(),
            protect: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Updates the status.
    pub fn set_status(&mut self, status: ResourceStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Marks the resource failed with an error message.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.set_status(ResourceStatus::Failed);
    }

    /// Checks if the resource matches its last applied properties.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self.status, ResourceStatus::Applied)
    }
}

impl DeploymentHistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(operation: DeploymentOperation, config_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: DeploymentOperation,
        config_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::new(operation, config_hash, resources)
        }
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Updating => "updating",
            Self::Deleting => "deleting",
            Self::Applied => "applied",
            Self::Failed => "failed",
        };
        write!(f, "{status}")
    }
}

impl std::fmt::Display for DeploymentOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Forget => "forget",
        };
        write!(f, "{op}")
    }
}
