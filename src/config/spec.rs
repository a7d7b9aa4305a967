//! Deploy spec types.
//!
//! This module defines the structs that map to the `keelson.deploy.yaml`
//! file. These types are declarative and fully describe the desired state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// The root configuration structure for a Keelson deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploySpec {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Execution tuning.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Optional guardrails configuration.
    #[serde(default)]
    pub guardrails: Option<GuardrailsConfig>,
    /// Resources keyed by logical name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceSpec>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// State directory for the local backend.
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
}

/// Execution engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionConfig {
    /// Maximum number of provider operations in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Lease time-to-live in seconds.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
    /// Retry policy for transient provider errors.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Retry settings for transient provider errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for a single delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Factor applied to the delay after each attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

/// A single resource definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    /// Type tag selecting the provider.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Desired properties. May contain references to other resources.
    #[serde(default = "default_properties")]
    pub properties: serde_json::Value,
    /// Explicit dependency hints.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Refuse plans that delete or replace this resource.
    #[serde(default)]
    pub protect: bool,
}

/// Guardrails limiting what a single plan may do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct GuardrailsConfig {
    /// Maximum number of deletions (including replacements).
    #[serde(default)]
    pub max_deletes: Option<usize>,
    /// Maximum number of replacements.
    #[serde(default)]
    pub max_replacements: Option<usize>,
}

// Default value functions

const fn default_concurrency() -> usize {
    4
}

const fn default_lease_ttl() -> u64 {
    300
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

const fn default_multiplier() -> f64 {
    2.0
}

fn default_properties() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn default_environment() -> String {
    String::from("dev")
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            lease_ttl_secs: default_lease_ttl(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl DeploySpec {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns resource names in sorted order.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }
}

impl ExecutionConfig {
    /// Lease time-to-live as a duration.
    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

impl ResourceSpec {
    /// Creates a resource of the given type with the given properties.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, properties: serde_json::Value) -> Self {
        Self {
            resource_type: resource_type.into(),
            properties,
            depends_on: Vec::new(),
            protect: false,
        }
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    /// Marks the resource as protected.
    #[must_use]
    pub const fn protected(mut self) -> Self {
        self.protect = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_defaults() {
        let exec = ExecutionConfig::default();
        assert_eq!(exec.concurrency, 4);
        assert_eq!(exec.retry.max_attempts, 3);
        assert_eq!(exec.lease_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn test_resource_builder() {
        let res = ResourceSpec::new("noop", serde_json::json!({"a": 1}))
            .depends_on("vpc")
            .protected();
        assert_eq!(res.depends_on, vec!["vpc"]);
        assert!(res.protect);
    }
}
