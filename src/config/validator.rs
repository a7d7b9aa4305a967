//! Configuration validation for deployment specs.
//!
//! This module validates deployment specs before any graph is built,
//! collecting every error and warning in one pass.

use crate::error::{ConfigError, KeelsonError, Result};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{DeploySpec, ExecutionConfig, ProjectConfig, ResourceSpec};

/// Validator for deployment specs.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a deployment spec.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found.
    pub fn validate(&self, spec: &DeploySpec) -> Result<ValidationResult> {
        let result = self.check(spec);

        if let Some(first_error) = result.errors.first() {
            return Err(KeelsonError::Config(ConfigError::validation(
                first_error.message.clone(),
                first_error.field.clone(),
            )));
        }

        debug!(
            "Configuration validation passed with {} warnings",
            result.warning_count()
        );
        Ok(result)
    }

    /// Runs every check and returns the collected findings.
    #[must_use]
    pub fn check(&self, spec: &DeploySpec) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&spec.project, &mut result);
        Self::validate_execution(&spec.execution, &mut result);
        Self::validate_resources(spec, &mut result);

        result
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_project_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    /// Validates execution settings.
    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        if execution.concurrency == 0 {
            result.error("execution.concurrency", "Concurrency must be at least 1");
        }

        if execution.lease_ttl_secs == 0 {
            result.error("execution.lease_ttl_secs", "Lease TTL must be at least 1 second");
        }

        let retry = &execution.retry;
        if retry.max_attempts == 0 {
            result.error("execution.retry.max_attempts", "At least one attempt is required");
        }

        if retry.multiplier < 1.0 {
            result.error(
                "execution.retry.multiplier",
                "Backoff multiplier must be at least 1.0",
            );
        }

        if retry.initial_backoff_ms > retry.max_backoff_ms {
            result.error(
                "execution.retry.initial_backoff_ms",
                "Initial backoff cannot exceed max_backoff_ms",
            );
        }
    }

    /// Validates all resource definitions.
    fn validate_resources(spec: &DeploySpec, result: &mut ValidationResult) {
        if spec.resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined; apply will destroy tracked resources"));
            return;
        }

        for (name, resource) in &spec.resources {
            let prefix = format!("resources.{name}");

            if !is_valid_resource_name(name) {
                result.error(
                    &prefix,
                    format!(
                        "Resource name '{name}' is invalid. Must start with a lowercase letter \
                         and contain only lowercase letters, digits, '-' or '_'."
                    ),
                );
            }

            Self::validate_resource(name, resource, &prefix, result);
        }

        if let Some(guardrails) = &spec.guardrails
            && guardrails.max_deletes == Some(0)
            && guardrails.max_replacements.is_some_and(|r| r > 0)
        {
            result.warnings.push(String::from(
                "guardrails.max_replacements has no effect while max_deletes is 0",
            ));
        }
    }

    /// Validates a single resource definition.
    fn validate_resource(
        name: &str,
        resource: &ResourceSpec,
        prefix: &str,
        result: &mut ValidationResult,
    ) {
        if resource.resource_type.trim().is_empty() {
            result.error(format!("{prefix}.type"), "Resource type cannot be empty");
        }

        if !resource.properties.is_object() {
            result.error(
                format!("{prefix}.properties"),
                "Properties must be a mapping",
            );
        }

        let mut seen = HashSet::new();
        for (i, dep) in resource.depends_on.iter().enumerate() {
            if dep == name {
                result.error(
                    format!("{prefix}.depends_on[{i}]"),
                    format!("Resource '{name}' cannot depend on itself"),
                );
            }
            if !seen.insert(dep) {
                result
                    .warnings
                    .push(format!("{prefix}.depends_on[{i}]: duplicate dependency '{dep}'"));
            }
        }
    }
}

/// Validates that a project name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_project_name(name: &str) -> bool {
    let mut chars = name.chars();

    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() {
        return false;
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Resource names may not contain '.', which separates output names in references.
fn is_valid_resource_name(name: &str) -> bool {
    let mut chars = name.chars();

    let Some(first) = chars.next() else {
        return false;
    };

    first.is_ascii_lowercase()
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

impl ValidationResult {
    /// Records an error for a field.
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::spec::ResourceSpec;
    use crate::config::ConfigParser;
    use serde_json::json;

    fn spec_with(resources: Vec<(&str, ResourceSpec)>) -> DeploySpec {
        let mut spec = ConfigParser::new()
            .parse_yaml("project:\n  name: demo\n", None)
            .unwrap();
        for (name, res) in resources {
            spec.resources.insert(name.to_string(), res);
        }
        spec
    }

    #[test]
    fn test_valid_project_name() {
        assert!(is_valid_project_name("web-stack"));
        assert!(is_valid_project_name("a1"));
        assert!(!is_valid_project_name(""));
        assert!(!is_valid_project_name("Web"));
        assert!(!is_valid_project_name("1web"));
        assert!(!is_valid_project_name("web-"));
        assert!(!is_valid_project_name("web--stack"));
    }

    #[test]
    fn test_valid_resource_name() {
        assert!(is_valid_resource_name("vpc"));
        assert!(is_valid_resource_name("app_service-2"));
        assert!(!is_valid_resource_name("vpc.main"));
        assert!(!is_valid_resource_name("Vpc"));
        assert!(!is_valid_resource_name("_vpc"));
    }

    #[test]
    fn test_valid_spec_passes() {
        let spec = spec_with(vec![
            ("vpc", ResourceSpec::new("noop", json!({"cidr": "10.0.0.0/16"}))),
            ("app", ResourceSpec::new("noop", json!({})).depends_on("vpc")),
        ]);

        let result = ConfigValidator::new().validate(&spec).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_collects_all_errors() {
        let mut spec = spec_with(vec![
            ("Bad.Name", ResourceSpec::new("noop", json!({}))),
            ("loop", ResourceSpec::new("", json!([1, 2])).depends_on("loop")),
        ]);
        spec.execution.concurrency = 0;

        let result = ConfigValidator::new().check(&spec);
        assert_eq!(result.error_count(), 5);
        assert!(ConfigValidator::new().validate(&spec).is_err());
    }

    #[test]
    fn test_empty_resources_warns() {
        let spec = spec_with(vec![]);
        let result = ConfigValidator::new().validate(&spec).unwrap();
        assert_eq!(result.warning_count(), 1);
    }
}
