//! Error types for the Keelson convergence engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, graph construction, planning, state management,
//! provider calls and reconciliation.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Keelson engine.
#[derive(Debug, Error)]
pub enum KeelsonError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph construction errors.
    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Resource provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },
}

/// Errors raised while turning a spec into a resource graph.
///
/// All of these abort the run before any resource is touched.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A reference or `depends_on` entry names a resource that does not exist.
    #[error("Resource '{resource}' references unknown resource '{reference}'")]
    UnresolvedReference {
        /// Resource holding the reference.
        resource: String,
        /// The name that could not be resolved.
        reference: String,
    },

    /// The dependency graph contains a cycle.
    #[error("Cyclic dependency detected: {}", .cycle.join(" -> "))]
    CyclicDependency {
        /// Resources forming the cycle, with the first repeated at the end.
        cycle: Vec<String>,
    },

    /// A reference expression is malformed.
    #[error("Invalid reference in resource '{resource}': {message}")]
    InvalidReference {
        /// Resource holding the reference.
        resource: String,
        /// Description of the problem.
        message: String,
    },

    /// The provider rejected the resource's properties.
    #[error("Invalid properties for resource '{resource}': {message}")]
    InvalidProperties {
        /// Resource name.
        resource: String,
        /// Description of the problem.
        message: String,
    },

    /// No provider is registered for the resource type.
    #[error("Resource '{resource}' has unknown type '{resource_type}'")]
    UnknownResourceType {
        /// Resource name.
        resource: String,
        /// The unregistered type tag.
        resource_type: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// The state is leased by another run.
    #[error("State is locked by {holder} since {since} (expires {expires_at})")]
    AlreadyLocked {
        /// Identifier of the lease holder.
        holder: String,
        /// When the lease was acquired.
        since: String,
        /// When the lease expires.
        expires_at: String,
    },

    /// The caller's lease is no longer the active one.
    #[error("Lease {lease_id} is no longer held")]
    LeaseLost {
        /// The lease id presented by the caller.
        lease_id: String,
    },

    /// Lease acquisition failed for a reason other than contention.
    #[error("Failed to acquire state lease: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// Backing storage failure.
    #[error("State storage error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// How a provider failure should be treated by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Transient fault; the operation may be retried.
    Retryable,
    /// Permanent fault such as invalid configuration or permission denial.
    Fatal,
    /// The physical resource does not exist.
    NotFound,
}

/// Error returned by a resource provider operation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderError {
    /// Classification of the failure.
    pub kind: ProviderErrorKind,
    /// Description of the failure.
    pub message: String,
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The state snapshot contradicts itself.
    #[error("Inconsistent state snapshot: {message}")]
    InconsistentState {
        /// Description of the inconsistency.
        message: String,
    },

    /// Change records could not be ordered.
    #[error("Failed to resolve dependencies: {message}")]
    DependencyResolutionFailed {
        /// Description of the dependency issue.
        message: String,
    },
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Reconciliation was aborted before execution.
    #[error("Reconciliation aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },

    /// A resource named on the command line is not tracked in state.
    #[error("Resource '{name}' is not tracked in state")]
    UnknownResource {
        /// Name of the resource.
        name: String,
    },
}

/// Result type alias for Keelson operations.
pub type Result<T> = std::result::Result<T, KeelsonError>;

impl KeelsonError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if the error was raised while building the graph.
    #[must_use]
    pub const fn is_build_error(&self) -> bool {
        matches!(self, Self::Build(_))
    }

    /// Process exit code for a run that ended in this error.
    ///
    /// Build errors exit with 2, everything else with 1.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        if self.is_build_error() { 2 } else { 1 }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates a storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a retryable (transient) error.
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Retryable,
            message: message.into(),
        }
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Fatal,
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::NotFound,
            message: message.into(),
        }
    }

    /// Returns true if the operation may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind, ProviderErrorKind::Retryable)
    }

    /// Returns true if the physical resource does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind, ProviderErrorKind::NotFound)
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::fatal(format!("invalid properties: {err}"))
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Retryable => "retryable",
            Self::Fatal => "fatal",
            Self::NotFound => "not found",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_every_node() {
        let err = BuildError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency detected: a -> b -> a");
    }

    #[test]
    fn test_exit_codes() {
        let build = KeelsonError::Build(BuildError::UnresolvedReference {
            resource: "web".into(),
            reference: "vpc".into(),
        });
        assert_eq!(build.exit_code(), 2);

        let plan = KeelsonError::Plan(PlanError::InconsistentState {
            message: "x".into(),
        });
        assert_eq!(plan.exit_code(), 1);
    }

    #[test]
    fn test_provider_error_classification() {
        assert!(ProviderError::retryable("throttled").is_retryable());
        assert!(!ProviderError::fatal("denied").is_retryable());
        assert!(ProviderError::not_found("gone").is_not_found());
        assert!(KeelsonError::from(ProviderError::retryable("x")).is_retryable());
    }
}
