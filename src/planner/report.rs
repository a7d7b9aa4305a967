//! Execution reports.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::error::ProviderErrorKind;

use super::changeset::{ChangeKey, ChangeOp};

/// Final status of one scheduled record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// The resource now matches the record.
    Applied,
    /// The resource is gone, as intended.
    Deleted,
    /// The provider call failed.
    Failed,
    /// Skipped because a predecessor failed or was blocked.
    Blocked,
    /// Never dispatched because the run was cancelled.
    Cancelled,
}

/// Outcome of one scheduled record.
#[derive(Debug, Clone, Serialize)]
pub struct RecordResult {
    /// Logical resource name.
    pub name: String,
    /// Planned operation.
    pub operation: ChangeOp,
    /// Final status.
    pub status: RecordStatus,
    /// Error message for failed records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error classification for failed records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ProviderErrorKind>,
    /// Failed or blocked predecessors, for blocked records.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
    /// Provider attempts made.
    pub attempts: u32,
    /// Wall time spent, in milliseconds.
    pub duration_ms: u64,
}

/// A failed record.
#[derive(Debug, Clone, Serialize)]
pub struct FailedNode {
    /// Logical resource name.
    pub name: String,
    /// Planned operation.
    pub operation: ChangeOp,
    /// Error message.
    pub error: String,
}

/// A record skipped because of failures upstream.
#[derive(Debug, Clone, Serialize)]
pub struct BlockedNode {
    /// Logical resource name.
    pub name: String,
    /// Planned operation.
    pub operation: ChangeOp,
    /// Failed or blocked predecessors.
    pub blocked_by: Vec<String>,
}

/// Every record that did not reach its intended state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FailureReport {
    /// Records whose provider call failed.
    pub failed: Vec<FailedNode>,
    /// Records skipped because a predecessor failed or was blocked.
    pub blocked: Vec<BlockedNode>,
    /// Records never dispatched because the run was cancelled.
    pub cancelled: Vec<ChangeKey>,
}

/// Result of executing a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub finished_at: DateTime<Utc>,
    /// Per-record outcomes, in execution order.
    pub results: Vec<RecordResult>,
    /// The run was cancelled before finishing.
    pub cancelled: bool,
}

impl RecordResult {
    /// Key of the record this result belongs to.
    #[must_use]
    pub fn key(&self) -> ChangeKey {
        ChangeKey::new(self.name.clone(), self.operation)
    }

    /// Returns true if the record reached its intended state.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.status, RecordStatus::Applied | RecordStatus::Deleted)
    }
}

impl ExecutionReport {
    /// Creates an empty report starting now.
    #[must_use]
    pub fn start() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            results: Vec::new(),
            cancelled: false,
        }
    }

    /// Marks the report finished.
    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    /// Returns true if every record was applied or deleted.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.results.iter().all(RecordResult::is_success)
    }

    /// Looks up the result of a record.
    #[must_use]
    pub fn get(&self, name: &str, operation: ChangeOp) -> Option<&RecordResult> {
        self.results
            .iter()
            .find(|r| r.name == name && r.operation == operation)
    }

    /// Number of results with the given status.
    #[must_use]
    pub fn count(&self, status: RecordStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// Collects everything that went wrong, or `None` on success.
    #[must_use]
    pub fn failure_report(&self) -> Option<FailureReport> {
        if self.is_success() {
            return None;
        }

        let mut report = FailureReport::default();
        for result in &self.results {
            match result.status {
                RecordStatus::Failed => report.failed.push(FailedNode {
                    name: result.name.clone(),
                    operation: result.operation,
                    error: result.error.clone().unwrap_or_default(),
                }),
                RecordStatus::Blocked => report.blocked.push(BlockedNode {
                    name: result.name.clone(),
                    operation: result.operation,
                    blocked_by: result.blocked_by.clone(),
                }),
                RecordStatus::Cancelled => report.cancelled.push(result.key()),
                RecordStatus::Applied | RecordStatus::Deleted => {}
            }
        }
        Some(report)
    }

    /// Wall time of the run, in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

impl FailureReport {
    /// Total number of affected records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.failed.len() + self.blocked.len() + self.cancelled.len()
    }

    /// Returns true if nothing went wrong.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Applied => "applied",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} changes did not complete:", self.len())?;
        for node in &self.failed {
            writeln!(f, "  failed    {} {}: {}", node.operation, node.name, node.error)?;
        }
        for node in &self.blocked {
            writeln!(
                f,
                "  blocked   {} {}: waiting on {}",
                node.operation,
                node.name,
                node.blocked_by.join(", ")
            )?;
        }
        for key in &self.cancelled {
            writeln!(f, "  cancelled {key}")?;
        }
        Ok(())
    }
}
