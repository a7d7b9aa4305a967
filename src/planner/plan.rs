//! Execution plans.
//!
//! A plan is the scheduled change set plus everything the execution
//! engine needs to propagate failures, and the guardrail verdict.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::GuardrailsConfig;
use crate::error::PlanError;

use super::changeset::{ChangeKey, ChangeOp, ChangeRecord, ChangeSet};
use super::scheduler::schedule;

/// A complete execution plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Spec hash this plan is based on.
    pub config_hash: String,
    /// Batches of records in execution order.
    pub batches: Vec<Vec<ChangeRecord>>,
    /// Resources that need no change.
    pub unchanged: Vec<ChangeRecord>,
    /// Guardrail violations (if any).
    pub guardrail_violations: Vec<String>,
    /// Direct predecessors of each scheduled record.
    #[serde(skip)]
    predecessors: BTreeMap<ChangeKey, BTreeSet<ChangeKey>>,
}

impl Plan {
    /// Schedules a change set and checks it against guardrails.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::DependencyResolutionFailed`] if the changes
    /// cannot be ordered.
    pub fn build(
        changes: ChangeSet,
        guardrails: Option<&GuardrailsConfig>,
        config_hash: &str,
    ) -> Result<Self, PlanError> {
        let scheduled = schedule(&changes)?;
        let unchanged = changes
            .into_records()
            .into_iter()
            .filter(|r| !r.is_change())
            .collect();

        let mut plan = Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            batches: scheduled.batches,
            unchanged,
            guardrail_violations: Vec::new(),
            predecessors: scheduled.predecessors,
        };
        plan.guardrail_violations = plan.check_guardrails(guardrails);
        Ok(plan)
    }

    /// Checks deletion limits and protected resources.
    fn check_guardrails(&self, guardrails: Option<&GuardrailsConfig>) -> Vec<String> {
        let mut violations = Vec::new();

        for record in self.records() {
            if record.operation == ChangeOp::Delete && record.protect {
                let action = if record.replacement { "replaced" } else { "deleted" };
                violations.push(format!(
                    "Resource '{}' is protected and would be {action}",
                    record.name
                ));
            }
        }

        if let Some(guardrails) = guardrails {
            let deletes = self.delete_count();
            if let Some(max) = guardrails.max_deletes
                && deletes > max
            {
                violations.push(format!(
                    "Plan deletes {deletes} resources but max_deletes is {max}"
                ));
            }

            let replacements = self.replacement_count();
            if let Some(max) = guardrails.max_replacements
                && replacements > max
            {
                violations.push(format!(
                    "Plan replaces {replacements} resources but max_replacements is {max}"
                ));
            }
        }

        violations
    }

    /// Iterates scheduled records in execution order.
    pub fn records(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.batches.iter().flatten()
    }

    /// Direct predecessors of a scheduled record.
    #[must_use]
    pub fn predecessors(&self, key: &ChangeKey) -> Option<&BTreeSet<ChangeKey>> {
        self.predecessors.get(key)
    }

    /// Returns true if the plan changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Returns true if no guardrail is violated.
    #[must_use]
    pub fn passes_guardrails(&self) -> bool {
        self.guardrail_violations.is_empty()
    }

    /// Returns the number of scheduled records.
    #[must_use]
    pub fn change_count(&self) -> usize {
        self.records().count()
    }

    fn count(&self, operation: ChangeOp) -> usize {
        self.records().filter(|r| r.operation == operation).count()
    }

    /// Returns the number of create records (replacements included).
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.count(ChangeOp::Create)
    }

    /// Returns the number of update records.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.count(ChangeOp::Update)
    }

    /// Returns the number of delete records (replacements included).
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.count(ChangeOp::Delete)
    }

    /// Returns the number of replaced resources.
    #[must_use]
    pub fn replacement_count(&self) -> usize {
        self.records()
            .filter(|r| r.replacement && r.operation == ChangeOp::Delete)
            .count()
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes. {} resources up to date.", self.unchanged.len());
        }

        writeln!(f, "Execution plan ({} changes):", self.change_count())?;
        for (i, batch) in self.batches.iter().enumerate() {
            writeln!(f, "  Batch {}:", i + 1)?;
            for record in batch {
                writeln!(f, "    {record}")?;
                for detail in &record.details {
                    writeln!(f, "        {detail}")?;
                }
            }
        }

        writeln!(
            f,
            "\nPlan: {} to create, {} to update, {} to delete ({} replacements).",
            self.create_count(),
            self.update_count(),
            self.delete_count(),
            self.replacement_count()
        )?;

        if !self.guardrail_violations.is_empty() {
            writeln!(f, "\nGuardrail violations:")?;
            for violation in &self.guardrail_violations {
                writeln!(f, "  - {violation}")?;
            }
        }

        Ok(())
    }
}
