//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{DeploySpec, ValidationResult};
use crate::planner::{ChangeOp, ChangeRecord, Plan, RecordStatus};
use crate::reconciler::RunOutcome;
use crate::state::{DeploymentState, Lease, ResourceStatus};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan record row for table display.
#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "Batch")]
    batch: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Execution result row for table display.
#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Time")]
    duration: String,
}

/// Tracked resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Physical ID")]
    physical_id: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true when output is machine readable.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats an execution plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan) -> String {
        match self.format {
            OutputFormat::Json => to_json(plan),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    fn format_plan_text(plan: &Plan) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes. {} resources up to date.\n",
                "✓".green(),
                plan.unchanged.len()
            );
        }

        let mut output = String::new();
        let _ = write!(
            output,
            "\nExecution plan ({} changes in {} batches)\n",
            plan.change_count(),
            plan.batches.len()
        );
        let _ = write!(output, "   Spec hash: {}\n\n", short(&plan.config_hash));

        let rows: Vec<PlanRow> = plan
            .batches
            .iter()
            .enumerate()
            .flat_map(|(i, batch)| {
                batch.iter().map(move |record| PlanRow {
                    batch: i + 1,
                    action: Self::format_action(record),
                    resource: record.name.clone(),
                    resource_type: record.resource_type.clone(),
                    reason: truncate(&record.reason, 48),
                })
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let detailed: Vec<&ChangeRecord> =
            plan.records().filter(|r| !r.details.is_empty()).collect();
        if !detailed.is_empty() {
            output.push_str("\nProperty changes:\n");
            for record in detailed {
                let _ = writeln!(output, "   {}:", record.name);
                for detail in &record.details {
                    let _ = writeln!(output, "      {detail}");
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete ({} replacements)\n",
            plan.create_count().to_string().green(),
            plan.update_count().to_string().yellow(),
            plan.delete_count().to_string().red(),
            plan.replacement_count()
        );

        if !plan.passes_guardrails() {
            let _ = write!(output, "\n{} Guardrail violations:\n", "⚠".yellow());
            for violation in &plan.guardrail_violations {
                let _ = writeln!(output, "   - {violation}");
            }
        }

        output
    }

    /// Formats the outcome of an apply or destroy run.
    #[must_use]
    pub fn format_outcome(&self, outcome: &RunOutcome) -> String {
        match self.format {
            OutputFormat::Json => to_json(outcome),
            OutputFormat::Text => Self::format_outcome_text(outcome),
        }
    }

    fn format_outcome_text(outcome: &RunOutcome) -> String {
        let report = &outcome.report;
        if report.results.is_empty() {
            return format!("{} Nothing to do.\n", "✓".green());
        }

        let rows: Vec<ResultRow> = report
            .results
            .iter()
            .map(|r| ResultRow {
                resource: r.name.clone(),
                action: r.operation.to_string(),
                status: Self::format_record_status(r.status),
                attempts: r.attempts,
                duration: format!("{}ms", r.duration_ms),
            })
            .collect();

        let mut output = String::new();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        match report.failure_report() {
            None => {
                let _ = write!(
                    output,
                    "\n{} Complete: {} applied, {} deleted in {}ms\n",
                    "✓".green(),
                    report.count(RecordStatus::Applied),
                    report.count(RecordStatus::Deleted),
                    report.duration_ms()
                );
            }
            Some(failures) => {
                let _ = write!(
                    output,
                    "\n{} {} of {} changes did not complete\n{failures}",
                    "✗".red(),
                    failures.len(),
                    report.results.len()
                );
            }
        }

        output
    }

    /// Formats deployment state.
    #[must_use]
    pub fn format_state(&self, state: &DeploymentState, lease: Option<&Lease>) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "state": state,
                "lease": lease,
            })),
            OutputFormat::Text => Self::format_state_text(state, lease),
        }
    }

    fn format_state_text(state: &DeploymentState, lease: Option<&Lease>) -> String {
        let mut output = String::new();

        let _ = write!(
            output,
            "\nState: {}/{}\n\n",
            state.project, state.environment
        );
        let _ = writeln!(output, "   Serial: {}", state.serial);
        let _ = writeln!(output, "   Lineage: {}", state.lineage);
        let _ = writeln!(output, "   Spec hash: {}", short(&state.config_hash));
        let _ = writeln!(output, "   Last updated: {}", state.last_updated);

        if let Some(lease) = lease {
            let _ = writeln!(
                output,
                "   Lease: {} held by {} ({}s left)",
                lease.lease_id,
                lease.holder,
                lease.remaining_secs()
            );
        }

        if state.resources.is_empty() {
            output.push_str("\n   No resources tracked.\n");
        } else {
            let rows: Vec<ResourceRow> = state
                .resources
                .values()
                .map(|r| ResourceRow {
                    name: r.name.clone(),
                    resource_type: r.resource_type.clone(),
                    status: Self::format_resource_status(r.status),
                    physical_id: r
                        .physical_id
                        .as_deref()
                        .map_or_else(|| String::from("-"), |id| truncate(id, 36)),
                    dependencies: r
                        .dependencies
                        .iter()
                        .map(String::as_str)
                        .collect::<Vec<_>>()
                        .join(", "),
                })
                .collect();
            output.push('\n');
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        for failed in state.failed_resources() {
            let _ = writeln!(
                output,
                "   {} {}: {}",
                "✗".red(),
                failed.name,
                failed.last_error.as_deref().unwrap_or("unknown error")
            );
        }

        if !state.history.is_empty() {
            let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
            for entry in state.history.iter().rev().take(5) {
                let status = if entry.success { "✓" } else { "✗" };
                let _ = writeln!(
                    output,
                    "     {status} {} - {:?} ({} resources)",
                    entry.timestamp.format("%Y-%m-%d %H:%M"),
                    entry.operation,
                    entry.resources.len()
                );
            }
        }

        output
    }

    /// Formats the result of `validate`.
    #[must_use]
    pub fn format_validation(
        &self,
        spec: &DeploySpec,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "valid": result.is_valid(),
                "project": spec.project.name,
                "environment": spec.project.environment,
                "resources": spec.resource_names(),
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = format!("{} Configuration is valid\n", "✓".green());
                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                let _ = writeln!(output, "\nConfiguration summary:");
                let _ = writeln!(output, "   Project: {}", spec.project.name);
                let _ = writeln!(output, "   Environment: {}", spec.project.environment);
                let _ = writeln!(output, "   Resources: {}", spec.resources.len());
                output
            }
        }
    }

    /// Formats a one-line message.
    #[must_use]
    pub fn format_message(&self, status: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "status": status,
                "message": message,
            })),
            OutputFormat::Text => {
                let marker = match status {
                    "success" => "✓".green(),
                    "error" => "✗".red(),
                    _ => "⚠".yellow(),
                };
                format!("{marker} {message}\n")
            }
        }
    }

    fn format_action(record: &ChangeRecord) -> String {
        let label = format!("{}{}", record.operation.symbol(), record.operation);
        let label = if record.replacement {
            format!("{label} (replace)")
        } else {
            label
        };
        match record.operation {
            ChangeOp::Create => label.green().to_string(),
            ChangeOp::Update => label.yellow().to_string(),
            ChangeOp::Delete => label.red().to_string(),
            ChangeOp::NoOp => label.dimmed().to_string(),
        }
    }

    fn format_record_status(status: RecordStatus) -> String {
        match status {
            RecordStatus::Applied | RecordStatus::Deleted => status.to_string().green().to_string(),
            RecordStatus::Failed => status.to_string().red().to_string(),
            RecordStatus::Blocked | RecordStatus::Cancelled => {
                status.to_string().yellow().to_string()
            }
        }
    }

    fn format_resource_status(status: ResourceStatus) -> String {
        match status {
            ResourceStatus::Applied => status.to_string().green().to_string(),
            ResourceStatus::Failed => status.to_string().red().to_string(),
            _ => status.to_string().yellow().to_string(),
        }
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

fn short(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}

/// Truncates a string to at most `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
