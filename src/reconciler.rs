//! Reconciler driving full runs.
//!
//! This module wires the graph builder, diff engine, scheduler and
//! execution engine together. Mutating runs hold the state lease from the
//! first state read until the final save.

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigHasher, DeploySpec, GuardrailsConfig};
use crate::error::{KeelsonError, ReconcileError, Result};
use crate::graph::{GraphBuilder, ResourceGraph};
use crate::planner::{
    DiffEngine, ExecutionEngine, ExecutionOptions, ExecutionReport, Plan, RecordStatus, summarize,
};
use crate::provider::ProviderRegistry;
use crate::state::{
    DeploymentHistoryEntry, DeploymentOperation, DeploymentState, Lease, StateStore,
    generate_holder_id,
};

/// Reconciler for converging real resources onto a spec.
pub struct Reconciler<'a> {
    /// Desired configuration.
    spec: &'a DeploySpec,
    /// State store.
    store: &'a dyn StateStore,
    /// Providers by type tag.
    registry: &'a ProviderRegistry,
    /// Execution tuning.
    options: ExecutionOptions,
    /// Cancellation signal for the current run.
    cancel: CancellationToken,
    /// Spec hasher.
    hasher: ConfigHasher,
    /// Lease holder identity.
    holder: String,
}

/// Result of a mutating run.
#[derive(Debug, Serialize)]
pub struct RunOutcome {
    /// The plan that was executed.
    pub plan: Plan,
    /// Per-record results.
    pub report: ExecutionReport,
}

impl RunOutcome {
    /// Returns true if every planned change succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.report.is_success()
    }
}

impl<'a> Reconciler<'a> {
    /// Creates a reconciler using the deploy spec's execution settings.
    #[must_use]
    pub fn new(
        spec: &'a DeploySpec,
        store: &'a dyn StateStore,
        registry: &'a ProviderRegistry,
    ) -> Self {
        Self {
            spec,
            store,
            registry,
            options: ExecutionOptions::from_config(&spec.execution),
            cancel: CancellationToken::new(),
            hasher: ConfigHasher::new(),
            holder: generate_holder_id(),
        }
    }

    /// Overrides the execution options.
    #[must_use]
    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    /// Uses `cancel` to stop runs early.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Computes the plan for converging onto the deploy spec without side effects.
    ///
    /// # Errors
    ///
    /// Returns an error if the deploy spec does not form a valid graph or state
    /// cannot be read.
    pub async fn plan(&self) -> Result<Plan> {
        let graph = self.build_graph()?;
        let state = self.load_state().await?;
        self.plan_against(&graph, &state, self.spec.guardrails.as_ref())
    }

    /// Computes the plan that removes every tracked resource.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read.
    pub async fn plan_destroy(&self) -> Result<Plan> {
        let state = self.load_state().await?;
        self.plan_against(&ResourceGraph::empty(), &state, None)
    }

    /// Converges real resources onto the deploy spec.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph cannot be built, the plan violates a
    /// guardrail, or the lease or state cannot be maintained. Failures of
    /// individual resources are reported in the outcome instead.
    pub async fn apply(&self) -> Result<RunOutcome> {
        info!(
            "Applying {} ({} resources)",
            self.spec.qualified_name(),
            self.spec.resources.len()
        );
        let graph = self.build_graph()?;
        self.converge(
            &graph,
            DeploymentOperation::Apply,
            self.spec.guardrails.as_ref(),
        )
        .await
    }

    /// Deletes every tracked resource, dependents first.
    ///
    /// # Errors
    ///
    /// Returns an error if a protected resource would be deleted, or the
    /// lease or state cannot be maintained.
    pub async fn destroy(&self) -> Result<RunOutcome> {
        info!("Destroying {}", self.spec.qualified_name());
        self.converge(&ResourceGraph::empty(), DeploymentOperation::Destroy, None)
            .await
    }

    /// Drops a resource from state without touching the real resource.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::UnknownResource`] if the resource is not
    /// tracked.
    pub async fn forget(&self, name: &str) -> Result<()> {
        let mut lease = self
            .store
            .acquire_lease(&self.holder, self.options.lease_ttl)
            .await?;
        let result = self.forget_locked(name, &mut lease).await;
        self.release(&lease).await;
        result
    }

    async fn forget_locked(&self, name: &str, lease: &mut Lease) -> Result<()> {
        let mut state = self.load_state().await?;
        if state.remove(name).is_none() {
            return Err(ReconcileError::UnknownResource {
                name: name.to_string(),
            }
            .into());
        }

        // Dependents must not point at an untracked entry.
        let mut dependents = Vec::new();
        for resource in state.resources.values_mut() {
            if resource.dependencies.remove(name) {
                dependents.push(resource.name.clone());
            }
        }
        if !dependents.is_empty() {
            warn!(
                "Forgot '{name}' while {} still depend on it",
                dependents.join(", ")
            );
        }

        let config_hash = state.config_hash.clone();
        state.add_history(DeploymentHistoryEntry::new(
            DeploymentOperation::Forget,
            &config_hash,
            vec![name.to_string()],
        ));
        self.store.save(&mut state, lease).await?;
        info!("Removed '{name}' from state");
        Ok(())
    }

    /// Acquires the lease, executes and always releases it.
    async fn converge(
        &self,
        graph: &ResourceGraph,
        operation: DeploymentOperation,
        guardrails: Option<&GuardrailsConfig>,
    ) -> Result<RunOutcome> {
        let mut lease = self
            .store
            .acquire_lease(&self.holder, self.options.lease_ttl)
            .await?;
        debug!("Acquired lease {} until {}", lease.lease_id, lease.expires_at);

        let result = self
            .converge_locked(graph, operation, guardrails, &mut lease)
            .await;
        self.release(&lease).await;
        result
    }

    async fn converge_locked(
        &self,
        graph: &ResourceGraph,
        operation: DeploymentOperation,
        guardrails: Option<&GuardrailsConfig>,
        lease: &mut Lease,
    ) -> Result<RunOutcome> {
        let mut state = self.load_state().await?;
        let plan = self.plan_against(graph, &state, guardrails)?;

        if !plan.passes_guardrails() {
            return Err(ReconcileError::Aborted {
                reason: plan.guardrail_violations.join("; "),
            }
            .into());
        }

        let engine = ExecutionEngine::new(
            self.store,
            self.registry,
            self.options.clone(),
            self.cancel.clone(),
        );
        let report = engine.execute(&plan, &mut state, lease).await?;

        let touched: Vec<String> = report.results.iter().map(|r| r.name.clone()).collect();
        let entry = match report.failure_report() {
            None => DeploymentHistoryEntry::new(operation, &plan.config_hash, touched),
            Some(failures) => DeploymentHistoryEntry::failed(
                operation,
                &plan.config_hash,
                touched,
                &format!("{} resources did not converge", failures.len()),
            ),
        };
        if report.is_success() {
            state.config_hash.clone_from(&plan.config_hash);
        }
        state.add_history(entry);
        self.store.save(&mut state, lease).await?;

        info!(
            "{operation:?} finished in {}ms: {} applied, {} deleted, {} unsuccessful",
            report.duration_ms(),
            report.count(RecordStatus::Applied),
            report.count(RecordStatus::Deleted),
            report.failure_report().map_or(0, |f| f.len())
        );
        Ok(RunOutcome { plan, report })
    }

    fn build_graph(&self) -> Result<ResourceGraph> {
        Ok(GraphBuilder::new(self.registry).build(&self.spec.resources)?)
    }

    fn plan_against(
        &self,
        graph: &ResourceGraph,
        state: &DeploymentState,
        guardrails: Option<&GuardrailsConfig>,
    ) -> Result<Plan> {
        let changes = DiffEngine::new(self.registry).diff(graph, state)?;
        for (op, count) in summarize(&changes) {
            debug!("{count} x {op}");
        }
        let config_hash = self.hasher.hash_spec(self.spec);
        Ok(Plan::build(changes, guardrails, &config_hash)?)
    }

    /// Loads state, or starts an empty one on first run.
    async fn load_state(&self) -> Result<DeploymentState> {
        let project = &self.spec.project;
        match self.store.load().await? {
            Some(state)
                if state.project != project.name || state.environment != project.environment =>
            {
                Err(KeelsonError::Reconcile(ReconcileError::Aborted {
                    reason: format!(
                        "state belongs to {}/{}, not {}/{}",
                        state.project, state.environment, project.name, project.environment
                    ),
                }))
            }
            Some(state) => Ok(state),
            None => {
                debug!("No state found, starting fresh");
                Ok(DeploymentState::new(&project.name, &project.environment))
            }
        }
    }

    async fn release(&self, lease: &Lease) {
        if let Err(e) = self.store.release_lease(lease).await {
            warn!("Failed to release lease {}: {e}", lease.lease_id);
        }
    }
}

impl std::fmt::Debug for Reconciler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("project", &self.spec.qualified_name())
            .field("backend", &self.store.backend_type())
            .field("options", &self.options)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}
