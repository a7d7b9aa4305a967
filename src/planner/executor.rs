//! Execution engine for applying plans.
//!
//! Batches run strictly in order. Records inside a batch are dispatched
//! concurrently up to the configured limit; the coordinator applies every
//! outcome to the in-memory state and persists it once the batch settles.

use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, ExecutionConfig};
use crate::error::{ProviderError, Result};
use crate::graph::reference;
use crate::provider::{Outputs, ProviderRegistry, ResourceProvider};
use crate::state::{DeploymentState, Lease, ResourceState, ResourceStatus, StateStore};

use super::changeset::{ChangeKey, ChangeOp, ChangeRecord};
use super::plan::Plan;
use super::report::{ExecutionReport, RecordResult, RecordStatus};
use super::retry::RetryPolicy;

/// Tuning for an execution run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOptions {
    /// Maximum number of provider calls in flight.
    pub concurrency: usize,
    /// Retry policy for transient errors.
    pub retry: RetryPolicy,
    /// Lease extension applied after each batch.
    pub lease_ttl: Duration,
}

impl ExecutionOptions {
    /// Builds options from the deploy spec's execution settings.
    #[must_use]
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            retry: RetryPolicy::from(&config.retry),
            lease_ttl: config.lease_ttl(),
        }
    }

    /// Overrides the concurrency limit.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

/// Applies plans through resource providers.
pub struct ExecutionEngine<'a> {
    store: &'a dyn StateStore,
    registry: &'a ProviderRegistry,
    options: ExecutionOptions,
    cancel: CancellationToken,
    hasher: ConfigHasher,
}

/// A record ready to be sent to its provider.
struct Dispatch {
    key: ChangeKey,
    provider: Arc<dyn ResourceProvider>,
    properties: Value,
    physical_id: Option<String>,
}

enum TaskOutcome {
    Created { physical_id: String, outputs: Outputs },
    Updated { outputs: Outputs },
    Deleted,
    Failed(ProviderError),
    Cancelled(ProviderError),
}

struct TaskResult {
    key: ChangeKey,
    outcome: TaskOutcome,
    attempts: u32,
    duration: Duration,
}

impl<'a> ExecutionEngine<'a> {
    /// Creates an engine writing state through `store`.
    #[must_use]
    pub fn new(
        store: &'a dyn StateStore,
        registry: &'a ProviderRegistry,
        options: ExecutionOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            registry,
            options,
            cancel,
            hasher: ConfigHasher::new(),
        }
    }

    /// Executes `plan`, updating `state` and persisting it after each batch.
    ///
    /// Failures of individual records never abort the run; they are
    /// reported in the returned [`ExecutionReport`].
    ///
    /// # Errors
    ///
    /// Returns an error only if state cannot be persisted or the lease is
    /// lost.
    pub async fn execute(
        &self,
        plan: &Plan,
        state: &mut DeploymentState,
        lease: &mut Lease,
    ) -> Result<ExecutionReport> {
        let mut report = ExecutionReport::start();
        refresh_unchanged(plan, state);

        if plan.is_empty() {
            report.finish();
            return Ok(report);
        }

        info!(
            "Executing plan: {} changes in {} batches (concurrency {})",
            plan.change_count(),
            plan.batches.len(),
            self.options.concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency));
        let mut unsuccessful: BTreeSet<ChangeKey> = BTreeSet::new();

        for (index, batch) in plan.batches.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("Run cancelled; skipping {} remaining batches", plan.batches.len() - index);
                for record in plan.batches[index..].iter().flatten() {
                    report.results.push(cancelled(record));
                }
                break;
            }

            info!("Batch {}/{}: {} changes", index + 1, plan.batches.len(), batch.len());
            let results = self
                .run_batch(plan, batch, state, &semaphore, &unsuccessful)
                .await;

            for result in results {
                if matches!(result.status, RecordStatus::Failed | RecordStatus::Blocked) {
                    unsuccessful.insert(result.key());
                }
                report.results.push(result);
            }

            self.store.save(state, lease).await?;
            self.store.renew_lease(lease, self.options.lease_ttl).await?;
        }

        report.cancelled = report.count(RecordStatus::Cancelled) > 0;
        report.finish();
        Ok(report)
    }

    /// Runs one batch to completion and applies its outcomes to `state`.
    async fn run_batch(
        &self,
        plan: &Plan,
        batch: &[ChangeRecord],
        state: &mut DeploymentState,
        semaphore: &Arc<Semaphore>,
        unsuccessful: &BTreeSet<ChangeKey>,
    ) -> Vec<RecordResult> {
        let mut settled: HashMap<ChangeKey, RecordResult> = HashMap::new();
        let mut join_set = JoinSet::new();

        for record in batch {
            let key = record.key();

            let blockers: Vec<String> = plan
                .predecessors(&key)
                .into_iter()
                .flatten()
                .filter(|p| unsuccessful.contains(*p))
                .map(|p| p.name.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if !blockers.is_empty() {
                warn!("{key} blocked by {}", blockers.join(", "));
                settled.insert(key, blocked(record, blockers));
                continue;
            }

            let dispatch = match self.prepare(record, state) {
                Ok(dispatch) => dispatch,
                Err(message) => {
                    error!("{key} failed before dispatch: {message}");
                    let outcome = TaskOutcome::Failed(ProviderError::fatal(message));
                    let result = self.apply_outcome(record, state, outcome, 0, Duration::ZERO);
                    settled.insert(key, result);
                    continue;
                }
            };

            let permit = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                permit = Arc::clone(semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                settled.insert(key, cancelled(record));
                continue;
            };

            mark_in_progress(state, record);
            let policy = self.options.retry.clone();
            let cancel = self.cancel.clone();
            join_set.spawn(async move {
                let result = dispatch.run(&policy, &cancel).await;
                drop(permit);
                result
            });
        }

        let mut finished: HashMap<ChangeKey, TaskResult> = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => {
                    finished.insert(result.key.clone(), result);
                }
                Err(join_err) => error!("Worker task failed: {join_err}"),
            }
        }

        let mut results = Vec::with_capacity(batch.len());
        for record in batch {
            let key = record.key();
            let result = if let Some(result) = settled.remove(&key) {
                result
            } else if let Some(task) = finished.remove(&key) {
                self.apply_outcome(record, state, task.outcome, task.attempts, task.duration)
            } else {
                let err = ProviderError::fatal("worker task terminated unexpectedly");
                self.apply_outcome(record, state, TaskOutcome::Failed(err), 0, Duration::ZERO)
            };
            results.push(result);
        }
        results
    }

    /// Resolves references and looks up the provider for a record.
    fn prepare(
        &self,
        record: &ChangeRecord,
        state: &DeploymentState,
    ) -> std::result::Result<Dispatch, String> {
        let provider = self
            .registry
            .get(&record.resource_type)
            .ok_or_else(|| format!("no provider registered for type '{}'", record.resource_type))?;

        let properties = match (&record.operation, &record.properties) {
            (ChangeOp::Create | ChangeOp::Update, Some(props)) => {
                reference::resolve(props, &|r: &reference::Reference| {
                    let target = state.get(&r.target)?;
                    r.select(target.physical_id.as_deref()?, &target.outputs)
                })?
            }
            (ChangeOp::Create | ChangeOp::Update, None) => {
                return Err(String::from("no desired properties recorded"));
            }
            _ => Value::Null,
        };

        let physical_id = record
            .physical_id
            .clone()
            .or_else(|| state.get(&record.name).and_then(|s| s.physical_id.clone()));
        if matches!(record.operation, ChangeOp::Update | ChangeOp::Delete) && physical_id.is_none() {
            return Err(format!("resource '{}' has no physical id", record.name));
        }

        Ok(Dispatch {
            key: record.key(),
            provider,
            properties,
            physical_id,
        })
    }

    /// Applies a task outcome to the state and builds its result.
    fn apply_outcome(
        &self,
        record: &ChangeRecord,
        state: &mut DeploymentState,
        outcome: TaskOutcome,
        attempts: u32,
        duration: Duration,
    ) -> RecordResult {
        let mut result = RecordResult {
            name: record.name.clone(),
            operation: record.operation,
            status: RecordStatus::Applied,
            error: None,
            error_kind: None,
            blocked_by: Vec::new(),
            attempts,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        };

        match outcome {
            TaskOutcome::Created { physical_id, outputs } => {
                info!("Created {} ({physical_id})", record.name);
                let mut resource = ResourceState::new(&record.name, &record.resource_type);
                resource.physical_id = Some(physical_id);
                self.record_applied(&mut resource, record, outputs);
                state.set(resource);
            }
            TaskOutcome::Updated { outputs } => {
                info!("Updated {}", record.name);
                if let Some(resource) = state.get_mut(&record.name) {
                    self.record_applied(resource, record, outputs);
                }
            }
            TaskOutcome::Deleted => {
                info!("Deleted {}", record.name);
                state.remove(&record.name);
                result.status = RecordStatus::Deleted;
            }
            TaskOutcome::Failed(err) => {
                error!("{} {} failed: {err}", record.operation, record.name);
                if let Some(resource) = state.get_mut(&record.name) {
                    resource.mark_failed(err.to_string());
                }
                result.status = RecordStatus::Failed;
                result.error_kind = Some(err.kind);
                result.error = Some(err.message);
            }
            TaskOutcome::Cancelled(err) => {
                warn!("{} {} cancelled during retry: {err}", record.operation, record.name);
                if let Some(resource) = state.get_mut(&record.name) {
                    resource.mark_failed(format!("cancelled: {err}"));
                }
                result.status = RecordStatus::Cancelled;
                result.error_kind = Some(err.kind);
                result.error = Some(err.message);
            }
        }

        result
    }

    fn record_applied(&self, resource: &mut ResourceState, record: &ChangeRecord, outputs: Outputs) {
        let properties = record.properties.clone().unwrap_or(Value::Null);
        resource.properties_hash = self.hasher.hash_properties(&properties);
        resource.properties = properties;
        resource.outputs = outputs;
        resource.dependencies = record.dependencies.clone();
        resource.protect = record.protect;
        resource.last_error = None;
        resource.set_status(ResourceStatus::Applied);
    }
}

impl std::fmt::Debug for ExecutionEngine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("backend", &self.store.backend_type())
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Dispatch {
    async fn run(self, policy: &RetryPolicy, cancel: &CancellationToken) -> TaskResult {
        let start = Instant::now();
        let label = self.key.to_string();
        let provider = &self.provider;
        let properties = &self.properties;
        let physical_id = self.physical_id.as_deref().unwrap_or_default();

        debug!("Dispatching {label}");
        let (outcome, attempts) = match self.key.operation {
            ChangeOp::Create => {
                let attempted = policy
                    .run(&label, cancel, move || provider.create(properties))
                    .await;
                let outcome = match attempted.result {
                    Ok((physical_id, outputs)) => TaskOutcome::Created { physical_id, outputs },
                    Err(err) => failure(err, attempted.cancelled),
                };
                (outcome, attempted.attempts)
            }
            ChangeOp::Update => {
                let attempted = policy
                    .run(&label, cancel, move || provider.update(physical_id, properties))
                    .await;
                let outcome = match attempted.result {
                    Ok(outputs) => TaskOutcome::Updated { outputs },
                    Err(err) => failure(err, attempted.cancelled),
                };
                (outcome, attempted.attempts)
            }
            ChangeOp::Delete => {
                let attempted = policy
                    .run(&label, cancel, move || provider.delete(physical_id))
                    .await;
                let outcome = match attempted.result {
                    Ok(()) => TaskOutcome::Deleted,
                    Err(err) if err.is_not_found() => {
                        debug!("{label}: already absent ({err})");
                        TaskOutcome::Deleted
                    }
                    Err(err) => failure(err, attempted.cancelled),
                };
                (outcome, attempted.attempts)
            }
            ChangeOp::NoOp => (
                TaskOutcome::Failed(ProviderError::fatal("no-op records are never dispatched")),
                0,
            ),
        };

        TaskResult {
            key: self.key.clone(),
            outcome,
            attempts,
            duration: start.elapsed(),
        }
    }
}

const fn failure(err: ProviderError, cancelled: bool) -> TaskOutcome {
    if cancelled {
        TaskOutcome::Cancelled(err)
    } else {
        TaskOutcome::Failed(err)
    }
}

/// Carries dependency and protection changes of unchanged resources into state.
fn refresh_unchanged(plan: &Plan, state: &mut DeploymentState) {
    for record in &plan.unchanged {
        if let Some(resource) = state.get_mut(&record.name) {
            resource.dependencies.clone_from(&record.dependencies);
            resource.protect = record.protect;
        }
    }
}

fn mark_in_progress(state: &mut DeploymentState, record: &ChangeRecord) {
    let status = match record.operation {
        ChangeOp::Update => ResourceStatus::Updating,
        ChangeOp::Delete => ResourceStatus::Deleting,
        ChangeOp::Create | ChangeOp::NoOp => return,
    };
    if let Some(resource) = state.get_mut(&record.name) {
        resource.set_status(status);
    }
}

fn blocked(record: &ChangeRecord, blocked_by: Vec<String>) -> RecordResult {
    RecordResult {
        name: record.name.clone(),
        operation: record.operation,
        status: RecordStatus::Blocked,
        error: None,
        error_kind: None,
        blocked_by,
        attempts: 0,
        duration_ms: 0,
    }
}

fn cancelled(record: &ChangeRecord) -> RecordResult {
    RecordResult {
        status: RecordStatus::Cancelled,
        ..blocked(record, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResourceSpec, RetryConfig};
    use crate::error::ProviderErrorKind;
    use crate::graph::GraphBuilder;
    use crate::planner::DiffEngine;
    use crate::provider::testing::{SCRIPTED_TYPE, ScriptedProvider};
    use crate::provider::MockResourceProvider;
    use crate::state::LocalStateStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Local store that keeps a copy of every saved snapshot.
    struct RecordingStore {
        inner: LocalStateStore,
        saves: Mutex<Vec<DeploymentState>>,
    }

    #[async_trait]
    impl StateStore for RecordingStore {
        async fn load(&self) -> Result<Option<DeploymentState>> {
            self.inner.load().await
        }

        async fn save(&self, state: &mut DeploymentState, lease: &Lease) -> Result<()> {
            self.inner.save(state, lease).await?;
            self.saves.lock().unwrap().push(state.clone());
            Ok(())
        }

        async fn delete(&self, lease: &Lease) -> Result<()> {
            self.inner.delete(lease).await
        }

        async fn exists(&self) -> Result<bool> {
            self.inner.exists().await
        }

        async fn acquire_lease(&self, holder: &str, ttl: Duration) -> Result<Lease> {
            self.inner.acquire_lease(holder, ttl).await
        }

        async fn renew_lease(&self, lease: &mut Lease, ttl: Duration) -> Result<()> {
            self.inner.renew_lease(lease, ttl).await
        }

        async fn release_lease(&self, lease: &Lease) -> Result<()> {
            self.inner.release_lease(lease).await
        }

        async fn break_lease(&self) -> Result<()> {
            self.inner.break_lease().await
        }

        async fn lease_info(&self) -> Result<Option<Lease>> {
            self.inner.lease_info().await
        }

        fn backend_type(&self) -> &'static str {
            "recording"
        }
    }

    struct Harness {
        _dir: TempDir,
        store: RecordingStore,
        registry: ProviderRegistry,
        provider: Arc<ScriptedProvider>,
    }

    impl Harness {
        fn new(provider: ScriptedProvider) -> Self {
            let dir = TempDir::new().unwrap();
            let store = RecordingStore {
                inner: LocalStateStore::with_base_dir(dir.path()),
                saves: Mutex::new(Vec::new()),
            };
            let provider = Arc::new(provider);
            let mut registry = ProviderRegistry::with_builtins(dir.path());
            registry.register(provider.clone());
            Self {
                _dir: dir,
                store,
                registry,
                provider,
            }
        }

        fn plan(&self, resources: Vec<(&str, ResourceSpec)>, state: &DeploymentState) -> Plan {
            let resources: BTreeMap<String, ResourceSpec> =
                resources.into_iter().map(|(n, s)| (n.to_string(), s)).collect();
            let graph = GraphBuilder::new(&self.registry).build(&resources).unwrap();
            let changes = DiffEngine::new(&self.registry).diff(&graph, state).unwrap();
            Plan::build(changes, None, "hash").unwrap()
        }

        async fn run(
            &self,
            plan: &Plan,
            state: &mut DeploymentState,
            options: ExecutionOptions,
            cancel: CancellationToken,
        ) -> ExecutionReport {
            let mut lease = self
                .store
                .acquire_lease("test", Duration::from_secs(60))
                .await
                .unwrap();
            let engine = ExecutionEngine::new(&self.store, &self.registry, options, cancel);
            let report = engine.execute(plan, state, &mut lease).await.unwrap();
            self.store.release_lease(&lease).await.unwrap();
            report
        }

        async fn apply(
            &self,
            resources: Vec<(&str, ResourceSpec)>,
            state: &mut DeploymentState,
        ) -> ExecutionReport {
            let plan = self.plan(resources, state);
            self.run(&plan, state, fast_options(), CancellationToken::new()).await
        }

        fn saves(&self) -> Vec<DeploymentState> {
            self.store.saves.lock().unwrap().clone()
        }
    }

    fn fast_options() -> ExecutionOptions {
        let retry = RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
        };
        ExecutionOptions {
            retry: RetryPolicy::from(&retry),
            ..ExecutionOptions::default()
        }
    }

    fn scripted(name: &str, extra: Value) -> ResourceSpec {
        let mut props = json!({ "name": name });
        if let (Some(map), Some(more)) = (props.as_object_mut(), extra.as_object()) {
            map.extend(more.clone());
        }
        ResourceSpec::new(SCRIPTED_TYPE, props)
    }

    fn new_state() -> DeploymentState {
        DeploymentState::new("demo", "dev")
    }

    #[tokio::test]
    async fn test_dependent_create_waits_and_state_saved_per_batch() {
        let h = Harness::new(ScriptedProvider::new());
        let mut state = new_state();
        let resources = vec![
            ("node_a", scripted("node_a", json!({}))),
            ("node_b", scripted("node_b", json!({"upstream": {"ref": "node_a.arn"}}))),
        ];

        let plan = h.plan(resources, &state);
        assert_eq!(plan.batches.len(), 2);
        assert_eq!(plan.batches[0][0].name, "node_a");
        assert_eq!(plan.batches[1][0].name, "node_b");

        let report = h.run(&plan, &mut state, fast_options(), CancellationToken::new()).await;

        assert!(report.is_success());
        assert_eq!(h.provider.calls(), vec!["create:node_a", "create:node_b"]);

        let saves = h.saves();
        assert_eq!(saves.len(), 2);
        assert_eq!(saves[0].resource_names(), vec!["node_a"]);
        assert_eq!(saves[1].resource_names(), vec!["node_a", "node_b"]);

        let b = state.get("node_b").unwrap();
        assert_eq!(b.status, ResourceStatus::Applied);
        assert_eq!(b.outputs["upstream"], "arn:node_a");
        assert_eq!(b.properties["upstream"], json!({"ref": "node_a.arn"}));
        assert!(b.dependencies.contains("node_a"));
    }

    #[tokio::test]
    async fn test_fatal_failure_blocks_dependents_only() {
        let h = Harness::new(ScriptedProvider::new());
        let mut state = new_state();

        let report = h
            .apply(
                vec![
                    ("node_a", scripted("node_a", json!({"fail": "fatal"}))),
                    ("node_b", scripted("node_b", json!({})).depends_on("node_a")),
                    ("other", scripted("other", json!({}))),
                ],
                &mut state,
            )
            .await;

        assert!(!report.is_success());
        let failures = report.failure_report().unwrap();
        assert_eq!(failures.failed.len(), 1);
        assert_eq!(failures.failed[0].name, "node_a");
        assert_eq!(failures.blocked.len(), 1);
        assert_eq!(failures.blocked[0].name, "node_b");
        assert_eq!(failures.blocked[0].blocked_by, vec!["node_a"]);

        assert!(!h.provider.calls().contains(&"create:node_b".to_string()));
        assert!(state.get("other").unwrap().is_applied());
        assert!(state.get("node_a").is_none());
        assert!(state.get("node_b").is_none());
    }

    #[tokio::test]
    async fn test_blocked_status_propagates_transitively() {
        let h = Harness::new(ScriptedProvider::new());
        let mut state = new_state();

        let report = h
            .apply(
                vec![
                    ("a", scripted("a", json!({"fail": "fatal"}))),
                    ("b", scripted("b", json!({})).depends_on("a")),
                    ("c", scripted("c", json!({})).depends_on("b")),
                ],
                &mut state,
            )
            .await;

        let c = report.get("c", ChangeOp::Create).unwrap();
        assert_eq!(c.status, RecordStatus::Blocked);
        assert_eq!(c.blocked_by, vec!["b"]);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let h = Harness::new(ScriptedProvider::new());
        let mut state = new_state();

        let report = h
            .apply(
                vec![("flaky", scripted("flaky", json!({"fail": "retryable", "fail_times": 2})))],
                &mut state,
            )
            .await;

        assert!(report.is_success());
        assert_eq!(report.get("flaky", ChangeOp::Create).unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail() {
        let h = Harness::new(ScriptedProvider::new());
        let mut state = new_state();

        let report = h
            .apply(vec![("down", scripted("down", json!({"fail": "retryable"})))], &mut state)
            .await;

        let result = report.get("down", ChangeOp::Create).unwrap();
        assert_eq!(result.status, RecordStatus::Failed);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.error_kind, Some(ProviderErrorKind::Retryable));
    }

    #[tokio::test]
    async fn test_applying_twice_is_noop() {
        let h = Harness::new(ScriptedProvider::new());
        let mut state = new_state();
        let resources = || {
            vec![
                ("a", scripted("a", json!({"size": 1}))),
                ("b", scripted("b", json!({"a": "${a}"}))),
            ]
        };

        assert!(h.apply(resources(), &mut state).await.is_success());
        let second = h.plan(resources(), &state);

        assert!(second.is_empty());
        assert_eq!(second.unchanged.len(), 2);
    }

    #[tokio::test]
    async fn test_deletes_dependents_first() {
        let h = Harness::new(ScriptedProvider::new());
        let mut state = new_state();
        h.apply(
            vec![
                ("a", scripted("a", json!({}))),
                ("b", scripted("b", json!({})).depends_on("a")),
            ],
            &mut state,
        )
        .await;

        let report = h.apply(vec![], &mut state).await;

        assert!(report.is_success());
        let calls = h.provider.calls();
        assert_eq!(&calls[calls.len() - 2..], ["delete:b", "delete:a"]);
        assert!(state.resources.is_empty());
    }

    #[tokio::test]
    async fn test_delete_of_missing_resource_succeeds() {
        let h = Harness::new(ScriptedProvider::new().missing("ghost"));
        let mut state = new_state();
        h.apply(vec![("ghost", scripted("ghost", json!({})))], &mut state)
            .await;

        let report = h.apply(vec![], &mut state).await;

        assert!(report.is_success());
        assert_eq!(report.get("ghost", ChangeOp::Delete).unwrap().status, RecordStatus::Deleted);
        assert!(state.get("ghost").is_none());
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_resource_tracked() {
        let h = Harness::new(ScriptedProvider::new().failing_delete("vault"));
        let mut state = new_state();
        h.apply(vec![("vault", scripted("vault", json!({})))], &mut state)
            .await;

        let report = h.apply(vec![], &mut state).await;

        assert!(!report.is_success());
        let vault = state.get("vault").unwrap();
        assert_eq!(vault.status, ResourceStatus::Failed);
        assert_eq!(vault.last_error.as_deref(), Some("vault is in use"));
    }

    #[tokio::test]
    async fn test_replacement_runs_delete_then_create() {
        let h = Harness::new(ScriptedProvider::new());
        let mut state = new_state();
        h.apply(vec![("db", scripted("db", json!({"immutable": 1})))], &mut state)
            .await;

        let report = h
            .apply(vec![("db", scripted("db", json!({"immutable": 2})))], &mut state)
            .await;

        assert!(report.is_success());
        let calls = h.provider.calls();
        assert_eq!(&calls[1..], ["delete:db", "create:db"]);
        assert_eq!(state.get("db").unwrap().properties["immutable"], 2);
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let h = Harness::new(ScriptedProvider::new());
        let mut state = new_state();
        let resources: Vec<(String, ResourceSpec)> = (0..6)
            .map(|i| {
                let name = format!("r{i}");
                let spec = scripted(&name, json!({"delay_ms": 20}));
                (name, spec)
            })
            .collect();
        let plan = h.plan(
            resources.iter().map(|(n, s)| (n.as_str(), s.clone())).collect(),
            &state,
        );
        assert_eq!(plan.batches.len(), 1);

        let options = fast_options().with_concurrency(2);
        let report = h.run(&plan, &mut state, options, CancellationToken::new()).await;

        assert!(report.is_success());
        assert!(h.provider.max_in_flight() <= 2);
        assert!(h.provider.max_in_flight() >= 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_dispatches_nothing() {
        let h = Harness::new(ScriptedProvider::new());
        let mut state = new_state();
        let plan = h.plan(
            vec![
                ("a", scripted("a", json!({}))),
                ("b", scripted("b", json!({})).depends_on("a")),
            ],
            &state,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = h.run(&plan, &mut state, fast_options(), cancel).await;

        assert!(report.cancelled);
        assert!(!report.is_success());
        assert_eq!(report.failure_report().unwrap().cancelled.len(), 2);
        assert!(h.provider.calls().is_empty());
        assert!(state.resources.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_run_finishes_in_flight_work() {
        let h = Harness::new(ScriptedProvider::new());
        let mut state = new_state();
        let plan = h.plan(
            vec![
                ("slow", scripted("slow", json!({"delay_ms": 150}))),
                ("flaky", scripted("flaky", json!({"fail": "retryable"}))),
                ("after", scripted("after", json!({})).depends_on("slow")),
            ],
            &state,
        );
        assert_eq!(plan.batches.len(), 2);

        let retry = RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 10_000,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
        };
        let options = ExecutionOptions {
            retry: RetryPolicy::from(&retry),
            ..ExecutionOptions::default()
        }
        .with_concurrency(4);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let report = h.run(&plan, &mut state, options, cancel).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(report.cancelled);
        assert_eq!(report.get("slow", ChangeOp::Create).unwrap().status, RecordStatus::Applied);

        let flaky = report.get("flaky", ChangeOp::Create).unwrap();
        assert_eq!(flaky.status, RecordStatus::Cancelled);
        assert_eq!(flaky.attempts, 1);
        assert_eq!(report.get("after", ChangeOp::Create).unwrap().status, RecordStatus::Cancelled);

        let saves = h.saves();
        assert_eq!(saves.len(), 1);
        assert!(saves[0].get("slow").unwrap().is_applied());
        assert!(saves[0].get("after").is_none());
        assert!(!h.provider.calls().contains(&"create:after".to_string()));
    }

    #[tokio::test]
    async fn test_updated_outputs_reach_dependents() {
        let h = Harness::new(ScriptedProvider::new());
        let mut state = new_state();
        let resources = |cidr: &str| {
            vec![
                ("vpc", scripted("vpc", json!({ "cidr": cidr }))),
                ("app", scripted("app", json!({"net": "${vpc.cidr}"}))),
            ]
        };
        h.apply(resources("10.0.0.0/16"), &mut state).await;

        let report = h.apply(resources("10.9.0.0/16"), &mut state).await;

        assert!(report.is_success());
        assert_eq!(report.get("app", ChangeOp::Update).unwrap().status, RecordStatus::Applied);
        let calls = h.provider.calls();
        assert_eq!(&calls[2..], ["update:vpc", "update:app"]);
        assert_eq!(state.get("app").unwrap().outputs["net"], "10.9.0.0/16");
        assert!(h.plan(resources("10.9.0.0/16"), &state).is_empty());
    }

    #[tokio::test]
    async fn test_update_failure_keeps_previous_properties() {
        let dir = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(dir.path());
        let mut mock = MockResourceProvider::new();
        mock.expect_resource_type().return_const("mocked");
        mock.expect_validate().returning(|_| Ok(()));
        mock.expect_is_replacement_required().return_const(false);
        mock.expect_update()
            .withf(|id, _| id == "pid-1")
            .times(1)
            .returning(|_, _| Err(ProviderError::fatal("permission denied")));
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(mock));

        let mut state = new_state();
        let mut existing = ResourceState::new("svc", "mocked");
        existing.physical_id = Some("pid-1".into());
        existing.properties = json!({"replicas": 1});
        existing.status = ResourceStatus::Applied;
        state.set(existing);

        let resources: BTreeMap<String, ResourceSpec> =
            [("svc".to_string(), ResourceSpec::new("mocked", json!({"replicas": 3})))].into();
        let graph = GraphBuilder::new(&registry).build(&resources).unwrap();
        let changes = DiffEngine::new(&registry).diff(&graph, &state).unwrap();
        let plan = Plan::build(changes, None, "hash").unwrap();

        let mut lease = store.acquire_lease("test", Duration::from_secs(60)).await.unwrap();
        let engine = ExecutionEngine::new(&store, &registry, fast_options(), CancellationToken::new());
        let report = engine.execute(&plan, &mut state, &mut lease).await.unwrap();

        assert!(!report.is_success());
        let svc = state.get("svc").unwrap();
        assert_eq!(svc.status, ResourceStatus::Failed);
        assert_eq!(svc.properties, json!({"replicas": 1}));
        assert_eq!(svc.last_error.as_deref(), Some("permission denied"));
    }

    #[tokio::test]
    async fn test_unresolvable_reference_fails_record() {
        let h = Harness::new(ScriptedProvider::new());
        let mut state = new_state();

        let report = h
            .apply(
                vec![
                    ("a", scripted("a", json!({}))),
                    ("b", scripted("b", json!({"x": {"ref": "a.missing_output"}}))),
                ],
                &mut state,
            )
            .await;

        let b = report.get("b", ChangeOp::Create).unwrap();
        assert_eq!(b.status, RecordStatus::Failed);
        assert!(b.error.as_deref().unwrap().contains("a.missing_output"));
        assert_eq!(b.attempts, 0);
    }

    #[tokio::test]
    async fn test_lost_lease_aborts_run() {
        let h = Harness::new(ScriptedProvider::new());
        let mut state = new_state();
        let plan = h.plan(vec![("a", scripted("a", json!({})))], &state);

        let mut lease = h.store.acquire_lease("test", Duration::from_secs(60)).await.unwrap();
        h.store.break_lease().await.unwrap();
        let engine = ExecutionEngine::new(&h.store, &h.registry, fast_options(), CancellationToken::new());

        let err = engine.execute(&plan, &mut state, &mut lease).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::KeelsonError::State(crate::error::StateError::LeaseLost { .. })
        ));
    }
}
