//! Applying and destroying environments.
//!
//! An [`Applier`] holds the environment lock for the whole run. Modules are
//! dispatched as soon as every one of their dependencies has completed in this
//! run, so independent modules are provisioned concurrently. The first failure
//! stops new work from being started: every result that has already arrived is
//! settled before anything else is dispatched. Modules already in flight are
//! allowed to finish and their results are recorded. Nothing is rolled back.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use sponge_core::{Composition, EnvironmentOutputs, ModuleKind, ModuleOutputs};
use sponge_state::store::epoch_millis;
use sponge_state::{LockInfo, ModuleRecord, Operation, RunOutcome, RunRecord, StateStore};
use tokio::sync::watch;
use tokio::task::{self, JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::graph::ModuleGraph;
use crate::plan::{Action, Plan, input_digest, inputs_for, plan, plan_destroy};
use crate::provider::{FaultKind, ProvisionError, ProvisionRequest, Provisioner};
use crate::retry::{RetryConfig, retry_transient};

/// What an apply did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub environment: String,
    pub created: Vec<ModuleKind>,
    pub updated: Vec<ModuleKind>,
    pub unchanged: Vec<ModuleKind>,
    pub outputs: EnvironmentOutputs,
}

impl ApplyReport {
    fn new(environment: &str) -> Self {
        Self {
            environment: environment.to_string(),
            ..Default::default()
        }
    }

    /// Modules created or updated, in completion order.
    pub fn changed(&self) -> Vec<ModuleKind> {
        self.created.iter().chain(&self.updated).copied().collect()
    }

    fn completed(&self) -> BTreeSet<ModuleKind> {
        self.created
            .iter()
            .chain(&self.updated)
            .chain(&self.unchanged)
            .copied()
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestroyReport {
    pub environment: String,
    /// Modules torn down, dependents first.
    pub destroyed: Vec<ModuleKind>,
}

type TaskOutcome = Result<ModuleOutputs, ProvisionError>;

/// What a run touched, for the run history.
#[derive(Debug, Default)]
struct RunLog {
    changed: Vec<ModuleKind>,
    skipped: Vec<ModuleKind>,
}

/// A module handed to the provider in this run.
struct Dispatched {
    request: ProvisionRequest,
    input_digest: String,
    depends_on: Vec<ModuleKind>,
    create: bool,
}

/// Bookkeeping of one apply's dispatch loop.
struct Progress {
    outputs: BTreeMap<ModuleKind, ModuleOutputs>,
    waiting: BTreeMap<ModuleKind, BTreeSet<ModuleKind>>,
    ready: BTreeSet<ModuleKind>,
    in_flight: BTreeMap<task::Id, ModuleKind>,
    dispatched: BTreeMap<ModuleKind, Dispatched>,
    report: ApplyReport,
    failure: Option<EngineError>,
    failed: Vec<ModuleKind>,
}

impl Progress {
    fn fail(&mut self, kind: ModuleKind, error: EngineError) {
        self.failed.push(kind);
        self.failure.get_or_insert(error);
    }

    /// Mark `kind` done and move every module it unblocks into `ready`.
    fn complete(&mut self, kind: ModuleKind) {
        for deps in self.waiting.values_mut() {
            deps.remove(&kind);
        }
        promote_ready(&mut self.waiting, &mut self.ready);
    }
}

pub struct Applier<P: Provisioner> {
    store: StateStore,
    provider: Arc<P>,
    retry: RetryConfig,
    holder: String,
}

impl<P: Provisioner> Applier<P> {
    pub fn new(store: StateStore, provider: Arc<P>) -> Self {
        Self {
            store,
            provider,
            retry: RetryConfig::default(),
            holder: format!("sponge-{}", std::process::id()),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Name recorded as the lock holder.
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Compute what an apply would do without changing anything.
    pub async fn plan(&self, composition: &Composition) -> EngineResult<Plan> {
        let graph = ModuleGraph::from_composition(composition)?;
        plan(composition, &graph, &self.store, self.provider.as_ref()).await
    }

    /// Converge the whole environment onto `composition`.
    ///
    /// Setting `cancel` to `true` stops new modules from starting. In-flight
    /// provider calls are aborted only if the provider supports it; otherwise
    /// they run to completion and are recorded.
    pub async fn apply(
        &self,
        composition: &Composition,
        mut cancel: watch::Receiver<bool>,
    ) -> EngineResult<ApplyReport> {
        let graph = ModuleGraph::from_composition(composition)?;
        let environment = composition.environment.as_str();
        let lock = self
            .store
            .acquire_lock(environment, &self.holder, Operation::Apply)?;
        let started_at = epoch_millis();

        let mut log = RunLog::default();
        let result = self
            .run_apply(composition, &graph, &mut cancel, &mut log)
            .await;

        self.finish(&lock, Operation::Apply, started_at, log, &result);
        result
    }

    /// Apply a single module against the recorded state of its dependencies.
    ///
    /// Fails with a dependency error if any dependency has not been applied
    /// yet, or has pending configuration changes.
    pub async fn apply_module(
        &self,
        composition: &Composition,
        kind: ModuleKind,
    ) -> EngineResult<ApplyReport> {
        let graph = ModuleGraph::from_composition(composition)?;
        let environment = composition.environment.as_str();
        let lock = self
            .store
            .acquire_lock(environment, &self.holder, Operation::Apply)?;
        let started_at = epoch_millis();

        let mut log = RunLog::default();
        let result = self
            .apply_one(composition, &graph, kind, &mut log.changed)
            .await;

        self.finish(&lock, Operation::Apply, started_at, log, &result);
        result
    }

    /// What a destroy of `environment` would remove, dependents first.
    pub fn plan_destroy(&self, environment: &str) -> EngineResult<Plan> {
        plan_destroy(environment, &self.store)
    }

    /// Tear down every recorded module of `environment`, dependents first.
    pub async fn destroy(
        &self,
        environment: &str,
        cancel: watch::Receiver<bool>,
    ) -> EngineResult<DestroyReport> {
        let lock = self
            .store
            .acquire_lock(environment, &self.holder, Operation::Destroy)?;
        let started_at = epoch_millis();

        let mut destroyed = Vec::new();
        let result = self.run_destroy(environment, &cancel, &mut destroyed).await;

        let log = RunLog {
            changed: destroyed.clone(),
            skipped: vec![],
        };
        self.finish(&lock, Operation::Destroy, started_at, log, &result);
        result.map(|()| DestroyReport {
            environment: environment.to_string(),
            destroyed,
        })
    }

    /// Environment-level outputs from the recorded state.
    pub fn outputs(&self, environment: &str) -> EngineResult<EnvironmentOutputs> {
        let modules: BTreeMap<ModuleKind, ModuleOutputs> = self
            .store
            .list_modules(environment)?
            .into_iter()
            .map(|r| (r.kind, r.outputs))
            .collect();
        Ok(EnvironmentOutputs::collect(&modules))
    }

    async fn run_apply(
        &self,
        composition: &Composition,
        graph: &ModuleGraph,
        cancel: &mut watch::Receiver<bool>,
        log: &mut RunLog,
    ) -> EngineResult<ApplyReport> {
        let environment = composition.environment.as_str();
        if *cancel.borrow() {
            return Err(EngineError::Cancelled);
        }

        let plan = plan(composition, graph, &self.store, self.provider.as_ref()).await?;
        let (create, update, _) = plan.summary();
        info!(%environment, create, update, "apply started");

        let records: BTreeMap<ModuleKind, ModuleRecord> = self
            .store
            .list_modules(environment)?
            .into_iter()
            .map(|r| (r.kind, r))
            .collect();

        let mut progress = Progress {
            outputs: records
                .iter()
                .map(|(kind, r)| (*kind, r.outputs.clone()))
                .collect(),
            waiting: graph
                .order()
                .into_iter()
                .map(|kind| (kind, graph.dependencies(kind).iter().copied().collect()))
                .collect(),
            ready: BTreeSet::new(),
            in_flight: BTreeMap::new(),
            dispatched: BTreeMap::new(),
            report: ApplyReport::new(environment),
            failure: None,
            failed: Vec::new(),
        };
        promote_ready(&mut progress.waiting, &mut progress.ready);

        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();
        let mut cancelled = false;
        let mut cancel_open = true;

        loop {
            while progress.failure.is_none() && !cancelled {
                let Some(kind) = progress.ready.pop_first() else {
                    break;
                };
                let Some(spec) = composition.get(kind) else {
                    continue;
                };

                let inputs = inputs_for(graph, kind, &progress.outputs);
                let digest = input_digest(&inputs);
                let action = match plan.action(kind) {
                    Some(Action::NoOp)
                        if records.get(&kind).is_some_and(|r| r.input_digest == digest) =>
                    {
                        None
                    }
                    Some(Action::NoOp) => Some(Action::Update {
                        reasons: vec!["dependency outputs changed".to_string()],
                    }),
                    Some(action) => Some(action.clone()),
                    None => Some(Action::Create),
                };

                let Some(action) = action else {
                    debug!(%environment, module = %kind, "unchanged");
                    progress.report.unchanged.push(kind);
                    progress.complete(kind);
                    continue;
                };

                info!(%environment, module = %kind, ?action, "dispatching");
                let request = ProvisionRequest {
                    environment: environment.to_string(),
                    region: composition.region.clone(),
                    descriptor: spec.descriptor.clone(),
                    inputs,
                };
                let provider = Arc::clone(&self.provider);
                let retry = self.retry.clone();
                let task_request = request.clone();
                let handle = tasks.spawn(async move {
                    let name = format!("provision {kind}");
                    retry_transient(&retry, &name, || provider.provision(&task_request)).await
                });
                progress.in_flight.insert(handle.id(), kind);
                progress.dispatched.insert(
                    kind,
                    Dispatched {
                        request,
                        input_digest: digest,
                        depends_on: spec.depends_on.clone(),
                        create: action == Action::Create,
                    },
                );
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                joined = tasks.join_next_with_id() => {
                    let Some(joined) = joined else {
                        break;
                    };
                    self.settle(joined, &mut progress, log);
                    // A failure among results that are already in must stop
                    // dispatch before any module they unblocked is started.
                    while let Some(joined) = tasks.try_join_next_with_id() {
                        self.settle(joined, &mut progress, log);
                    }
                }
                signal = cancel.changed(), if cancel_open && !cancelled => match signal {
                    Ok(()) if *cancel.borrow() => {
                        cancelled = true;
                        if self.provider.supports_cancellation() {
                            warn!(%environment, in_flight = tasks.len(), "cancelling, aborting in-flight modules");
                            tasks.abort_all();
                        } else {
                            warn!(%environment, in_flight = tasks.len(), "cancelling, waiting for in-flight modules");
                        }
                    }
                    Ok(()) => {}
                    Err(_) => cancel_open = false,
                },
            }
        }

        let Progress {
            mut report,
            failure,
            failed,
            ..
        } = progress;

        if failure.is_some() || cancelled {
            let completed = report.completed();
            log.skipped = graph
                .order()
                .into_iter()
                .filter(|k| !completed.contains(k) && !failed.contains(k))
                .collect();
            if !log.skipped.is_empty() {
                let blocked: BTreeSet<ModuleKind> =
                    failed.iter().flat_map(|k| graph.downstream(*k)).collect();
                warn!(
                    %environment,
                    skipped = %names(&log.skipped),
                    blocked_by_failure = %names(&blocked),
                    "modules not applied"
                );
            }
            return Err(failure.unwrap_or(EngineError::Cancelled));
        }

        self.verify_converged(composition, graph).await?;

        report.outputs = self.outputs(environment)?;
        self.store.put_outputs(environment, &report.outputs)?;
        info!(
            %environment,
            created = report.created.len(),
            updated = report.updated.len(),
            unchanged = report.unchanged.len(),
            "apply complete"
        );
        Ok(report)
    }

    /// Fold one finished provisioning task into the run.
    fn settle(
        &self,
        joined: Result<(task::Id, TaskOutcome), JoinError>,
        progress: &mut Progress,
        log: &mut RunLog,
    ) {
        let id = match &joined {
            Ok((id, _)) => *id,
            Err(join_error) => join_error.id(),
        };
        let Some(kind) = progress.in_flight.remove(&id) else {
            return;
        };
        let Some(done) = progress.dispatched.remove(&kind) else {
            return;
        };
        let environment = done.request.environment.as_str();

        match joined {
            Ok((_, Ok(module_outputs))) => {
                if let Err(e) = self.record(&done, module_outputs.clone()) {
                    error!(%environment, module = %kind, error = %e, "failed to record module");
                    progress.fail(kind, e);
                    return;
                }
                progress.outputs.insert(kind, module_outputs);
                log.changed.push(kind);
                if done.create {
                    progress.report.created.push(kind);
                } else {
                    progress.report.updated.push(kind);
                }
                progress.complete(kind);
            }
            Ok((_, Err(e))) => {
                error!(%environment, module = %kind, error = %e, "provisioning failed");
                progress.fail(kind, EngineError::provisioning(kind, e));
            }
            Err(join_error) if join_error.is_cancelled() => {
                debug!(%environment, module = %kind, "in-flight module aborted");
            }
            Err(join_error) => {
                error!(%environment, module = %kind, error = %join_error, "provisioning task panicked");
                progress.fail(
                    kind,
                    EngineError::provisioning(
                        kind,
                        ProvisionError::new(
                            FaultKind::Rejected,
                            kind.as_str(),
                            format!("provider task panicked: {join_error}"),
                        ),
                    ),
                );
            }
        }
    }

    async fn apply_one(
        &self,
        composition: &Composition,
        graph: &ModuleGraph,
        kind: ModuleKind,
        changed: &mut Vec<ModuleKind>,
    ) -> EngineResult<ApplyReport> {
        let environment = composition.environment.as_str();
        let Some(spec) = composition.get(kind) else {
            return Err(EngineError::Dependency {
                module: kind,
                reason: format!("not part of environment '{environment}'"),
            });
        };

        let mut inputs = BTreeMap::new();
        for dep in graph.dependencies(kind) {
            let desired = composition.get(*dep).map(|s| s.descriptor.fingerprint());
            match self.store.get_module(environment, *dep)? {
                None => {
                    return Err(EngineError::Dependency {
                        module: kind,
                        reason: format!("dependency {dep} has not been applied"),
                    });
                }
                Some(record) if Some(&record.fingerprint) != desired.as_ref() => {
                    return Err(EngineError::Dependency {
                        module: kind,
                        reason: format!("dependency {dep} has pending changes"),
                    });
                }
                Some(record) => {
                    inputs.insert(*dep, record.outputs);
                }
            }
        }

        let mut report = ApplyReport::new(environment);
        let digest = input_digest(&inputs);
        let existing = self.store.get_module(environment, kind)?;
        let live = self
            .provider
            .observe(environment, kind)
            .await
            .map_err(|e| EngineError::provisioning(kind, e))?;
        let up_to_date = existing.as_ref().is_some_and(|r| {
            r.fingerprint == spec.descriptor.fingerprint()
                && r.input_digest == digest
                && live.as_ref().is_some_and(|l| l.fingerprint == r.fingerprint)
        });

        if up_to_date {
            info!(%environment, module = %kind, "module is up to date");
            report.unchanged.push(kind);
        } else {
            let request = ProvisionRequest {
                environment: environment.to_string(),
                region: composition.region.clone(),
                descriptor: spec.descriptor.clone(),
                inputs,
            };
            let name = format!("provision {kind}");
            let outputs = retry_transient(&self.retry, &name, || {
                self.provider.provision(&request)
            })
            .await
            .map_err(|e| EngineError::provisioning(kind, e))?;
            let dispatched = Dispatched {
                request,
                input_digest: digest,
                depends_on: spec.depends_on.clone(),
                create: existing.is_none(),
            };
            self.record(&dispatched, outputs)?;
            changed.push(kind);
            if dispatched.create {
                report.created.push(kind);
            } else {
                report.updated.push(kind);
            }
        }

        report.outputs = self.outputs(environment)?;
        Ok(report)
    }

    async fn run_destroy(
        &self,
        environment: &str,
        cancel: &watch::Receiver<bool>,
        destroyed: &mut Vec<ModuleKind>,
    ) -> EngineResult<()> {
        let plan = plan_destroy(environment, &self.store)?;
        for change in &plan.changes {
            let kind = change.kind;
            if *cancel.borrow() {
                warn!(%environment, "destroy cancelled");
                return Err(EngineError::Cancelled);
            }
            let name = format!("destroy {kind}");
            retry_transient(&self.retry, &name, || {
                self.provider.destroy(environment, kind)
            })
            .await
            .map_err(|e| EngineError::provisioning(kind, e))?;
            self.store.delete_module(environment, kind)?;
            destroyed.push(kind);
        }
        self.store.delete_outputs(environment)?;
        info!(%environment, destroyed = destroyed.len(), "destroy complete");
        Ok(())
    }

    /// Re-plan after a successful apply; any remaining change means the
    /// provider did not converge.
    async fn verify_converged(
        &self,
        composition: &Composition,
        graph: &ModuleGraph,
    ) -> EngineResult<()> {
        let environment = composition.environment.as_str();
        for record in self.store.list_modules(environment)? {
            record
                .descriptor
                .validate()
                .map_err(|e| EngineError::Convergence {
                    module: record.kind,
                    detail: e.to_string(),
                })?;
        }

        let after = plan(composition, graph, &self.store, self.provider.as_ref()).await?;
        if let Some(change) = after.changes.iter().find(|c| c.action.is_change()) {
            let detail = match &change.action {
                Action::Update { reasons } => reasons.join("; "),
                other => format!("{other:?} still pending"),
            };
            error!(%environment, module = %change.kind, %detail, "did not converge");
            return Err(EngineError::Convergence {
                module: change.kind,
                detail,
            });
        }
        Ok(())
    }

    fn record(&self, dispatched: &Dispatched, outputs: ModuleOutputs) -> EngineResult<()> {
        let request = &dispatched.request;
        let record = ModuleRecord {
            environment: request.environment.clone(),
            kind: request.kind(),
            depends_on: dispatched.depends_on.clone(),
            fingerprint: request.descriptor.fingerprint(),
            input_digest: dispatched.input_digest.clone(),
            descriptor: request.descriptor.clone(),
            outputs,
            applied_at: epoch_millis() / 1000,
        };
        self.store.put_module(&record)?;
        Ok(())
    }

    /// Record the run and release the lock. Errors here are logged rather
    /// than returned so they never mask the run's own result.
    fn finish<T>(
        &self,
        lock: &LockInfo,
        operation: Operation,
        started_at: u64,
        log: RunLog,
        result: &EngineResult<T>,
    ) {
        let outcome = match result {
            Ok(_) => RunOutcome::Succeeded,
            Err(EngineError::Cancelled) => RunOutcome::Cancelled,
            Err(e) => RunOutcome::Failed {
                module: e.module(),
                reason: e.to_string(),
            },
        };
        let run = RunRecord {
            environment: lock.environment.clone(),
            operation,
            started_at,
            finished_at: epoch_millis(),
            changed: log.changed,
            skipped: log.skipped,
            outcome,
            lock_id: lock.id.clone(),
        };
        if let Err(e) = self.store.put_run(&run) {
            error!(environment = %lock.environment, error = %e, "failed to record run");
        }
        if let Err(e) = self.store.release_lock(lock) {
            error!(environment = %lock.environment, error = %e, "failed to release lock");
        }
    }
}

/// Move every module whose dependencies have all completed into `ready`.
fn promote_ready(
    waiting: &mut BTreeMap<ModuleKind, BTreeSet<ModuleKind>>,
    ready: &mut BTreeSet<ModuleKind>,
) {
    let unblocked: Vec<ModuleKind> = waiting
        .iter()
        .filter(|(_, deps)| deps.is_empty())
        .map(|(kind, _)| *kind)
        .collect();
    for kind in unblocked {
        waiting.remove(&kind);
        ready.insert(kind);
    }
}

fn names<'a>(kinds: impl IntoIterator<Item = &'a ModuleKind>) -> String {
    kinds
        .into_iter()
        .map(ModuleKind::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
