//! Apply / destroy integration tests.
//!
//! Every scenario runs in-process against an in-memory state store and the
//! local provisioner, with faults, throttling, latency and drift injected
//! through the provisioner's test hooks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sponge_core::outputs::LIFECYCLE_POLICY_PREFIX;
use sponge_core::{Composition, EnvironmentParams, ModuleKind, ModuleOutputs, compose};
use sponge_engine::provider::CallKind;
use sponge_engine::*;
use sponge_state::{Operation, RunOutcome, StateStore};
use tokio::sync::watch;

use ModuleKind::*;

fn composition(environment: &str) -> Composition {
    compose(&EnvironmentParams::scaffold(environment, "us-east-1")).unwrap()
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 4,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
    }
}

fn applier(provider: LocalProvisioner) -> Applier<LocalProvisioner> {
    Applier::new(StateStore::open_in_memory().unwrap(), Arc::new(provider))
        .with_retry(fast_retry())
        .with_holder("test")
}

/// A receiver whose sender is already gone: the run can never be cancelled.
fn no_cancel() -> watch::Receiver<bool> {
    watch::channel(false).1
}

fn recorded(applier: &Applier<LocalProvisioner>, env: &str) -> Vec<ModuleKind> {
    let mut kinds: Vec<_> = applier
        .store()
        .list_modules(env)
        .unwrap()
        .into_iter()
        .map(|r| r.kind)
        .collect();
    kinds.sort();
    kinds
}

#[tokio::test]
async fn full_apply_respects_dependency_order() {
    let applier = applier(LocalProvisioner::new());
    let composition = composition("dev");

    let report = applier.apply(&composition, no_cancel()).await.unwrap();
    assert_eq!(report.created.len(), 7);
    assert!(report.updated.is_empty());

    let calls = applier.provider().calls();
    let position = |kind: ModuleKind| calls.iter().position(|c| c.kind == kind).unwrap();
    for spec in &composition.modules {
        for dep in &spec.depends_on {
            assert!(
                position(*dep) < position(spec.kind),
                "{dep} must be provisioned before {}",
                spec.kind
            );
        }
    }

    assert_eq!(report.outputs.cluster_name.as_deref(), Some("dev-cluster"));
    assert!(report.outputs.store_endpoint.is_some());
    assert_eq!(report.outputs.registry_urls.len(), 2);
    assert_eq!(
        applier.store().get_outputs("dev").unwrap(),
        Some(report.outputs.clone())
    );
    assert!(applier.store().get_lock("dev").unwrap().is_none());
}

#[tokio::test]
async fn reapply_without_changes_makes_no_provider_calls() {
    let applier = applier(LocalProvisioner::new());
    let composition = composition("dev");
    applier.apply(&composition, no_cancel()).await.unwrap();
    let calls_after_first = applier.provider().call_count();

    assert!(applier.plan(&composition).await.unwrap().is_empty());

    let report = applier.apply(&composition, no_cancel()).await.unwrap();
    assert!(report.changed().is_empty());
    assert_eq!(report.unchanged.len(), 7);
    assert_eq!(applier.provider().call_count(), calls_after_first);
}

#[tokio::test]
async fn config_change_updates_only_that_module() {
    let applier = applier(LocalProvisioner::new());
    let mut params = EnvironmentParams::scaffold("dev", "us-east-1");
    applier
        .apply(&compose(&params).unwrap(), no_cancel())
        .await
        .unwrap();

    params
        .cluster
        .node_groups
        .get_mut("general")
        .unwrap()
        .desired = 4;
    let changed = compose(&params).unwrap();

    let plan = applier.plan(&changed).await.unwrap();
    assert_eq!(plan.changed(), vec![Cluster]);
    assert!(plan.to_string().contains("configuration changed"));

    let report = applier.apply(&changed, no_cancel()).await.unwrap();
    assert_eq!(report.updated, vec![Cluster]);
    assert!(report.created.is_empty());
    // Cluster outputs are stable across in-place updates, so the identity
    // binding downstream is left alone.
    assert!(report.unchanged.contains(&IdentityBindings));
    assert_eq!(applier.provider().provision_count(IdentityBindings), 1);
}

#[tokio::test]
async fn cluster_before_network_is_a_dependency_error() {
    let applier = applier(LocalProvisioner::new());
    let composition = composition("dev");

    let err = applier.apply_module(&composition, Cluster).await.unwrap_err();
    match err {
        EngineError::Dependency { module, reason } => {
            assert_eq!(module, Cluster);
            assert!(reason.contains("network"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(applier.provider().call_count(), 0);
    assert!(applier.store().get_lock("dev").unwrap().is_none());
}

#[tokio::test]
async fn modules_can_be_applied_one_at_a_time() {
    let applier = applier(LocalProvisioner::new());
    let composition = composition("dev");

    let network = applier.apply_module(&composition, Network).await.unwrap();
    assert_eq!(network.created, vec![Network]);
    let cluster = applier.apply_module(&composition, Cluster).await.unwrap();
    assert_eq!(cluster.created, vec![Cluster]);

    let again = applier.apply_module(&composition, Cluster).await.unwrap();
    assert_eq!(again.unchanged, vec![Cluster]);
    assert_eq!(applier.provider().provision_count(Cluster), 1);

    // The whole-environment apply picks up from there.
    let report = applier.apply(&composition, no_cancel()).await.unwrap();
    assert!(report.unchanged.contains(&Network));
    assert!(report.unchanged.contains(&Cluster));
    assert_eq!(report.created.len(), 5);
}

#[tokio::test]
async fn locked_environment_is_rejected() {
    let applier = applier(LocalProvisioner::new());
    let held = applier
        .store()
        .acquire_lock("dev", "someone-else", Operation::Apply)
        .unwrap();

    let err = applier
        .apply(&composition("dev"), no_cancel())
        .await
        .unwrap_err();
    assert!(err.is_locked(), "{err}");
    assert_eq!(applier.provider().call_count(), 0);

    // The other holder's lock is untouched.
    assert_eq!(applier.store().get_lock("dev").unwrap(), Some(held));

    // Other environments are not affected.
    assert!(applier.apply(&composition("prod"), no_cancel()).await.is_ok());
}

#[tokio::test]
async fn failure_halts_dependents_and_keeps_completed_modules() {
    let provider = LocalProvisioner::new();
    provider.fail_next(
        Cache,
        ProvisionError::new(FaultKind::Quota, "dev-cache", "node limit reached"),
    );
    let applier = applier(provider);
    let composition = composition("dev");

    let err = applier.apply(&composition, no_cancel()).await.unwrap_err();
    match &err {
        EngineError::Provisioning {
            module,
            resource,
            kind,
            ..
        } => {
            assert_eq!(*module, Cache);
            assert_eq!(resource, "dev-cache");
            assert_eq!(*kind, FaultKind::Quota);
        }
        other => panic!("unexpected error: {other}"),
    }

    // Siblings already in flight finished and were recorded; nothing past
    // the failure was started, and nothing was rolled back.
    assert_eq!(
        recorded(&applier, "dev"),
        vec![Network, Cluster, RelationalStore, Registries]
    );
    assert_eq!(applier.provider().provision_count(IdentityBindings), 0);

    let runs = applier.store().list_runs("dev", 1).unwrap();
    assert!(matches!(
        runs[0].outcome,
        RunOutcome::Failed {
            module: Some(Cache),
            ..
        }
    ));
    assert_eq!(runs[0].skipped, vec![IdentityBindings, ClusterAddons]);
    assert!(applier.store().get_lock("dev").unwrap().is_none());
    assert!(applier.store().get_outputs("dev").unwrap().is_none());

    // Re-applying picks up where the failed run stopped.
    let mut report = applier.apply(&composition, no_cancel()).await.unwrap();
    report.created.sort();
    assert_eq!(report.created, vec![Cache, IdentityBindings, ClusterAddons]);
    assert_eq!(report.unchanged.len(), 4);
}

#[tokio::test]
async fn throttling_is_retried() {
    let provider = LocalProvisioner::new();
    provider.throttle(Network, 2);
    let applier = applier(provider);

    applier
        .apply(&composition("dev"), no_cancel())
        .await
        .unwrap();
    assert_eq!(applier.provider().provision_count(Network), 3);
}

#[tokio::test]
async fn persistent_throttling_fails_the_run() {
    let provider = LocalProvisioner::new();
    provider.throttle(Registries, 10);
    let applier = applier(provider);

    let err = applier
        .apply(&composition("dev"), no_cancel())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Provisioning {
            module: Registries,
            kind: FaultKind::Throttled,
            ..
        }
    ));
    assert_eq!(applier.provider().provision_count(Registries), 4);
}

#[tokio::test]
async fn drift_is_detected_and_reconciled() {
    let applier = applier(LocalProvisioner::new());
    let composition = composition("dev");
    applier.apply(&composition, no_cancel()).await.unwrap();

    assert!(applier.provider().tamper("dev", Cluster));
    let plan = applier.plan(&composition).await.unwrap();
    match plan.action(Cluster) {
        Some(Action::Update { reasons }) => {
            assert!(reasons.iter().any(|r| r.contains("drift")), "{reasons:?}")
        }
        other => panic!("unexpected action: {other:?}"),
    }

    let report = applier.apply(&composition, no_cancel()).await.unwrap();
    assert_eq!(report.updated, vec![Cluster]);
    assert!(applier.plan(&composition).await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_resource_is_recreated() {
    let applier = applier(LocalProvisioner::new());
    let composition = composition("dev");
    applier.apply(&composition, no_cancel()).await.unwrap();

    assert!(applier.provider().remove("dev", Network));
    let report = applier.apply(&composition, no_cancel()).await.unwrap();
    assert_eq!(report.updated, vec![Network]);
    assert!(applier.provider().exists("dev", Network));
    // Same identifiers come back, so nothing downstream moves.
    assert_eq!(applier.provider().provision_count(Cluster), 1);
}

#[tokio::test]
async fn persistent_drift_is_a_convergence_error() {
    let provider = LocalProvisioner::new();
    provider.pin_drift(Cache);
    let applier = applier(provider);

    let err = applier
        .apply(&composition("dev"), no_cancel())
        .await
        .unwrap_err();
    match err {
        EngineError::Convergence { module, detail } => {
            assert_eq!(module, Cache);
            assert!(detail.contains("drift"), "{detail}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn destroy_tears_down_in_reverse_order() {
    let applier = applier(LocalProvisioner::new());
    applier
        .apply(&composition("dev"), no_cancel())
        .await
        .unwrap();
    applier
        .apply(&composition("prod"), no_cancel())
        .await
        .unwrap();

    let report = applier.destroy("dev", no_cancel()).await.unwrap();
    assert_eq!(report.destroyed.len(), 7);
    assert_eq!(report.destroyed.first(), Some(&ClusterAddons));
    assert_eq!(report.destroyed.last(), Some(&Network));

    let destroy_calls: Vec<ModuleKind> = applier
        .provider()
        .calls()
        .into_iter()
        .filter(|c| c.call == CallKind::Destroy)
        .map(|c| c.kind)
        .collect();
    assert_eq!(destroy_calls, report.destroyed);
    let position = |kind: ModuleKind| destroy_calls.iter().position(|k| *k == kind).unwrap();
    assert!(position(IdentityBindings) < position(Cluster));
    assert!(position(Cluster) < position(Network));

    assert!(recorded(&applier, "dev").is_empty());
    assert_eq!(recorded(&applier, "prod").len(), 7);
    assert_eq!(applier.outputs("dev").unwrap().cluster_name, None);
    assert!(applier.store().get_outputs("dev").unwrap().is_none());
    assert!(applier.store().get_outputs("prod").unwrap().is_some());

    let runs = applier.store().list_runs("dev", 1).unwrap();
    assert_eq!(runs[0].operation, Operation::Destroy);
    assert_eq!(runs[0].outcome, RunOutcome::Succeeded);
}

#[tokio::test]
async fn cancelled_before_start_does_nothing() {
    let applier = applier(LocalProvisioner::new());
    let (tx, rx) = watch::channel(true);

    let err = applier.apply(&composition("dev"), rx).await.unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));
    assert_eq!(applier.provider().call_count(), 0);
    drop(tx);

    let runs = applier.store().list_runs("dev", 1).unwrap();
    assert_eq!(runs[0].outcome, RunOutcome::Cancelled);
}

#[tokio::test]
async fn cancel_waits_for_in_flight_modules() {
    let provider = LocalProvisioner::new().with_latency(Duration::from_millis(200));
    let applier = applier(provider);
    let composition = composition("dev");
    let (tx, rx) = watch::channel(false);

    let cancel = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
    };
    let (result, ()) = tokio::join!(applier.apply(&composition, rx), cancel);

    assert!(matches!(result, Err(EngineError::Cancelled)));
    // The first wave was already running and is recorded; nothing after it
    // was started.
    assert_eq!(recorded(&applier, "dev"), vec![Network, Registries]);
    assert_eq!(applier.provider().provision_count(Cluster), 0);
    assert!(applier.store().get_lock("dev").unwrap().is_none());
}

#[tokio::test]
async fn cancel_aborts_in_flight_calls_when_supported() {
    let provider = LocalProvisioner::new()
        .with_latency(Duration::from_millis(500))
        .with_cancellation(true);
    let applier = applier(provider);
    let composition = composition("dev");
    let (tx, rx) = watch::channel(false);

    let cancel = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
    };
    let (result, ()) = tokio::join!(applier.apply(&composition, rx), cancel);

    assert!(matches!(result, Err(EngineError::Cancelled)));
    assert!(recorded(&applier, "dev").is_empty());
    assert!(!applier.provider().exists("dev", Network));
}

#[tokio::test]
async fn independent_modules_run_concurrently() {
    let provider = LocalProvisioner::new().with_latency(Duration::from_millis(100));
    let applier = applier(provider);

    let started = Instant::now();
    applier
        .apply(&composition("dev"), no_cancel())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // Four waves of 100ms each; sequential provisioning would take 700ms.
    assert!(elapsed < Duration::from_millis(650), "took {elapsed:?}");
}

#[tokio::test]
async fn registries_are_applied_with_their_lifecycle_rule() {
    let applier = applier(LocalProvisioner::new());
    let composition = composition("dev");
    applier.apply(&composition, no_cancel()).await.unwrap();

    let record = applier
        .store()
        .get_module("dev", Registries)
        .unwrap()
        .unwrap();
    for name in ["sponge-api", "sponge-worker"] {
        let document = record
            .outputs
            .get(&format!("{LIFECYCLE_POLICY_PREFIX}{name}"))
            .unwrap_or_else(|| panic!("{name} has no lifecycle policy"));
        let policy: serde_json::Value = serde_json::from_str(document).unwrap();
        assert_eq!(policy["rules"][0]["selection"]["countNumber"], 10);
        assert_eq!(policy["rules"][0]["action"]["type"], "expire");
    }
}

/// Delegates to a [`LocalProvisioner`] but panics when asked to provision
/// one module.
struct PanickingProvisioner {
    inner: LocalProvisioner,
    panic_on: ModuleKind,
}

impl Provisioner for PanickingProvisioner {
    async fn provision(&self, request: &ProvisionRequest) -> Result<ModuleOutputs, ProvisionError> {
        if request.kind() == self.panic_on {
            panic!("provider bug while provisioning {}", self.panic_on);
        }
        self.inner.provision(request).await
    }

    async fn destroy(&self, environment: &str, kind: ModuleKind) -> Result<(), ProvisionError> {
        self.inner.destroy(environment, kind).await
    }

    async fn observe(
        &self,
        environment: &str,
        kind: ModuleKind,
    ) -> Result<Option<Observed>, ProvisionError> {
        self.inner.observe(environment, kind).await
    }
}

#[tokio::test]
async fn panicking_provider_fails_the_module_and_halts_dispatch() {
    let provider = PanickingProvisioner {
        inner: LocalProvisioner::new(),
        panic_on: Cache,
    };
    let applier = Applier::new(StateStore::open_in_memory().unwrap(), Arc::new(provider))
        .with_retry(fast_retry())
        .with_holder("test");

    let err = applier
        .apply(&composition("dev"), no_cancel())
        .await
        .unwrap_err();
    match &err {
        EngineError::Provisioning { module, reason, .. } => {
            assert_eq!(*module, Cache);
            assert!(reason.contains("panicked"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(applier.provider().inner.provision_count(IdentityBindings), 0);
    assert_eq!(applier.provider().inner.provision_count(ClusterAddons), 0);
    assert!(applier.store().get_module("dev", Cache).unwrap().is_none());
    assert!(applier.store().get_lock("dev").unwrap().is_none());

    let runs = applier.store().list_runs("dev", 1).unwrap();
    assert_eq!(runs[0].skipped, vec![IdentityBindings, ClusterAddons]);
}
