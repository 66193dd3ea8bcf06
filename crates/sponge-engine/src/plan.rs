//! Diffing desired descriptors against recorded and live state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use sha2::{Digest, Sha256};
use sponge_core::{Composition, ModuleKind, ModuleOutputs};
use sponge_state::{ModuleRecord, StateStore};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::graph::ModuleGraph;
use crate::provider::Provisioner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Create,
    Update { reasons: Vec<String> },
    NoOp,
    Delete,
}

impl Action {
    pub fn is_change(&self) -> bool {
        !matches!(self, Action::NoOp)
    }

    fn symbol(&self) -> &'static str {
        match self {
            Action::Create => "+",
            Action::Update { .. } => "~",
            Action::NoOp => " ",
            Action::Delete => "-",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChange {
    pub kind: ModuleKind,
    pub action: Action,
    pub depends_on: Vec<ModuleKind>,
}

/// What an apply would do, in dependency order, or what a destroy would do,
/// dependents first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub environment: String,
    pub changes: Vec<PlannedChange>,
}

impl Plan {
    /// True when applying would not change anything.
    pub fn is_empty(&self) -> bool {
        self.changes.iter().all(|c| !c.action.is_change())
    }

    pub fn action(&self, kind: ModuleKind) -> Option<&Action> {
        self.changes.iter().find(|c| c.kind == kind).map(|c| &c.action)
    }

    /// Modules with a pending change.
    pub fn changed(&self) -> Vec<ModuleKind> {
        self.changes
            .iter()
            .filter(|c| c.action.is_change())
            .map(|c| c.kind)
            .collect()
    }

    /// (create, update, delete) counts.
    pub fn summary(&self) -> (usize, usize, usize) {
        self.changes.iter().fold((0, 0, 0), |(c, u, d), change| match change.action {
            Action::Create => (c + 1, u, d),
            Action::Update { .. } => (c, u + 1, d),
            Action::Delete => (c, u, d + 1),
            Action::NoOp => (c, u, d),
        })
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Plan for environment '{}':", self.environment)?;
        for change in &self.changes {
            write!(f, "  {} {}", change.action.symbol(), change.kind)?;
            if let Action::Update { reasons } = &change.action {
                write!(f, " ({})", reasons.join("; "))?;
            }
            writeln!(f)?;
        }
        let (create, update, delete) = self.summary();
        if self.is_empty() {
            write!(f, "No changes. The environment matches its configuration.")
        } else {
            write!(f, "{create} to create, {update} to update, {delete} to delete.")
        }
    }
}

/// Digest of the dependency outputs a module is applied against.
pub fn input_digest(inputs: &BTreeMap<ModuleKind, ModuleOutputs>) -> String {
    let bytes = serde_json::to_vec(inputs).expect("module outputs are string maps");
    hex::encode(Sha256::digest(&bytes))
}

/// Dependency outputs for `kind`, drawn from `outputs`.
pub(crate) fn inputs_for(
    graph: &ModuleGraph,
    kind: ModuleKind,
    outputs: &BTreeMap<ModuleKind, ModuleOutputs>,
) -> BTreeMap<ModuleKind, ModuleOutputs> {
    graph
        .dependencies(kind)
        .iter()
        .filter_map(|dep| outputs.get(dep).map(|o| (*dep, o.clone())))
        .collect()
}

/// Compute the plan for `composition`.
///
/// A module is updated when its descriptor fingerprint differs from the
/// recorded one, when the outputs of its dependencies differ from the ones it
/// was applied against, or when the provider reports the live resource
/// missing or changed. Changes are listed in dependency order.
pub async fn plan<P: Provisioner>(
    composition: &Composition,
    graph: &ModuleGraph,
    store: &StateStore,
    provider: &P,
) -> EngineResult<Plan> {
    let environment = composition.environment.as_str();
    let records: BTreeMap<ModuleKind, ModuleRecord> = store
        .list_modules(environment)?
        .into_iter()
        .map(|r| (r.kind, r))
        .collect();
    let recorded_outputs: BTreeMap<ModuleKind, ModuleOutputs> = records
        .iter()
        .map(|(kind, r)| (*kind, r.outputs.clone()))
        .collect();

    let mut changes = Vec::new();
    for kind in graph.order() {
        let Some(spec) = composition.get(kind) else {
            continue;
        };
        let action = match records.get(&kind) {
            None => Action::Create,
            Some(record) => {
                let mut reasons = Vec::new();
                if record.fingerprint != spec.descriptor.fingerprint() {
                    reasons.push("configuration changed".to_string());
                }
                let inputs = inputs_for(graph, kind, &recorded_outputs);
                if record.input_digest != input_digest(&inputs) {
                    reasons.push("dependency outputs changed".to_string());
                }
                let observed = provider
                    .observe(environment, kind)
                    .await
                    .map_err(|e| EngineError::provisioning(kind, e))?;
                match observed {
                    None => {
                        warn!(%environment, module = %kind, "recorded resource is missing");
                        reasons.push("drift: resource missing".to_string());
                    }
                    Some(live) if live.fingerprint != record.fingerprint => {
                        warn!(%environment, module = %kind, "resource drifted");
                        reasons.push("drift: modified outside sponge".to_string());
                    }
                    Some(_) => {}
                }
                if reasons.is_empty() {
                    Action::NoOp
                } else {
                    Action::Update { reasons }
                }
            }
        };
        debug!(%environment, module = %kind, ?action, "planned");
        changes.push(PlannedChange {
            kind,
            action,
            depends_on: spec.depends_on.clone(),
        });
    }

    Ok(Plan {
        environment: environment.to_string(),
        changes,
    })
}

/// Compute the teardown of every recorded module of `environment`.
///
/// Ordering comes from the dependencies recorded at apply time, so a
/// destroy does not need the environment's configuration.
pub fn plan_destroy(environment: &str, store: &StateStore) -> EngineResult<Plan> {
    let records = store.list_modules(environment)?;
    let graph = recorded_graph(&records)?;
    let depends_on: BTreeMap<ModuleKind, Vec<ModuleKind>> = records
        .into_iter()
        .map(|r| (r.kind, r.depends_on))
        .collect();

    let changes = graph
        .reverse_order()
        .into_iter()
        .map(|kind| PlannedChange {
            kind,
            action: Action::Delete,
            depends_on: depends_on.get(&kind).cloned().unwrap_or_default(),
        })
        .collect();
    Ok(Plan {
        environment: environment.to_string(),
        changes,
    })
}

/// Graph of recorded modules; dependencies that are no longer recorded are
/// ignored.
fn recorded_graph(records: &[ModuleRecord]) -> EngineResult<ModuleGraph> {
    let recorded: BTreeSet<ModuleKind> = records.iter().map(|r| r.kind).collect();
    ModuleGraph::new(records.iter().map(|r| {
        let deps = r
            .depends_on
            .iter()
            .filter(|d| recorded.contains(d))
            .copied()
            .collect();
        (r.kind, deps)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::LocalProvisioner;
    use sponge_core::{EnvironmentParams, compose};

    #[test]
    fn input_digest_ignores_insertion_order() {
        let mut network = ModuleOutputs::new();
        network.insert("network_id", "vpc-1");
        let mut cluster = ModuleOutputs::new();
        cluster.insert("cluster_name", "dev-cluster");

        let mut a = BTreeMap::new();
        a.insert(ModuleKind::Network, network.clone());
        a.insert(ModuleKind::Cluster, cluster.clone());
        let mut b = BTreeMap::new();
        b.insert(ModuleKind::Cluster, cluster);
        b.insert(ModuleKind::Network, network);
        assert_eq!(input_digest(&a), input_digest(&b));
        assert_ne!(input_digest(&a), input_digest(&BTreeMap::new()));
        // An empty input set still hashes its JSON form (`{}`), not zero bytes.
        assert_ne!(
            input_digest(&BTreeMap::new()),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn fresh_environment_plans_every_module_for_creation() {
        let composition = compose(&EnvironmentParams::scaffold("dev", "us-east-1")).unwrap();
        let graph = ModuleGraph::from_composition(&composition).unwrap();
        let store = StateStore::open_in_memory().unwrap();

        let plan = plan(&composition, &graph, &store, &LocalProvisioner::new())
            .await
            .unwrap();
        assert!(!plan.is_empty());
        assert_eq!(plan.summary(), (7, 0, 0));
        assert_eq!(plan.changes[0].kind, ModuleKind::Network);
        assert_eq!(plan.changes.last().map(|c| c.kind), Some(ModuleKind::ClusterAddons));

        let rendered = plan.to_string();
        assert!(rendered.contains("+ cluster"));
        assert!(rendered.ends_with("7 to create, 0 to update, 0 to delete."));
    }

    fn record(kind: ModuleKind, depends_on: Vec<ModuleKind>) -> ModuleRecord {
        let composition = compose(&EnvironmentParams::scaffold("dev", "us-east-1")).unwrap();
        let descriptor = composition.get(kind).unwrap().descriptor.clone();
        ModuleRecord {
            environment: "dev".to_string(),
            kind,
            depends_on,
            fingerprint: descriptor.fingerprint(),
            input_digest: String::new(),
            descriptor,
            outputs: ModuleOutputs::new(),
            applied_at: 0,
        }
    }

    #[test]
    fn destroy_plan_deletes_dependents_first() {
        use ModuleKind::*;
        let store = StateStore::open_in_memory().unwrap();
        store.put_module(&record(Network, vec![])).unwrap();
        store.put_module(&record(Cluster, vec![Network])).unwrap();
        store.put_module(&record(IdentityBindings, vec![Cluster])).unwrap();
        store.put_module(&record(ClusterAddons, vec![IdentityBindings])).unwrap();
        store.put_module(&record(Cache, vec![Network])).unwrap();

        let plan = plan_destroy("dev", &store).unwrap();
        assert_eq!(plan.summary(), (0, 0, 5));
        let order: Vec<ModuleKind> = plan.changes.iter().map(|c| c.kind).collect();
        let position = |kind| order.iter().position(|k| *k == kind).unwrap();
        assert!(position(ClusterAddons) < position(IdentityBindings));
        assert!(position(IdentityBindings) < position(Cluster));
        assert!(position(Cluster) < position(Network));
        assert!(position(Cache) < position(Network));
        assert_eq!(order.last(), Some(&Network));
        assert!(plan.to_string().contains("- network"));
        assert!(plan.to_string().ends_with("0 to create, 0 to update, 5 to delete."));
    }

    #[test]
    fn destroy_plan_ignores_dependencies_no_longer_recorded() {
        use ModuleKind::*;
        let store = StateStore::open_in_memory().unwrap();
        store.put_module(&record(IdentityBindings, vec![Cluster])).unwrap();

        let plan = plan_destroy("dev", &store).unwrap();
        assert_eq!(plan.changed(), vec![IdentityBindings]);
        assert!(plan_destroy("staging", &store).unwrap().changes.is_empty());
    }

    #[test]
    fn empty_plan_renders_no_changes() {
        let plan = Plan {
            environment: "dev".to_string(),
            changes: vec![PlannedChange {
                kind: ModuleKind::Network,
                action: Action::NoOp,
                depends_on: vec![],
            }],
        };
        assert!(plan.is_empty());
        assert!(plan.to_string().contains("No changes"));
    }
}
