//! The provisioning seam.
//!
//! The engine never talks to a cloud API directly. Everything it does to real
//! resources goes through a [`Provisioner`]: create-or-update a module from its
//! descriptor, destroy it, and observe what currently exists so drift can be
//! detected. [`LocalProvisioner`] is a self-contained implementation that keeps
//! resources in memory (optionally snapshotted to a JSON file) and produces
//! deterministic outputs.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sponge_core::outputs::{
    ADDON_PREFIX, CACHE_ENDPOINT, CLUSTER_ENDPOINT, CLUSTER_NAME, LIFECYCLE_POLICY_PREFIX,
    NETWORK_ID, OIDC_ISSUER, OIDC_PROVIDER_ARN, PRIVATE_SUBNET_IDS, PUBLIC_SUBNET_IDS,
    REGISTRY_URL_PREFIX, ROLE_ARN, STORE_ENDPOINT,
};
use sponge_core::registry::{ImageRecord, LifecycleRule, LifecycleVerdict};
use sponge_core::{ModuleDescriptor, ModuleKind, ModuleOutputs};
use thiserror::Error;
use tracing::{debug, info};

/// Why a provider call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Rate limited; safe to retry after a pause.
    Throttled,
    Quota,
    Permission,
    /// The resource is in a state that does not allow the change.
    Conflict,
    Rejected,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultKind::Throttled => "throttled",
            FaultKind::Quota => "quota exceeded",
            FaultKind::Permission => "permission denied",
            FaultKind::Conflict => "conflict",
            FaultKind::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{resource}: {kind}: {message}")]
pub struct ProvisionError {
    pub kind: FaultKind,
    /// The specific resource the provider was working on.
    pub resource: String,
    pub message: String,
}

impl ProvisionError {
    pub fn new(kind: FaultKind, resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FaultKind::Throttled
    }
}

/// Everything a provider needs to create or update one module.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub environment: String,
    pub region: String,
    pub descriptor: ModuleDescriptor,
    /// Outputs of the module's dependencies, as of this run.
    pub inputs: BTreeMap<ModuleKind, ModuleOutputs>,
}

impl ProvisionRequest {
    pub fn kind(&self) -> ModuleKind {
        self.descriptor.kind()
    }

    fn input(&self, kind: ModuleKind, key: &str) -> Option<&str> {
        self.inputs.get(&kind).and_then(|o| o.get(key))
    }
}

/// What a provider currently sees for a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observed {
    /// Fingerprint of the configuration the live resource matches.
    pub fingerprint: String,
    pub outputs: ModuleOutputs,
}

pub trait Provisioner: Send + Sync + 'static {
    /// Create the module, or converge an existing one onto the descriptor.
    fn provision(
        &self,
        request: &ProvisionRequest,
    ) -> impl Future<Output = Result<ModuleOutputs, ProvisionError>> + Send;

    /// Tear the module down. Destroying something that does not exist succeeds.
    fn destroy(
        &self,
        environment: &str,
        kind: ModuleKind,
    ) -> impl Future<Output = Result<(), ProvisionError>> + Send;

    /// Report the live state of a module, `None` if it does not exist.
    fn observe(
        &self,
        environment: &str,
        kind: ModuleKind,
    ) -> impl Future<Output = Result<Option<Observed>, ProvisionError>> + Send;

    /// Whether in-flight calls may be dropped midway on cancellation.
    fn supports_cancellation(&self) -> bool {
        false
    }
}

// ── Local provisioner ─────────────────────────────────────────────

const LOCAL_ACCOUNT: &str = "000000000000";
/// Fingerprint recorded for resources changed outside of Sponge.
const OUT_OF_BAND: &str = "modified-out-of-band";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LocalResource {
    fingerprint: String,
    outputs: ModuleOutputs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Provision,
    Destroy,
}

/// One mutating call received by a [`LocalProvisioner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    pub call: CallKind,
    pub environment: String,
    pub kind: ModuleKind,
}

/// Images held by one local registry and the rule that expires them.
#[derive(Debug, Default)]
struct RegistryImages {
    rule: LifecycleRule,
    images: Vec<ImageRecord>,
}

#[derive(Debug, Default)]
struct LocalState {
    resources: BTreeMap<String, LocalResource>,
    /// Keyed by `{environment}/{registry}`.
    registries: BTreeMap<String, RegistryImages>,
    faults: BTreeMap<ModuleKind, VecDeque<ProvisionError>>,
    /// Modules whose live configuration never matches what was requested.
    pinned: BTreeSet<ModuleKind>,
    calls: Vec<ProviderCall>,
}

/// In-process provisioner with deterministic outputs.
///
/// Resource identifiers are derived from the environment and module, so
/// re-provisioning a module in place keeps its outputs stable. Faults,
/// throttling, latency and out-of-band drift can be injected.
#[derive(Debug)]
pub struct LocalProvisioner {
    latency: Duration,
    cancellable: bool,
    snapshot: Option<PathBuf>,
    state: Mutex<LocalState>,
}

impl Default for LocalProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalProvisioner {
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            cancellable: false,
            snapshot: None,
            state: Mutex::new(LocalState::default()),
        }
    }

    /// A provisioner whose resources are persisted to `path` after every change.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let mut provisioner = Self::new();
        if path.exists() {
            let bytes = std::fs::read(path)?;
            let resources: BTreeMap<String, LocalResource> =
                serde_json::from_slice(&bytes).map_err(std::io::Error::other)?;
            provisioner.lock().resources = resources;
        }
        provisioner.snapshot = Some(path.to_path_buf());
        debug!(path = %path.display(), "local provisioner opened");
        Ok(provisioner)
    }

    /// Delay every provision call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_cancellation(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }

    /// Fail the next provision of `kind` with `error`.
    pub fn fail_next(&self, kind: ModuleKind, error: ProvisionError) {
        self.lock().faults.entry(kind).or_default().push_back(error);
    }

    /// Throttle the next `times` provisions of `kind`.
    pub fn throttle(&self, kind: ModuleKind, times: usize) {
        for _ in 0..times {
            self.fail_next(
                kind,
                ProvisionError::new(FaultKind::Throttled, kind.as_str(), "rate exceeded"),
            );
        }
    }

    /// Simulate someone changing the live resource outside of Sponge.
    pub fn tamper(&self, environment: &str, kind: ModuleKind) -> bool {
        match self.lock().resources.get_mut(&resource_key(environment, kind)) {
            Some(resource) => {
                resource.fingerprint = OUT_OF_BAND.to_string();
                true
            }
            None => false,
        }
    }

    /// Simulate the live resource disappearing.
    pub fn remove(&self, environment: &str, kind: ModuleKind) -> bool {
        self.lock()
            .resources
            .remove(&resource_key(environment, kind))
            .is_some()
    }

    /// Make `kind` never converge: every provision leaves it drifted.
    pub fn pin_drift(&self, kind: ModuleKind) {
        self.lock().pinned.insert(kind);
    }

    /// Mutating calls received so far, in arrival order.
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn provision_count(&self, kind: ModuleKind) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.call == CallKind::Provision && c.kind == kind)
            .count()
    }

    pub fn exists(&self, environment: &str, kind: ModuleKind) -> bool {
        self.lock()
            .resources
            .contains_key(&resource_key(environment, kind))
    }

    pub fn resource_count(&self) -> usize {
        self.lock().resources.len()
    }

    /// Push an image to a provisioned registry and enforce its lifecycle rule.
    pub fn push_image(
        &self,
        environment: &str,
        registry: &str,
        image: ImageRecord,
    ) -> Result<LifecycleVerdict, ProvisionError> {
        let mut state = self.lock();
        let Some(held) = state.registries.get_mut(&registry_key(environment, registry)) else {
            return Err(ProvisionError::new(
                FaultKind::Rejected,
                registry,
                "registry has not been provisioned",
            ));
        };
        held.images.push(image);
        let verdict = held.rule.evaluate(&held.images);
        held.images = verdict.retained.clone();
        if !verdict.expired.is_empty() {
            debug!(%environment, %registry, expired = verdict.expired.len(), "images expired");
        }
        Ok(verdict)
    }

    /// Images currently held by a registry, newest first.
    pub fn images(&self, environment: &str, registry: &str) -> Vec<ImageRecord> {
        self.lock()
            .registries
            .get(&registry_key(environment, registry))
            .map(|held| held.images.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, state: &LocalState) -> Result<(), ProvisionError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let snapshot_error =
            |e: String| ProvisionError::new(FaultKind::Rejected, path.display().to_string(), e);
        let bytes =
            serde_json::to_vec_pretty(&state.resources).map_err(|e| snapshot_error(e.to_string()))?;
        std::fs::write(path, bytes).map_err(|e| snapshot_error(e.to_string()))
    }

    fn render_outputs(&self, request: &ProvisionRequest) -> Result<ModuleOutputs, ProvisionError> {
        let env = request.environment.as_str();
        let region = request.region.as_str();
        let account = LOCAL_ACCOUNT;
        let mut outputs = ModuleOutputs::new();

        match &request.descriptor {
            ModuleDescriptor::Network(d) => {
                outputs.insert(NETWORK_ID, format!("vpc-{}", short_id(&[env, &d.name])));
                let subnet_ids = |cidrs: Vec<String>| {
                    cidrs
                        .iter()
                        .map(|c| format!("subnet-{}", short_id(&[env, c])))
                        .collect::<Vec<_>>()
                        .join(",")
                };
                outputs.insert(
                    PUBLIC_SUBNET_IDS,
                    subnet_ids(d.zones.iter().map(|z| z.public.to_string()).collect()),
                );
                outputs.insert(
                    PRIVATE_SUBNET_IDS,
                    subnet_ids(d.zones.iter().map(|z| z.private.to_string()).collect()),
                );
            }
            ModuleDescriptor::Cluster(d) => {
                require(request, ModuleKind::Network, PRIVATE_SUBNET_IDS, &d.name)?;
                let id = short_id(&[env, &d.name]).to_uppercase();
                let issuer_host = format!("oidc.eks.{region}.amazonaws.com/id/{id}");
                outputs.insert(CLUSTER_NAME, &d.name);
                outputs.insert_sensitive(
                    CLUSTER_ENDPOINT,
                    format!("https://{id}.gr7.{region}.eks.amazonaws.com"),
                );
                outputs.insert(OIDC_ISSUER, format!("https://{issuer_host}"));
                outputs.insert(
                    OIDC_PROVIDER_ARN,
                    format!("arn:aws:iam::{account}:oidc-provider/{issuer_host}"),
                );
            }
            ModuleDescriptor::RelationalStore(d) => {
                require(request, ModuleKind::Network, PRIVATE_SUBNET_IDS, &d.identifier)?;
                let port = if d.engine == "mysql" { 3306 } else { 5432 };
                outputs.insert_sensitive(
                    STORE_ENDPOINT,
                    format!(
                        "{}.{}.{region}.rds.amazonaws.com:{port}",
                        d.identifier,
                        short_id(&[env, &d.identifier])
                    ),
                );
            }
            ModuleDescriptor::Cache(d) => {
                require(request, ModuleKind::Network, PRIVATE_SUBNET_IDS, &d.identifier)?;
                outputs.insert(
                    CACHE_ENDPOINT,
                    format!(
                        "{}.{}.cache.amazonaws.com:6379",
                        d.identifier,
                        short_id(&[env, &d.identifier])
                    ),
                );
            }
            ModuleDescriptor::Registries(set) => {
                for registry in &set.registries {
                    outputs.insert(
                        format!("{REGISTRY_URL_PREFIX}{}", registry.name),
                        format!("{account}.dkr.ecr.{region}.amazonaws.com/{}", registry.name),
                    );
                    outputs.insert(
                        format!("{LIFECYCLE_POLICY_PREFIX}{}", registry.name),
                        registry.lifecycle.policy_document().to_string(),
                    );
                }
            }
            ModuleDescriptor::IdentityBindings(d) => {
                let provider_arn =
                    require(request, ModuleKind::Cluster, OIDC_PROVIDER_ARN, &d.role_name)?;
                let issuer = require(request, ModuleKind::Cluster, OIDC_ISSUER, &d.role_name)?;
                let policy = d.trust_policy(provider_arn, issuer);
                outputs.insert(ROLE_ARN, format!("arn:aws:iam::{account}:role/{}", d.role_name));
                outputs.insert("trust_policy", policy.document().to_string());
            }
            ModuleDescriptor::ClusterAddons(set) => {
                let role = require(request, ModuleKind::IdentityBindings, ROLE_ARN, "cluster-addons")?;
                for addon in &set.addons {
                    outputs.insert(format!("{ADDON_PREFIX}{addon}"), format!("installed ({role})"));
                }
            }
        }

        Ok(outputs)
    }
}

impl Provisioner for LocalProvisioner {
    async fn provision(&self, request: &ProvisionRequest) -> Result<ModuleOutputs, ProvisionError> {
        let kind = request.kind();
        {
            let mut state = self.lock();
            state.calls.push(ProviderCall {
                call: CallKind::Provision,
                environment: request.environment.clone(),
                kind,
            });
            if let Some(fault) = state.faults.get_mut(&kind).and_then(VecDeque::pop_front) {
                debug!(module = %kind, error = %fault, "injected fault");
                return Err(fault);
            }
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let outputs = self.render_outputs(request)?;
        let mut state = self.lock();
        let fingerprint = if state.pinned.contains(&kind) {
            OUT_OF_BAND.to_string()
        } else {
            request.descriptor.fingerprint()
        };
        state.resources.insert(
            resource_key(&request.environment, kind),
            LocalResource {
                fingerprint,
                outputs: outputs.clone(),
            },
        );
        if let ModuleDescriptor::Registries(set) = &request.descriptor {
            let env = request.environment.as_str();
            let prefix = format!("{env}/");
            let current: BTreeSet<String> = set
                .registries
                .iter()
                .map(|r| registry_key(env, &r.name))
                .collect();
            state
                .registries
                .retain(|key, _| !key.starts_with(&prefix) || current.contains(key));
            for registry in &set.registries {
                state
                    .registries
                    .entry(registry_key(env, &registry.name))
                    .or_default()
                    .rule = registry.lifecycle;
            }
        }
        self.persist(&state)?;

        info!(environment = %request.environment, module = %kind, "provisioned");
        Ok(outputs)
    }

    async fn destroy(&self, environment: &str, kind: ModuleKind) -> Result<(), ProvisionError> {
        let mut state = self.lock();
        state.calls.push(ProviderCall {
            call: CallKind::Destroy,
            environment: environment.to_string(),
            kind,
        });
        if kind == ModuleKind::Registries {
            let prefix = format!("{environment}/");
            state.registries.retain(|key, _| !key.starts_with(&prefix));
        }
        if state.resources.remove(&resource_key(environment, kind)).is_some() {
            self.persist(&state)?;
            info!(%environment, module = %kind, "destroyed");
        }
        Ok(())
    }

    async fn observe(
        &self,
        environment: &str,
        kind: ModuleKind,
    ) -> Result<Option<Observed>, ProvisionError> {
        Ok(self
            .lock()
            .resources
            .get(&resource_key(environment, kind))
            .map(|r| Observed {
                fingerprint: r.fingerprint.clone(),
                outputs: r.outputs.clone(),
            }))
    }

    fn supports_cancellation(&self) -> bool {
        self.cancellable
    }
}

fn resource_key(environment: &str, kind: ModuleKind) -> String {
    format!("{environment}/{kind}")
}

fn registry_key(environment: &str, registry: &str) -> String {
    format!("{environment}/{registry}")
}

fn short_id(parts: &[&str]) -> String {
    let digest = Sha256::digest(parts.join("/").as_bytes());
    hex::encode(&digest[..6])
}

fn require<'a>(
    request: &'a ProvisionRequest,
    kind: ModuleKind,
    key: &str,
    resource: &str,
) -> Result<&'a str, ProvisionError> {
    request.input(kind, key).ok_or_else(|| {
        ProvisionError::new(
            FaultKind::Rejected,
            resource,
            format!("missing input {kind}.{key}"),
        )
    })
}
