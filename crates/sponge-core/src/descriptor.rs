//! Resource descriptors for every module of an environment.
//!
//! Descriptors are pure data computed from `EnvironmentParams`. Each one
//! knows how to check its own invariants; `ModuleDescriptor` wraps them so
//! the engine can treat modules uniformly and fingerprint them for planning.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cidr::{Ipv4Cidr, check_partition};
use crate::error::{ValidationError, ValidationResult};
use crate::identity::IdentityBindingDescriptor;
use crate::registry::RegistryDescriptor;

// ── Modules ───────────────────────────────────────────────────────

/// The named modules of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Network,
    Cluster,
    RelationalStore,
    Cache,
    Registries,
    IdentityBindings,
    ClusterAddons,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 7] = [
        ModuleKind::Network,
        ModuleKind::Cluster,
        ModuleKind::RelationalStore,
        ModuleKind::Cache,
        ModuleKind::Registries,
        ModuleKind::IdentityBindings,
        ModuleKind::ClusterAddons,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::Network => "network",
            ModuleKind::Cluster => "cluster",
            ModuleKind::RelationalStore => "relational_store",
            ModuleKind::Cache => "cache",
            ModuleKind::Registries => "registries",
            ModuleKind::IdentityBindings => "identity_bindings",
            ModuleKind::ClusterAddons => "cluster_addons",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModuleKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s || kind.as_str().replace('_', "-") == s)
            .ok_or_else(|| ValidationError::InvalidName {
                field: "module",
                value: s.to_string(),
            })
    }
}

/// A module's desired configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "module", rename_all = "snake_case")]
pub enum ModuleDescriptor {
    Network(NetworkDescriptor),
    Cluster(ClusterDescriptor),
    RelationalStore(StoreDescriptor),
    Cache(CacheDescriptor),
    Registries(RegistrySet),
    IdentityBindings(IdentityBindingDescriptor),
    ClusterAddons(AddonSet),
}

impl ModuleDescriptor {
    pub fn kind(&self) -> ModuleKind {
        match self {
            ModuleDescriptor::Network(_) => ModuleKind::Network,
            ModuleDescriptor::Cluster(_) => ModuleKind::Cluster,
            ModuleDescriptor::RelationalStore(_) => ModuleKind::RelationalStore,
            ModuleDescriptor::Cache(_) => ModuleKind::Cache,
            ModuleDescriptor::Registries(_) => ModuleKind::Registries,
            ModuleDescriptor::IdentityBindings(_) => ModuleKind::IdentityBindings,
            ModuleDescriptor::ClusterAddons(_) => ModuleKind::ClusterAddons,
        }
    }

    /// Check the descriptor's own invariants.
    pub fn validate(&self) -> ValidationResult<()> {
        match self {
            ModuleDescriptor::Network(d) => d.validate(),
            ModuleDescriptor::Cluster(d) => d.validate(),
            ModuleDescriptor::RelationalStore(d) => d.validate(),
            ModuleDescriptor::Cache(d) => d.validate(),
            ModuleDescriptor::Registries(d) => d.validate(),
            ModuleDescriptor::IdentityBindings(d) => d.validate(),
            ModuleDescriptor::ClusterAddons(_) => Ok(()),
        }
    }

    /// SHA-256 over the canonical JSON form, hex encoded.
    ///
    /// All maps inside descriptors are `BTreeMap`s, so the encoding is stable.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).expect("descriptors contain only string-keyed maps");
        hex::encode(Sha256::digest(&bytes))
    }
}

// ── Network ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    pub name: String,
    pub address_block: Ipv4Cidr,
    pub zones: Vec<ZoneSubnets>,
    pub tags: BTreeMap<String, String>,
}

/// The public/private partition of one availability zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSubnets {
    pub zone: String,
    pub public: Ipv4Cidr,
    pub private: Ipv4Cidr,
    /// NAT gateway hosted in `public`; the private route table targets it.
    pub nat_gateway: String,
}

impl NetworkDescriptor {
    pub fn subnets(&self) -> Vec<Ipv4Cidr> {
        self.zones
            .iter()
            .flat_map(|z| [z.public, z.private])
            .collect()
    }

    pub fn validate(&self) -> ValidationResult<()> {
        if self.zones.is_empty() {
            return Err(ValidationError::NoZones);
        }
        check_partition(&self.address_block, &self.subnets())?;

        let mut nat_per_zone: BTreeMap<&str, usize> = BTreeMap::new();
        for zone in &self.zones {
            *nat_per_zone.entry(zone.zone.as_str()).or_default() += 1;
        }
        for (zone, count) in nat_per_zone {
            if count != 1 {
                return Err(ValidationError::NatPerZone {
                    zone: zone.to_string(),
                    count,
                });
            }
        }
        Ok(())
    }
}

// ── Cluster ───────────────────────────────────────────────────────

/// Taint key attached to spot node groups.
pub const SPOT_TAINT_KEY: &str = "lifecycle";
/// Taint value attached to spot node groups.
pub const SPOT_TAINT_VALUE: &str = "spot";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    pub name: String,
    pub version: String,
    pub node_groups: Vec<NodeGroup>,
    pub tags: BTreeMap<String, String>,
}

impl ClusterDescriptor {
    pub fn validate(&self) -> ValidationResult<()> {
        if self.node_groups.is_empty() {
            return Err(ValidationError::NoNodeGroups);
        }
        for group in &self.node_groups {
            group.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityMode {
    #[default]
    OnDemand,
    Spot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingBounds {
    pub min: u32,
    pub desired: u32,
    pub max: u32,
}

impl ScalingBounds {
    pub fn is_valid(&self) -> bool {
        self.min <= self.desired && self.desired <= self.max && self.max >= 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    pub value: String,
    pub effect: TaintEffect,
}

impl Taint {
    pub fn spot() -> Self {
        Taint {
            key: SPOT_TAINT_KEY.to_string(),
            value: SPOT_TAINT_VALUE.to_string(),
            effect: TaintEffect::NoSchedule,
        }
    }
}

/// A workload's tolerance for a taint. `value: None` tolerates any value,
/// `effect: None` any effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toleration {
    pub key: String,
    pub value: Option<String>,
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    /// The toleration carried by workloads that accept interruption.
    pub fn interruption_tolerant() -> Self {
        Toleration {
            key: SPOT_TAINT_KEY.to_string(),
            value: Some(SPOT_TAINT_VALUE.to_string()),
            effect: Some(TaintEffect::NoSchedule),
        }
    }

    fn tolerates(&self, taint: &Taint) -> bool {
        self.key == taint.key
            && self.value.as_ref().is_none_or(|v| *v == taint.value)
            && self.effect.is_none_or(|e| e == taint.effect)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGroup {
    pub name: String,
    pub instance_type: String,
    pub scaling: ScalingBounds,
    pub capacity: CapacityMode,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
}

impl NodeGroup {
    pub fn validate(&self) -> ValidationResult<()> {
        if !self.scaling.is_valid() {
            return Err(ValidationError::NodeGroupScaling {
                group: self.name.clone(),
                min: self.scaling.min,
                desired: self.scaling.desired,
                max: self.scaling.max,
            });
        }
        if self.capacity == CapacityMode::OnDemand && !self.taints.is_empty() {
            return Err(ValidationError::TaintOnOnDemand {
                group: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Whether a workload with `tolerations` may be scheduled here.
    ///
    /// `PreferNoSchedule` taints never block scheduling.
    pub fn admits(&self, tolerations: &[Toleration]) -> bool {
        self.taints
            .iter()
            .filter(|t| t.effect != TaintEffect::PreferNoSchedule)
            .all(|taint| tolerations.iter().any(|tol| tol.tolerates(taint)))
    }
}

// ── Relational store ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Replication {
    SingleAz { zone: String },
    MultiAz { primary_zone: String, standby_zone: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDescriptor {
    pub identifier: String,
    pub engine: String,
    pub engine_version: String,
    pub instance_class: String,
    pub storage_gb: u32,
    pub replication: Replication,
    pub backup_retention_days: u32,
    pub tags: BTreeMap<String, String>,
}

impl StoreDescriptor {
    pub fn is_multi_az(&self) -> bool {
        matches!(self.replication, Replication::MultiAz { .. })
    }

    pub fn validate(&self) -> ValidationResult<()> {
        if self.backup_retention_days > 35 {
            return Err(ValidationError::RetentionOutOfRange(
                self.backup_retention_days,
            ));
        }
        if !(20..=65536).contains(&self.storage_gb) {
            return Err(ValidationError::StorageOutOfRange(self.storage_gb));
        }
        if let Replication::MultiAz {
            primary_zone,
            standby_zone,
        } = &self.replication
            && (standby_zone.is_empty() || standby_zone == primary_zone)
        {
            return Err(ValidationError::MissingStandby);
        }
        Ok(())
    }
}

// ── Cache ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheDescriptor {
    pub identifier: String,
    pub node_type: String,
    pub node_count: u32,
    pub zones: Vec<String>,
    /// Enabled iff there is a replica to fail over to.
    pub automatic_failover: bool,
    pub tags: BTreeMap<String, String>,
}

impl CacheDescriptor {
    pub fn validate(&self) -> ValidationResult<()> {
        if self.node_count == 0 {
            return Err(ValidationError::CacheNodeCount);
        }
        Ok(())
    }
}

// ── Registries ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySet {
    pub registries: Vec<RegistryDescriptor>,
}

impl RegistrySet {
    pub fn validate(&self) -> ValidationResult<()> {
        let mut seen = std::collections::BTreeSet::new();
        for registry in &self.registries {
            if !seen.insert(registry.name.as_str()) {
                return Err(ValidationError::DuplicateRegistry(registry.name.clone()));
            }
        }
        Ok(())
    }
}

// ── Cluster add-ons ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddonSet {
    /// Add-ons installed into the cluster, each bound to the environment's
    /// workload identity role.
    pub addons: Vec<String>,
    pub namespace: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(capacity: CapacityMode, taints: Vec<Taint>) -> NodeGroup {
        NodeGroup {
            name: "g".to_string(),
            instance_type: "m6i.large".to_string(),
            scaling: ScalingBounds {
                min: 1,
                desired: 2,
                max: 3,
            },
            capacity,
            labels: BTreeMap::new(),
            taints,
        }
    }

    #[test]
    fn module_kind_parses_both_spellings() {
        assert_eq!("relational_store".parse::<ModuleKind>().unwrap(), ModuleKind::RelationalStore);
        assert_eq!("cluster-addons".parse::<ModuleKind>().unwrap(), ModuleKind::ClusterAddons);
        assert!("vpc".parse::<ModuleKind>().is_err());
    }

    #[test]
    fn scaling_bounds_are_ordered() {
        let mut g = group(CapacityMode::OnDemand, vec![]);
        assert!(g.validate().is_ok());
        g.scaling.desired = 5;
        assert!(matches!(
            g.validate(),
            Err(ValidationError::NodeGroupScaling { desired: 5, .. })
        ));
        g.scaling = ScalingBounds {
            min: 0,
            desired: 0,
            max: 0,
        };
        assert!(g.validate().is_err());
    }

    #[test]
    fn on_demand_rejects_taints() {
        let g = group(CapacityMode::OnDemand, vec![Taint::spot()]);
        assert!(matches!(
            g.validate(),
            Err(ValidationError::TaintOnOnDemand { .. })
        ));
    }

    #[test]
    fn spot_admits_only_tolerant_workloads() {
        let spot = group(CapacityMode::Spot, vec![Taint::spot()]);
        assert!(!spot.admits(&[]));
        assert!(spot.admits(&[Toleration::interruption_tolerant()]));

        let wrong_value = Toleration {
            key: SPOT_TAINT_KEY.to_string(),
            value: Some("on-demand".to_string()),
            effect: None,
        };
        assert!(!spot.admits(&[wrong_value]));

        let exists = Toleration {
            key: SPOT_TAINT_KEY.to_string(),
            value: None,
            effect: None,
        };
        assert!(spot.admits(&[exists]));
    }

    #[test]
    fn on_demand_admits_everything() {
        let g = group(CapacityMode::OnDemand, vec![]);
        assert!(g.admits(&[]));
        assert!(g.admits(&[Toleration::interruption_tolerant()]));
    }

    #[test]
    fn prefer_no_schedule_does_not_block() {
        let soft = Taint {
            key: "gpu".to_string(),
            value: "true".to_string(),
            effect: TaintEffect::PreferNoSchedule,
        };
        let g = group(CapacityMode::Spot, vec![soft]);
        assert!(g.admits(&[]));
    }

    #[test]
    fn multi_az_requires_distinct_standby() {
        let mut store = StoreDescriptor {
            identifier: "db".to_string(),
            engine: "postgres".to_string(),
            engine_version: "15.4".to_string(),
            instance_class: "db.t3.medium".to_string(),
            storage_gb: 100,
            replication: Replication::MultiAz {
                primary_zone: "a".to_string(),
                standby_zone: "b".to_string(),
            },
            backup_retention_days: 7,
            tags: BTreeMap::new(),
        };
        assert!(store.validate().is_ok());
        assert!(store.is_multi_az());

        store.replication = Replication::MultiAz {
            primary_zone: "a".to_string(),
            standby_zone: "a".to_string(),
        };
        assert_eq!(store.validate(), Err(ValidationError::MissingStandby));

        store.replication = Replication::SingleAz {
            zone: "a".to_string(),
        };
        store.backup_retention_days = 36;
        assert_eq!(store.validate(), Err(ValidationError::RetentionOutOfRange(36)));
    }

    #[test]
    fn fingerprint_is_stable_and_sensitive() {
        let a = ModuleDescriptor::Cache(CacheDescriptor {
            identifier: "c".to_string(),
            node_type: "cache.t3.micro".to_string(),
            node_count: 1,
            zones: vec!["a".to_string()],
            automatic_failover: false,
            tags: BTreeMap::new(),
        });
        let b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
        // SHA-256 of zero bytes: the descriptor itself must be what is hashed.
        assert_ne!(
            a.fingerprint(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );

        let ModuleDescriptor::Cache(mut changed) = a.clone() else {
            unreachable!()
        };
        changed.node_count = 2;
        assert_ne!(a.fingerprint(), ModuleDescriptor::Cache(changed).fingerprint());
    }
}
