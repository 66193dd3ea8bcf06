//! Composition root — turns environment parameters into the module set.
//!
//! Composition is a pure function: the same parameters always produce the
//! same descriptors (and therefore the same fingerprints), which is what
//! makes re-applying an unchanged environment a no-op.
//!
//! Dependencies are declared here, per module, and nowhere else:
//!
//! ```text
//! network ──┬── cluster ── identity_bindings ── cluster_addons
//!           ├── relational_store
//!           └── cache
//! registries
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use semver::{Version, VersionReq};
use tracing::debug;

use crate::cidr::{SubnetRequest, allocate};
use crate::descriptor::*;
use crate::error::{ValidationError, ValidationResult};
use crate::identity::IdentityBindingDescriptor;
use crate::params::{EnvironmentParams, NodeGroupParams};
use crate::registry::RegistryDescriptor;

/// Oldest control-plane version accepted.
pub const MIN_CONTROL_PLANE: &str = ">=1.24";

/// Namespace cluster add-ons are installed into.
pub const ADDON_NAMESPACE: &str = "kube-system";

static ENVIRONMENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9-]{1,32}$").expect("environment pattern is valid"));

static REGION_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]{2}(-[a-z]+)+-\d+$").expect("region pattern is valid"));

static DNS_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$").expect("DNS label pattern is valid")
});

/// One module of the environment with its declared dependencies.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleSpec {
    pub kind: ModuleKind,
    pub depends_on: Vec<ModuleKind>,
    pub descriptor: ModuleDescriptor,
}

/// The complete desired state of one environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Composition {
    pub environment: String,
    pub region: String,
    pub modules: Vec<ModuleSpec>,
}

impl Composition {
    pub fn get(&self, kind: ModuleKind) -> Option<&ModuleSpec> {
        self.modules.iter().find(|m| m.kind == kind)
    }

    pub fn network(&self) -> Option<&NetworkDescriptor> {
        match self.get(ModuleKind::Network).map(|m| &m.descriptor) {
            Some(ModuleDescriptor::Network(d)) => Some(d),
            _ => None,
        }
    }

    pub fn cluster(&self) -> Option<&ClusterDescriptor> {
        match self.get(ModuleKind::Cluster).map(|m| &m.descriptor) {
            Some(ModuleDescriptor::Cluster(d)) => Some(d),
            _ => None,
        }
    }
}

/// Compute the module set for an environment.
pub fn compose(params: &EnvironmentParams) -> ValidationResult<Composition> {
    check_name("environment", &params.environment, &ENVIRONMENT_NAME)?;
    check_name("region", &params.region, &REGION_NAME)?;
    check_zones(&params.network.zones)?;

    let env = params.environment.as_str();
    let mut tags = params.tags.clone();
    tags.insert("environment".to_string(), env.to_string());
    tags.insert("managed-by".to_string(), "sponge".to_string());

    let modules = vec![
        ModuleSpec {
            kind: ModuleKind::Network,
            depends_on: vec![],
            descriptor: ModuleDescriptor::Network(network(params, &tags)?),
        },
        ModuleSpec {
            kind: ModuleKind::Cluster,
            depends_on: vec![ModuleKind::Network],
            descriptor: ModuleDescriptor::Cluster(cluster(params, &tags)?),
        },
        ModuleSpec {
            kind: ModuleKind::RelationalStore,
            depends_on: vec![ModuleKind::Network],
            descriptor: ModuleDescriptor::RelationalStore(store(params, &tags)?),
        },
        ModuleSpec {
            kind: ModuleKind::Cache,
            depends_on: vec![ModuleKind::Network],
            descriptor: ModuleDescriptor::Cache(cache(params, &tags)),
        },
        ModuleSpec {
            kind: ModuleKind::Registries,
            depends_on: vec![],
            descriptor: ModuleDescriptor::Registries(registries(params)?),
        },
        ModuleSpec {
            kind: ModuleKind::IdentityBindings,
            depends_on: vec![ModuleKind::Cluster],
            descriptor: ModuleDescriptor::IdentityBindings(identity(params)?),
        },
        ModuleSpec {
            kind: ModuleKind::ClusterAddons,
            depends_on: vec![ModuleKind::IdentityBindings],
            descriptor: ModuleDescriptor::ClusterAddons(addons(params)?),
        },
    ];

    for module in &modules {
        module.descriptor.validate()?;
    }

    debug!(environment = env, modules = modules.len(), "composition computed");
    Ok(Composition {
        environment: env.to_string(),
        region: params.region.clone(),
        modules,
    })
}

fn check_name(field: &'static str, value: &str, pattern: &Regex) -> ValidationResult<()> {
    if pattern.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidName {
            field,
            value: value.to_string(),
        })
    }
}

fn check_zones(zones: &[String]) -> ValidationResult<()> {
    if zones.is_empty() {
        return Err(ValidationError::NoZones);
    }
    let mut seen = BTreeSet::new();
    for zone in zones {
        if !seen.insert(zone.as_str()) {
            return Err(ValidationError::DuplicateZone(zone.clone()));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Public,
    Private,
}

fn network(
    params: &EnvironmentParams,
    tags: &BTreeMap<String, String>,
) -> ValidationResult<NetworkDescriptor> {
    let net = &params.network;

    // Private requests first so equal-sized private subnets take the low
    // addresses.
    let mut requests = Vec::with_capacity(net.zones.len() * 2);
    for (i, _) in net.zones.iter().enumerate() {
        requests.push(SubnetRequest {
            key: (i, Tier::Private),
            prefix: net.private_prefix,
        });
    }
    for (i, _) in net.zones.iter().enumerate() {
        requests.push(SubnetRequest {
            key: (i, Tier::Public),
            prefix: net.public_prefix,
        });
    }
    let placed = allocate(net.address_block, &requests)?;
    let subnet = |zone: usize, tier: Tier| {
        placed
            .iter()
            .find(|((idx, t), _)| *idx == zone && *t == tier)
            .map(|(_, cidr)| *cidr)
    };

    let mut zones = Vec::with_capacity(net.zones.len());
    for (i, zone) in net.zones.iter().enumerate() {
        // `allocate` answers every request or fails, so both lookups hit.
        if let (Some(public), Some(private)) = (subnet(i, Tier::Public), subnet(i, Tier::Private)) {
            zones.push(ZoneSubnets {
                zone: zone.clone(),
                public,
                private,
                nat_gateway: format!("{}-nat-{zone}", params.environment),
            });
        }
    }

    Ok(NetworkDescriptor {
        name: format!("{}-network", params.environment),
        address_block: net.address_block,
        zones,
        tags: tags.clone(),
    })
}

fn control_plane_version(raw: &str) -> ValidationResult<String> {
    let unsupported = |reason: String| ValidationError::UnsupportedVersion {
        value: raw.to_string(),
        reason,
    };
    let parts = raw.split('.').count();
    let full = match parts {
        2 => format!("{raw}.0"),
        _ => return Err(unsupported("expected MAJOR.MINOR".to_string())),
    };
    let version = Version::parse(&full).map_err(|e| unsupported(e.to_string()))?;
    let req = VersionReq::parse(MIN_CONTROL_PLANE).map_err(|e| unsupported(e.to_string()))?;
    if !req.matches(&version) {
        return Err(unsupported(format!("requires {MIN_CONTROL_PLANE}")));
    }
    Ok(format!("{}.{}", version.major, version.minor))
}

fn node_group(name: &str, p: &NodeGroupParams) -> ValidationResult<NodeGroup> {
    check_name("node group", name, &DNS_LABEL)?;

    let mut labels = p.labels.clone();
    let mut taints = p.taints.clone();
    match p.capacity {
        CapacityMode::Spot => {
            labels.insert("capacity".to_string(), "spot".to_string());
            let spot = Taint::spot();
            if !taints.contains(&spot) {
                taints.push(spot);
            }
        }
        CapacityMode::OnDemand => {
            labels.insert("capacity".to_string(), "on-demand".to_string());
        }
    }

    Ok(NodeGroup {
        name: name.to_string(),
        instance_type: p.instance_type.clone(),
        scaling: ScalingBounds {
            min: p.min,
            desired: p.desired,
            max: p.max,
        },
        capacity: p.capacity,
        labels,
        taints,
    })
}

fn cluster(
    params: &EnvironmentParams,
    tags: &BTreeMap<String, String>,
) -> ValidationResult<ClusterDescriptor> {
    let node_groups = params
        .cluster
        .node_groups
        .iter()
        .map(|(name, p)| node_group(name, p))
        .collect::<ValidationResult<Vec<_>>>()?;

    Ok(ClusterDescriptor {
        name: format!("{}-cluster", params.environment),
        version: control_plane_version(&params.cluster.version)?,
        node_groups,
        tags: tags.clone(),
    })
}

fn store(
    params: &EnvironmentParams,
    tags: &BTreeMap<String, String>,
) -> ValidationResult<StoreDescriptor> {
    let zones = &params.network.zones;
    let replication = if params.store.multi_az {
        match zones.as_slice() {
            [primary, standby, ..] => Replication::MultiAz {
                primary_zone: primary.clone(),
                standby_zone: standby.clone(),
            },
            _ => return Err(ValidationError::MultiAzRequiresTwoZones(zones.len())),
        }
    } else {
        Replication::SingleAz {
            zone: zones.first().cloned().ok_or(ValidationError::NoZones)?,
        }
    };

    Ok(StoreDescriptor {
        identifier: format!("{}-store", params.environment),
        engine: params.store.engine.clone(),
        engine_version: params.store.engine_version.clone(),
        instance_class: params.store.instance_class.clone(),
        storage_gb: params.store.storage_gb,
        replication,
        backup_retention_days: params.store.backup_retention_days,
        tags: tags.clone(),
    })
}

fn cache(params: &EnvironmentParams, tags: &BTreeMap<String, String>) -> CacheDescriptor {
    let zones = &params.network.zones;
    let placement = (0..params.cache.node_count as usize)
        .filter_map(|i| zones.get(i % zones.len().max(1)).cloned())
        .collect();

    CacheDescriptor {
        identifier: format!("{}-cache", params.environment),
        node_type: params.cache.node_type.clone(),
        node_count: params.cache.node_count,
        zones: placement,
        automatic_failover: params.cache.node_count >= 2,
        tags: tags.clone(),
    }
}

fn registries(params: &EnvironmentParams) -> ValidationResult<RegistrySet> {
    let registries = params
        .registries
        .iter()
        .map(|name| RegistryDescriptor::new(name))
        .collect::<ValidationResult<Vec<_>>>()?;
    Ok(RegistrySet { registries })
}

fn identity(params: &EnvironmentParams) -> ValidationResult<IdentityBindingDescriptor> {
    let id = &params.identity;
    check_name("namespace", &id.namespace, &DNS_LABEL)?;
    check_name("service account", &id.service_account, &DNS_LABEL)?;
    Ok(IdentityBindingDescriptor {
        role_name: format!(
            "{}-{}-{}",
            params.environment, id.namespace, id.service_account
        ),
        namespace: id.namespace.clone(),
        service_account: id.service_account.clone(),
        policy_arns: id.policy_arns.clone(),
    })
}

fn addons(params: &EnvironmentParams) -> ValidationResult<AddonSet> {
    for addon in &params.addons {
        check_name("add-on", addon, &DNS_LABEL)?;
    }
    Ok(AddonSet {
        addons: params.addons.clone(),
        namespace: ADDON_NAMESPACE.to_string(),
    })
}
