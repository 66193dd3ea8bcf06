//! sponge.toml environment parameters.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cidr::{DEFAULT_BLOCK, Ipv4Cidr};
use crate::descriptor::{CapacityMode, Taint};
use crate::error::{ValidationError, ValidationResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentParams {
    pub environment: String,
    pub region: String,
    #[serde(default)]
    pub registries: Vec<String>,
    #[serde(default = "default_addons")]
    pub addons: Vec<String>,
    pub network: NetworkParams,
    pub cluster: ClusterParams,
    pub store: StoreParams,
    pub cache: CacheParams,
    pub identity: IdentityParams,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkParams {
    pub address_block: Ipv4Cidr,
    pub zones: Vec<String>,
    #[serde(default = "default_subnet_prefix")]
    pub public_prefix: u8,
    #[serde(default = "default_subnet_prefix")]
    pub private_prefix: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterParams {
    pub version: String,
    pub node_groups: BTreeMap<String, NodeGroupParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGroupParams {
    pub instance_type: String,
    pub min: u32,
    pub desired: u32,
    pub max: u32,
    #[serde(default)]
    pub capacity: CapacityMode,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreParams {
    #[serde(default = "default_engine")]
    pub engine: String,
    pub engine_version: String,
    pub instance_class: String,
    pub storage_gb: u32,
    #[serde(default)]
    pub multi_az: bool,
    #[serde(default = "default_retention")]
    pub backup_retention_days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheParams {
    pub node_type: String,
    #[serde(default = "default_cache_nodes")]
    pub node_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityParams {
    pub service_account: String,
    pub namespace: String,
    pub policy_arns: Vec<String>,
}

fn default_subnet_prefix() -> u8 {
    20
}

fn default_engine() -> String {
    "postgres".to_string()
}

fn default_retention() -> u32 {
    7
}

fn default_cache_nodes() -> u32 {
    1
}

fn default_addons() -> Vec<String> {
    vec![
        "aws-load-balancer-controller".to_string(),
        "cluster-autoscaler".to_string(),
    ]
}

impl EnvironmentParams {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&content)?)
    }

    pub fn from_toml_str(content: &str) -> ValidationResult<Self> {
        toml::from_str(content).map_err(|e| ValidationError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a three-zone environment with one on-demand and one spot
    /// node group.
    pub fn scaffold(environment: &str, region: &str) -> Self {
        let zones = ["a", "b", "c"]
            .iter()
            .map(|suffix| format!("{region}{suffix}"))
            .collect();

        let mut node_groups = BTreeMap::new();
        node_groups.insert(
            "general".to_string(),
            NodeGroupParams {
                instance_type: "m6i.large".to_string(),
                min: 2,
                desired: 3,
                max: 6,
                capacity: CapacityMode::OnDemand,
                labels: BTreeMap::new(),
                taints: Vec::new(),
            },
        );
        node_groups.insert(
            "batch".to_string(),
            NodeGroupParams {
                instance_type: "m6i.xlarge".to_string(),
                min: 0,
                desired: 1,
                max: 10,
                capacity: CapacityMode::Spot,
                labels: BTreeMap::new(),
                taints: Vec::new(),
            },
        );

        EnvironmentParams {
            environment: environment.to_string(),
            region: region.to_string(),
            network: NetworkParams {
                address_block: DEFAULT_BLOCK,
                zones,
                public_prefix: default_subnet_prefix(),
                private_prefix: default_subnet_prefix(),
            },
            cluster: ClusterParams {
                version: "1.29".to_string(),
                node_groups,
            },
            store: StoreParams {
                engine: default_engine(),
                engine_version: "15.4".to_string(),
                instance_class: "db.t3.medium".to_string(),
                storage_gb: 100,
                multi_az: true,
                backup_retention_days: default_retention(),
            },
            cache: CacheParams {
                node_type: "cache.t3.micro".to_string(),
                node_count: 2,
            },
            registries: vec!["sponge-api".to_string(), "sponge-worker".to_string()],
            identity: IdentityParams {
                service_account: "sponge-api".to_string(),
                namespace: "sponge".to_string(),
                policy_arns: vec![
                    "arn:aws:iam::aws:policy/AmazonS3ReadOnlyAccess".to_string(),
                ],
            },
            addons: default_addons(),
            tags: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
environment = "staging"
region = "us-east-1"
registries = ["api"]

[network]
address_block = "10.0.0.0/16"
zones = ["us-east-1a", "us-east-1b"]

[cluster]
version = "1.29"

[cluster.node_groups.general]
instance_type = "m6i.large"
min = 1
desired = 2
max = 3

[store]
engine_version = "15.4"
instance_class = "db.t3.medium"
storage_gb = 50

[cache]
node_type = "cache.t3.micro"

[identity]
service_account = "api"
namespace = "apps"
policy_arns = ["arn:aws:iam::aws:policy/ReadOnlyAccess"]
"#;

    #[test]
    fn parse_minimal_applies_defaults() {
        let params = EnvironmentParams::from_toml_str(MINIMAL).unwrap();
        assert_eq!(params.environment, "staging");
        assert_eq!(params.network.public_prefix, 20);
        assert_eq!(params.network.private_prefix, 20);
        assert_eq!(params.store.engine, "postgres");
        assert_eq!(params.store.backup_retention_days, 7);
        assert!(!params.store.multi_az);
        assert_eq!(params.cache.node_count, 1);
        assert_eq!(params.addons.len(), 2);
        let general = &params.cluster.node_groups["general"];
        assert_eq!(general.capacity, CapacityMode::OnDemand);
    }

    #[test]
    fn bad_cidr_is_a_config_error() {
        let broken = MINIMAL.replace("10.0.0.0/16", "10.0.0.7/16");
        let err = EnvironmentParams::from_toml_str(&broken).unwrap_err();
        assert!(matches!(err, ValidationError::Config(_)));
    }

    #[test]
    fn scaffold_round_trips_through_toml() {
        let params = EnvironmentParams::scaffold("dev", "eu-west-1");
        let text = params.to_toml_string().unwrap();
        assert!(text.contains("eu-west-1a"));
        let back = EnvironmentParams::from_toml_str(&text).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sponge.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let params = EnvironmentParams::from_file(&path).unwrap();
        assert_eq!(params.region, "us-east-1");
    }
}
