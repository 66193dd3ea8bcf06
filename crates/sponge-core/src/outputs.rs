//! Values produced by provisioned modules.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::descriptor::ModuleKind;

pub const NETWORK_ID: &str = "network_id";
pub const PUBLIC_SUBNET_IDS: &str = "public_subnet_ids";
pub const PRIVATE_SUBNET_IDS: &str = "private_subnet_ids";
pub const CLUSTER_NAME: &str = "cluster_name";
pub const CLUSTER_ENDPOINT: &str = "cluster_endpoint";
pub const OIDC_ISSUER: &str = "oidc_issuer";
pub const OIDC_PROVIDER_ARN: &str = "oidc_provider_arn";
pub const STORE_ENDPOINT: &str = "store_endpoint";
pub const CACHE_ENDPOINT: &str = "cache_endpoint";
pub const REGISTRY_URL_PREFIX: &str = "registry_url:";
pub const LIFECYCLE_POLICY_PREFIX: &str = "lifecycle_policy:";
pub const ROLE_ARN: &str = "role_arn";
pub const ADDON_PREFIX: &str = "addon:";

/// A value that must not end up in logs or terminal output by accident.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sensitive<T>(T);

impl<T> Sensitive<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T> fmt::Debug for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(sensitive)")
    }
}

impl<T> fmt::Display for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(sensitive)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputValue {
    pub value: String,
    #[serde(default)]
    pub sensitive: bool,
}

/// Named outputs of a single module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleOutputs(BTreeMap<String, OutputValue>);

impl ModuleOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(
            key.into(),
            OutputValue {
                value: value.into(),
                sensitive: false,
            },
        );
    }

    pub fn insert_sensitive(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(
            key.into(),
            OutputValue {
                value: value.into(),
                sensitive: true,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OutputValue)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The derived values of a whole environment, for downstream consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentOutputs {
    pub network_id: Option<String>,
    pub cluster_name: Option<String>,
    pub cluster_endpoint: Option<Sensitive<String>>,
    pub store_endpoint: Option<Sensitive<String>>,
    pub cache_endpoint: Option<String>,
    pub registry_urls: BTreeMap<String, String>,
    pub identity_role: Option<String>,
}

impl EnvironmentOutputs {
    pub fn collect(modules: &BTreeMap<ModuleKind, ModuleOutputs>) -> Self {
        let get = |kind: ModuleKind, key: &str| {
            modules
                .get(&kind)
                .and_then(|o| o.get(key))
                .map(str::to_string)
        };

        let registry_urls = modules
            .get(&ModuleKind::Registries)
            .map(|outputs| {
                outputs
                    .iter()
                    .filter_map(|(key, v)| {
                        key.strip_prefix(REGISTRY_URL_PREFIX)
                            .map(|name| (name.to_string(), v.value.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        EnvironmentOutputs {
            network_id: get(ModuleKind::Network, NETWORK_ID),
            cluster_name: get(ModuleKind::Cluster, CLUSTER_NAME),
            cluster_endpoint: get(ModuleKind::Cluster, CLUSTER_ENDPOINT).map(Sensitive::new),
            store_endpoint: get(ModuleKind::RelationalStore, STORE_ENDPOINT).map(Sensitive::new),
            cache_endpoint: get(ModuleKind::Cache, CACHE_ENDPOINT),
            registry_urls,
            identity_role: get(ModuleKind::IdentityBindings, ROLE_ARN),
        }
    }

    /// Render as `key = value` lines; sensitive values are masked unless
    /// `show_sensitive` is set.
    pub fn render(&self, show_sensitive: bool) -> String {
        let secret = |v: &Option<Sensitive<String>>| match v {
            Some(s) if show_sensitive => s.expose().clone(),
            Some(s) => s.to_string(),
            None => "-".to_string(),
        };
        let plain = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());

        let mut lines = vec![
            format!("network_id       = {}", plain(&self.network_id)),
            format!("cluster_name     = {}", plain(&self.cluster_name)),
            format!("cluster_endpoint = {}", secret(&self.cluster_endpoint)),
            format!("store_endpoint   = {}", secret(&self.store_endpoint)),
            format!("cache_endpoint   = {}", plain(&self.cache_endpoint)),
            format!("identity_role    = {}", plain(&self.identity_role)),
        ];
        for (name, url) in &self.registry_urls {
            lines.push(format!("registry[{name}] = {url}"));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_never_prints() {
        let s = Sensitive::new("postgres://secret".to_string());
        assert_eq!(format!("{s}"), "(sensitive)");
        assert_eq!(format!("{s:?}"), "(sensitive)");
        assert_eq!(s.expose(), "postgres://secret");
        assert_eq!(serde_json::to_string(&s).unwrap(), "\"postgres://secret\"");
    }

    #[test]
    fn collect_and_render() {
        let mut modules = BTreeMap::new();
        let mut cluster = ModuleOutputs::new();
        cluster.insert(CLUSTER_NAME, "prod");
        cluster.insert_sensitive(CLUSTER_ENDPOINT, "https://abc.eks");
        modules.insert(ModuleKind::Cluster, cluster);

        let mut registries = ModuleOutputs::new();
        registries.insert(format!("{REGISTRY_URL_PREFIX}api"), "123.dkr/api");
        modules.insert(ModuleKind::Registries, registries);

        let outputs = EnvironmentOutputs::collect(&modules);
        assert_eq!(outputs.cluster_name.as_deref(), Some("prod"));
        assert_eq!(outputs.registry_urls["api"], "123.dkr/api");
        assert!(outputs.store_endpoint.is_none());

        let masked = outputs.render(false);
        assert!(masked.contains("cluster_endpoint = (sensitive)"));
        assert!(!masked.contains("abc.eks"));
        assert!(outputs.render(true).contains("https://abc.eks"));
    }
}
