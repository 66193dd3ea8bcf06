//! Validation errors raised while parsing parameters and composing modules.

use thiserror::Error;

/// Result type alias for parameter validation and composition.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Malformed or insufficient input parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid CIDR {value:?}: {reason}")]
    InvalidCidr { value: String, reason: String },

    #[error("subnet prefix /{requested} does not fit inside parent block {parent}")]
    PrefixExceedsBlock { requested: u8, parent: String },

    #[error(
        "address block {block} is too small: {required} addresses requested, {available} available"
    )]
    AddressSpaceExhausted {
        block: String,
        required: u64,
        available: u64,
    },

    #[error("subnets {a} and {b} overlap")]
    OverlappingSubnets { a: String, b: String },

    #[error("subnet {subnet} is outside address block {block}")]
    SubnetOutsideBlock { subnet: String, block: String },

    #[error("zone list is empty")]
    NoZones,

    #[error("zone {0:?} is listed more than once")]
    DuplicateZone(String),

    #[error("zone {zone:?} has {count} NAT gateways, expected exactly one")]
    NatPerZone { zone: String, count: usize },

    #[error("invalid {field}: {value:?}")]
    InvalidName { field: &'static str, value: String },

    #[error("unsupported control-plane version {value:?}: {reason}")]
    UnsupportedVersion { value: String, reason: String },

    #[error("cluster declares no node groups")]
    NoNodeGroups,

    #[error("node group {group:?} violates min <= desired <= max ({min}/{desired}/{max})")]
    NodeGroupScaling {
        group: String,
        min: u32,
        desired: u32,
        max: u32,
    },

    #[error("on-demand node group {group:?} must not carry taints")]
    TaintOnOnDemand { group: String },

    #[error("backup retention of {0} days is outside 0..=35")]
    RetentionOutOfRange(u32),

    #[error("storage size of {0} GiB is outside 20..=65536")]
    StorageOutOfRange(u32),

    #[error("multi-AZ store needs at least two zones, got {0}")]
    MultiAzRequiresTwoZones(usize),

    #[error("multi-AZ store has no standby replica in a second zone")]
    MissingStandby,

    #[error("cache node count must be at least 1")]
    CacheNodeCount,

    #[error("registry {0:?} is declared more than once")]
    DuplicateRegistry(String),

    #[error("identity binding grants no policies")]
    NoPolicies,

    #[error("invalid policy ARN {0:?}")]
    InvalidPolicyArn(String),

    #[error("config error: {0}")]
    Config(String),
}
