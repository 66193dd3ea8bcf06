//! sponge-core — environment parameters, descriptors and composition.
//!
//! Everything in this crate is pure data and pure functions: parsing
//! `sponge.toml`, carving the address block into subnets, and computing the
//! module set (with explicit dependencies) that the engine plans and applies.

pub mod cidr;
pub mod compose;
pub mod descriptor;
pub mod error;
pub mod identity;
pub mod outputs;
pub mod params;
pub mod registry;

pub use cidr::Ipv4Cidr;
pub use compose::{Composition, ModuleSpec, compose};
pub use descriptor::*;
pub use error::{ValidationError, ValidationResult};
pub use outputs::{EnvironmentOutputs, ModuleOutputs, OutputValue, Sensitive};
pub use params::EnvironmentParams;
