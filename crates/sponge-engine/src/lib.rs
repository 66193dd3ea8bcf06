//! sponge-engine — plans and applies environments.
//!
//! # Architecture
//!
//! ```text
//! Composition ──▶ ModuleGraph ──▶ plan() ──▶ Applier::apply()
//!                  (waves)        (diff)       │
//!                                              ├─ StateStore (lock, records, runs)
//!                                              └─ Provisioner (provision / destroy / observe)
//! ```
//!
//! The graph orders modules strictly by declared dependencies. The planner
//! compares descriptor fingerprints and dependency-output digests against the
//! recorded state and asks the provider for drift. The applier runs the
//! resulting changes concurrently where the graph allows, holding the
//! environment lock for the whole run, and re-plans at the end to confirm
//! convergence.

pub mod apply;
pub mod error;
pub mod graph;
pub mod plan;
pub mod provider;
pub mod retry;

pub use apply::{Applier, ApplyReport, DestroyReport};
pub use error::{EngineError, EngineResult};
pub use graph::ModuleGraph;
pub use plan::{Action, Plan, PlannedChange};
pub use provider::{
    FaultKind, LocalProvisioner, Observed, ProvisionError, ProvisionRequest, Provisioner,
};
pub use retry::RetryConfig;
