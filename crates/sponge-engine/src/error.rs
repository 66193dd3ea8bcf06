//! Engine error types.

use sponge_core::{ModuleKind, ValidationError};
use sponge_state::StateError;
use thiserror::Error;

use crate::provider::{FaultKind, ProvisionError};

/// Errors that can occur while planning, applying or destroying an environment.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),

    /// Unknown dependency, dependency cycle, or a module applied before
    /// its dependencies.
    #[error("dependency error at {module}: {reason}")]
    Dependency { module: ModuleKind, reason: String },

    #[error("{module}: provisioning {resource} failed ({kind}): {reason}")]
    Provisioning {
        module: ModuleKind,
        resource: String,
        kind: FaultKind,
        reason: String,
    },

    /// The environment still differs from its descriptors after a
    /// successful apply.
    #[error("{module} did not converge: {detail}")]
    Convergence { module: ModuleKind, detail: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl EngineError {
    pub(crate) fn provisioning(module: ModuleKind, err: ProvisionError) -> Self {
        EngineError::Provisioning {
            module,
            resource: err.resource,
            kind: err.kind,
            reason: err.message,
        }
    }

    /// The module the error is attributed to, if any.
    pub fn module(&self) -> Option<ModuleKind> {
        match self {
            EngineError::Dependency { module, .. }
            | EngineError::Provisioning { module, .. }
            | EngineError::Convergence { module, .. } => Some(*module),
            _ => None,
        }
    }

    /// True when another run holds the environment lock.
    pub fn is_locked(&self) -> bool {
        matches!(self, EngineError::State(StateError::Locked { .. }))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
