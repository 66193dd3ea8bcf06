//! Persisted types for the Sponge state store.

use std::fmt;

use serde::{Deserialize, Serialize};
use sponge_core::{ModuleDescriptor, ModuleKind, ModuleOutputs};

// ── Module records ────────────────────────────────────────────────

/// The last successfully applied state of one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub environment: String,
    pub kind: ModuleKind,
    /// Dependencies declared at apply time; destroy runs in reverse of these.
    pub depends_on: Vec<ModuleKind>,
    /// Fingerprint of `descriptor` at apply time.
    pub fingerprint: String,
    /// Digest of the dependency outputs this module was applied against.
    pub input_digest: String,
    pub descriptor: ModuleDescriptor,
    pub outputs: ModuleOutputs,
    /// Unix timestamp (seconds) of the apply.
    pub applied_at: u64,
}

impl ModuleRecord {
    /// Build the composite key for the modules table.
    pub fn table_key(&self) -> String {
        module_key(&self.environment, self.kind)
    }
}

pub fn module_key(environment: &str, kind: ModuleKind) -> String {
    format!("{environment}/{kind}")
}

// ── Locks ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Apply,
    Destroy,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Apply => f.write_str("apply"),
            Operation::Destroy => f.write_str("destroy"),
        }
    }
}

/// Who holds an environment's apply lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub id: String,
    pub environment: String,
    pub holder: String,
    pub operation: Operation,
    /// Unix timestamp (seconds) when the lock was taken.
    pub acquired_at: u64,
}

// ── Runs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed {
        module: Option<ModuleKind>,
        reason: String,
    },
    Cancelled,
}

/// One apply or destroy run, for `sponge state history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub environment: String,
    pub operation: Operation,
    /// Unix timestamp (milliseconds).
    pub started_at: u64,
    /// Unix timestamp (milliseconds).
    pub finished_at: u64,
    /// Modules created, updated or deleted by this run.
    pub changed: Vec<ModuleKind>,
    /// Modules not attempted because the run stopped early.
    #[serde(default)]
    pub skipped: Vec<ModuleKind>,
    pub outcome: RunOutcome,
    /// Id of the lock the run held; keeps runs started in the same
    /// millisecond apart.
    #[serde(default)]
    pub lock_id: String,
}

impl RunRecord {
    /// Build the composite key for the runs table.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}:{}", self.environment, self.started_at, self.lock_id)
    }
}
