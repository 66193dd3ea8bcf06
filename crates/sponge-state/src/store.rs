//! StateStore — redb-backed apply state for Sponge.
//!
//! Provides typed operations over module records, environment locks and
//! run history. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable};
use sponge_core::{EnvironmentOutputs, ModuleKind};
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

static LOCK_SEQ: AtomicU64 = AtomicU64::new(0);

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(MODULES).map_err(map_err!(Table))?;
        txn.open_table(OUTPUTS).map_err(map_err!(Table))?;
        txn.open_table(LOCKS).map_err(map_err!(Table))?;
        txn.open_table(RUNS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Module records ─────────────────────────────────────────────

    /// Insert or update a module record.
    pub fn put_module(&self, record: &ModuleRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(MODULES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, fingerprint = %record.fingerprint, "module record stored");
        Ok(())
    }

    /// Get the record of one module of an environment.
    pub fn get_module(
        &self,
        environment: &str,
        kind: ModuleKind,
    ) -> StateResult<Option<ModuleRecord>> {
        let key = module_key(environment, kind);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MODULES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: ModuleRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all module records of an environment.
    pub fn list_modules(&self, environment: &str) -> StateResult<Vec<ModuleRecord>> {
        let (start, end) = key_range(environment, '/');
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MODULES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: ModuleRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Delete one module record. Returns true if it existed.
    pub fn delete_module(&self, environment: &str, kind: ModuleKind) -> StateResult<bool> {
        let key = module_key(environment, kind);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(MODULES).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "module record deleted");
        Ok(existed)
    }

    /// Names of all environments with at least one module record, sorted.
    pub fn list_environments(&self) -> StateResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MODULES).map_err(map_err!(Table))?;
        let mut envs = BTreeSet::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if let Some((env, _)) = key.value().split_once('/') {
                envs.insert(env.to_string());
            }
        }
        Ok(envs.into_iter().collect())
    }

    // ── Locks ──────────────────────────────────────────────────────

    /// Take the apply lock of an environment.
    ///
    /// Fails with [`StateError::Locked`] if anyone already holds it. The
    /// check and the insert happen in one write transaction.
    pub fn acquire_lock(
        &self,
        environment: &str,
        holder: &str,
        operation: Operation,
    ) -> StateResult<LockInfo> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let lock = {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            if let Some(guard) = table.get(environment).map_err(map_err!(Read))? {
                let existing: LockInfo =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                warn!(
                    environment,
                    holder = %existing.holder,
                    "apply lock already held"
                );
                return Err(StateError::Locked {
                    environment: environment.to_string(),
                    holder: existing.holder,
                    operation: existing.operation.to_string(),
                    acquired_at: existing.acquired_at,
                });
            }
            let now = epoch_millis();
            let lock = LockInfo {
                id: format!(
                    "{holder}-{now}-{}",
                    LOCK_SEQ.fetch_add(1, Ordering::Relaxed)
                ),
                environment: environment.to_string(),
                holder: holder.to_string(),
                operation,
                acquired_at: now / 1000,
            };
            let value = serde_json::to_vec(&lock).map_err(map_err!(Serialize))?;
            table
                .insert(environment, value.as_slice())
                .map_err(map_err!(Write))?;
            lock
        };
        txn.commit().map_err(map_err!(Transaction))?;
        info!(environment, lock_id = %lock.id, %operation, "apply lock acquired");
        Ok(lock)
    }

    /// Release a lock previously returned by [`acquire_lock`](Self::acquire_lock).
    pub fn release_lock(&self, lock: &LockInfo) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let held = match table.get(lock.environment.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let current: LockInfo =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    current.id == lock.id
                }
                None => false,
            };
            if !held {
                return Err(StateError::LockNotHeld {
                    environment: lock.environment.clone(),
                    lock_id: lock.id.clone(),
                });
            }
            table
                .remove(lock.environment.as_str())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(environment = %lock.environment, lock_id = %lock.id, "apply lock released");
        Ok(())
    }

    /// Current lock of an environment, if any.
    pub fn get_lock(&self, environment: &str) -> StateResult<Option<LockInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
        match table.get(environment).map_err(map_err!(Read))? {
            Some(guard) => {
                let lock: LockInfo =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(lock))
            }
            None => Ok(None),
        }
    }

    /// Remove an environment's lock regardless of holder. Returns the
    /// removed lock.
    pub fn force_unlock(&self, environment: &str) -> StateResult<Option<LockInfo>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed = {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            table
                .remove(environment)
                .map_err(map_err!(Write))?
                .map(|guard| serde_json::from_slice::<LockInfo>(guard.value()))
                .transpose()
                .map_err(map_err!(Deserialize))?
        };
        txn.commit().map_err(map_err!(Transaction))?;
        if let Some(lock) = &removed {
            warn!(environment, holder = %lock.holder, "apply lock force-released");
        }
        Ok(removed)
    }

    // ── Outputs ────────────────────────────────────────────────────

    /// Store the outputs of an environment's last successful apply.
    pub fn put_outputs(&self, environment: &str, outputs: &EnvironmentOutputs) -> StateResult<()> {
        let value = serde_json::to_vec(outputs).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(OUTPUTS).map_err(map_err!(Table))?;
            table
                .insert(environment, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn get_outputs(&self, environment: &str) -> StateResult<Option<EnvironmentOutputs>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(OUTPUTS).map_err(map_err!(Table))?;
        match table.get(environment).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }

    pub fn delete_outputs(&self, environment: &str) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(OUTPUTS).map_err(map_err!(Table))?;
            table.remove(environment).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Runs ───────────────────────────────────────────────────────

    /// Append a run to the environment's history.
    pub fn put_run(&self, run: &RunRecord) -> StateResult<()> {
        let key = run.table_key();
        let value = serde_json::to_vec(run).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RUNS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Most recent runs of an environment, newest first.
    pub fn list_runs(&self, environment: &str, limit: usize) -> StateResult<Vec<RunRecord>> {
        let (start, end) = key_range(environment, ':');
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUNS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
            .rev()
            .take(limit)
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let run: RunRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(run);
        }
        Ok(results)
    }
}

/// Bounds of the keys `{environment}{separator}...`: everything from the
/// separator up to (excluding) the byte after it.
fn key_range(environment: &str, separator: char) -> (String, String) {
    let next = char::from(separator as u8 + 1);
    (format!("{environment}{separator}"), format!("{environment}{next}"))
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
