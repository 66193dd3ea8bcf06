//! redb table definitions for the Sponge state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Last-applied module records keyed by `{environment}/{module}`.
pub const MODULES: TableDefinition<&str, &[u8]> = TableDefinition::new("modules");

/// Environment-level outputs keyed by `{environment}`.
pub const OUTPUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("outputs");

/// Apply locks keyed by `{environment}`.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");

/// Run history keyed by `{environment}:{started_at_millis:020}:{lock_id}`.
pub const RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");
