//! sponge-state — persisted apply state for Sponge environments.
//!
//! Backed by [redb](https://docs.rs/redb), stores the last-applied record of
//! every module, the apply lock of every environment, and a short history
//! of apply/destroy runs.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Keys are prefixed by environment (`{environment}/{module}`,
//! `{environment}:{started_at}`), so nothing is shared across environments
//! and prefix scans return exactly one environment's records.
//!
//! Lock acquisition is a check-and-insert inside a single write
//! transaction; redb serializes write transactions, so two applies against
//! the same environment cannot both succeed.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
