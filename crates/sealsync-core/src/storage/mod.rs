//! Storage layer
//!
//! Durable local state of the sync engine, kept in SQLite:
//!
//! - **Op log**: encrypted deltas with a push-status flag
//! - **Snapshots**: one encrypted checkpoint per document
//! - **Sync meta**: per-document cursors and flags
//!
//! Writes are synchronous and committed before they return, so an awaited
//! append is the durability point of a local edit.

pub mod error;
pub mod meta;
mod op_log;
pub mod schema;
mod snapshots;
mod store;

pub use error::{StorageError, StorageResult};
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
pub use store::LocalStore;
