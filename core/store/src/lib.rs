//! Document store abstraction for gapsync.
//!
//! Records pulled from the catalog are written through [`DocumentStore`],
//! which upserts by source identifier. Writes are idempotent: replaying a
//! window never creates a second document for the same identifier, and a
//! bad record only counts as an error without failing its batch.

pub mod memory;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{DocumentStore, UpsertSummary};
