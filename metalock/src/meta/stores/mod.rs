//! Metadata store backends
//!
//! - `database_store`: SQLite / PostgreSQL through sqlx, for shared deployments
//! - `memory_store`: in-process store for tests and single-node setups
pub mod database_store;
pub mod memory_store;

pub use database_store::{DatabaseMetaStore, Dialect};
pub use memory_store::MemoryMetaStore;
