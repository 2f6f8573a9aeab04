//! Distributed POSIX lock manager over a shared metadata store
//!
//! Responsibilities:
//! - Keep whole-file (`flock`) and byte-range (`fcntl`) lock state in SQL
//!   tables shared by every mount (Postgres in production, SQLite for
//!   single-node use), so that locks are visible across hosts.
//! - Decide every request inside one short transaction that locks the inode
//!   row first; blocked requests poll until granted or cancelled.
//!
//! Submodules:
//! - `file_lock`: lock model, record codec, range algebra, conflict rules
//! - `store`: error type and the transactional storage traits
//! - `stores`: SQL and in-memory backends
//! - `factory`: backend selection from config
//! - `lock_manager`: Flock / Getlk / Setlk
pub(crate) mod backoff;
pub mod config;
pub mod factory;
pub mod file_lock;
pub mod lock_manager;
pub mod store;
pub mod stores;

pub use config::{Config, DatabaseConfig, DatabaseType, LockConfig};
pub use factory::{create_meta_store, create_meta_store_from_url};
pub use lock_manager::LockManager;
pub use store::{MetaError, MetaStore, MetaTxn};
