//! Distributed POSIX file locks for a shared-metadata filesystem.
pub mod meta;

pub use meta::file_lock::{
    FileLockInfo, FileLockQuery, FileLockRange, FileLockType, FlockInfo, FlockType, LockHolder,
    PlockInfo, PlockRecord,
};
pub use meta::{
    Config, LockConfig, LockManager, MetaError, MetaStore, create_meta_store,
    create_meta_store_from_url,
};
