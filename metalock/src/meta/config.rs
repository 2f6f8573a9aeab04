//! Metadata backend and lock manager configuration.
//!
//! Loaded from a YAML file:
//!
//! ```yaml
//! database:
//!   db_config:
//!     sqlite:
//!       url: "sqlite:///var/lib/metalock/meta.db?mode=rwc"
//! lock:
//!   write_retry_interval_ms: 1
//!   read_retry_interval_ms: 10
//! ```
//!
//! Every field of `lock` may be omitted.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::meta::file_lock::FileLockType;
use crate::meta::store::MetaError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub lock: LockConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub db_config: DatabaseType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Sqlite { url: String },
    Postgres { url: String },
    Memory {},
}

impl DatabaseConfig {
    pub fn db_type_str(&self) -> &'static str {
        match self.db_config {
            DatabaseType::Sqlite { .. } => "sqlite",
            DatabaseType::Postgres { .. } => "postgres",
            DatabaseType::Memory {} => "memory",
        }
    }
}

/// Retry policy of the lock manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Poll interval of a blocked write request.
    pub write_retry_interval_ms: u64,
    /// Poll interval of a blocked read request.
    pub read_retry_interval_ms: u64,
    /// How many times one attempt is rerun after a transient backend error.
    pub txn_max_retries: u32,
    pub txn_retry_base_ms: u64,
    pub txn_retry_max_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            write_retry_interval_ms: 1,
            read_retry_interval_ms: 10,
            txn_max_retries: 50,
            txn_retry_base_ms: 2,
            txn_retry_max_ms: 200,
        }
    }
}

impl LockConfig {
    /// Sleep between two attempts of a blocked request.
    ///
    /// Writers poll faster than readers, which favours write latency without
    /// giving writers strict priority.
    pub fn retry_interval(&self, lock_type: FileLockType) -> Duration {
        match lock_type {
            FileLockType::Write => Duration::from_millis(self.write_retry_interval_ms),
            _ => Duration::from_millis(self.read_retry_interval_ms),
        }
    }

    /// Backoff before rerunning a transaction for the `attempt`-th time (1-based).
    pub fn txn_backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .txn_retry_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.txn_retry_max_ms);
        Duration::from_millis(ms)
    }
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Self, MetaError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MetaError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, MetaError> {
        serde_yaml::from_str(content).map_err(|e| MetaError::Config(e.to_string()))
    }

    /// Config for a store URL with default lock settings.
    ///
    /// Accepts `sqlite:...`, `postgres://...`/`postgresql://...` and `memory://`.
    pub fn from_url(url: &str) -> Result<Self, MetaError> {
        let db_config = if url.starts_with("sqlite:") {
            DatabaseType::Sqlite {
                url: url.to_string(),
            }
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            DatabaseType::Postgres {
                url: url.to_string(),
            }
        } else if url.starts_with("memory:") {
            DatabaseType::Memory {}
        } else {
            return Err(MetaError::Config(format!("unsupported meta url `{url}`")));
        };
        Ok(Self {
            database: DatabaseConfig { db_config },
            lock: LockConfig::default(),
        })
    }
}
