//! Storage seam of the lock manager.
//!
//! A backend exposes short transactions ([`MetaTxn`]) with "for update"
//! reads that serialize concurrent attempts on the same inode, plus a few
//! non-locking reads. Nothing here keeps lock state in process memory: the
//! persisted rows are the lock table shared by every mount.

use async_trait::async_trait;
use thiserror::Error;

use crate::meta::file_lock::{FlockType, LockHolder};

#[derive(Error, Debug)]
pub enum MetaError {
    #[error("inode {0} not found")]
    NotFound(i64),

    #[error("lock on inode {inode} is held by another owner")]
    WouldBlock { inode: i64 },

    #[error("interrupted while waiting for lock")]
    Interrupted,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("corrupted lock records ({len} bytes)")]
    CorruptedRecords { len: usize },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl MetaError {
    /// errno reported to the filesystem layer.
    pub fn errno(&self) -> libc::c_int {
        match self {
            MetaError::NotFound(_) => libc::ENOENT,
            MetaError::WouldBlock { .. } => libc::EAGAIN,
            MetaError::Interrupted => libc::EINTR,
            MetaError::InvalidArgument(_) | MetaError::Config(_) => libc::EINVAL,
            MetaError::InvariantViolation(_)
            | MetaError::CorruptedRecords { .. }
            | MetaError::Database(_) => libc::EIO,
        }
    }

    /// Transient backend failure: the whole transaction may simply be rerun.
    ///
    /// SQLite reports numeric result codes, every other backend a SQLSTATE.
    pub fn is_retryable(&self) -> bool {
        let MetaError::Database(sqlx::Error::Database(db)) = self else {
            return false;
        };
        let Some(code) = db.code() else {
            return false;
        };
        if db.try_downcast_ref::<sqlx::sqlite::SqliteError>().is_some() {
            sqlite_code_is_transient(&code)
        } else {
            sqlstate_is_transient(&code)
        }
    }
}

// SQLITE_BUSY / SQLITE_LOCKED and their extended codes
fn sqlite_code_is_transient(code: &str) -> bool {
    code.parse::<i32>()
        .map(|c| matches!(c & 0xff, 5 | 6))
        .unwrap_or(false)
}

// serialization_failure, deadlock_detected
fn sqlstate_is_transient(code: &str) -> bool {
    matches!(code, "40001" | "40P01")
}

impl From<MetaError> for libc::c_int {
    fn from(e: MetaError) -> Self {
        e.errno()
    }
}

/// One whole-file lock row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlockRow {
    pub inode: i64,
    pub holder: LockHolder,
    pub lock_type: FlockType,
}

/// One record-lock row: every range a holder owns on an inode, encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlockRow {
    pub inode: i64,
    pub holder: LockHolder,
    pub records: Vec<u8>,
}

/// A single open transaction. Dropping it without `commit` discards its writes.
///
/// Methods returning `u64` report the number of rows affected.
#[async_trait]
pub trait MetaTxn: Send {
    /// Checks the inode row and locks it until the transaction ends.
    async fn node_exists_for_update(&mut self, inode: i64) -> Result<bool, MetaError>;

    async fn find_flocks_for_update(&mut self, inode: i64) -> Result<Vec<FlockRow>, MetaError>;

    async fn insert_flock(&mut self, row: &FlockRow) -> Result<u64, MetaError>;

    async fn update_flock_type(
        &mut self,
        inode: i64,
        holder: LockHolder,
        lock_type: FlockType,
    ) -> Result<u64, MetaError>;

    async fn delete_flock(&mut self, inode: i64, holder: LockHolder) -> Result<u64, MetaError>;

    async fn get_plock_for_update(
        &mut self,
        inode: i64,
        holder: LockHolder,
    ) -> Result<Option<PlockRow>, MetaError>;

    async fn find_plocks_for_update(&mut self, inode: i64) -> Result<Vec<PlockRow>, MetaError>;

    async fn insert_plock(&mut self, row: &PlockRow) -> Result<u64, MetaError>;

    async fn update_plock_records(
        &mut self,
        inode: i64,
        holder: LockHolder,
        records: &[u8],
    ) -> Result<u64, MetaError>;

    async fn delete_plock(&mut self, inode: i64, holder: LockHolder) -> Result<u64, MetaError>;

    async fn commit(self: Box<Self>) -> Result<(), MetaError>;

    async fn rollback(self: Box<Self>) -> Result<(), MetaError>;
}

/// A shared transactional metadata backend.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn MetaTxn>, MetaError>;

    /// Non-locking read of every record-lock row on `inode`.
    async fn scan_plocks(&self, inode: i64) -> Result<Vec<PlockRow>, MetaError>;

    /// Non-locking read of every whole-file lock row on `inode`.
    async fn scan_flocks(&self, inode: i64) -> Result<Vec<FlockRow>, MetaError>;

    /// Register an inode so it can be locked. Idempotent.
    async fn create_node(&self, inode: i64) -> Result<(), MetaError>;

    /// Forget an inode. Lock rows are left to session cleanup.
    async fn remove_node(&self, inode: i64) -> Result<(), MetaError>;

    /// Drop every lock row of a session; returns the number of rows removed.
    async fn clean_session_locks(&self, sid: u64) -> Result<u64, MetaError>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;
    use std::time::Duration;

    use sqlx::Connection;
    use sqlx::error::{DatabaseError, ErrorKind};
    use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};

    /// Backend error carrying a SQLSTATE, as raised by a server database.
    #[derive(Debug)]
    pub(crate) struct SqlStateError(pub(crate) &'static str);

    impl fmt::Display for SqlStateError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "sqlstate {}", self.0)
        }
    }

    impl StdError for SqlStateError {}

    impl DatabaseError for SqlStateError {
        fn message(&self) -> &str {
            "backend error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed(self.0))
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::Other
        }
    }

    pub(crate) fn sqlstate_error(code: &'static str) -> MetaError {
        MetaError::Database(sqlx::Error::Database(Box::new(SqlStateError(code))))
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(MetaError::NotFound(1).errno(), libc::ENOENT);
        assert_eq!(MetaError::WouldBlock { inode: 1 }.errno(), libc::EAGAIN);
        assert_eq!(MetaError::Interrupted.errno(), libc::EINTR);
        assert_eq!(MetaError::InvalidArgument("x".into()).errno(), libc::EINVAL);
        assert_eq!(MetaError::InvariantViolation("x".into()).errno(), libc::EIO);
        let code: libc::c_int = MetaError::Database(sqlx::Error::RowNotFound).into();
        assert_eq!(code, libc::EIO);
    }

    #[test]
    fn test_lock_errors_are_not_retryable() {
        assert!(!MetaError::WouldBlock { inode: 1 }.is_retryable());
        assert!(!MetaError::Database(sqlx::Error::PoolTimedOut).is_retryable());
    }

    #[test]
    fn test_sqlstate_retry_classification() {
        assert!(sqlstate_error("40001").is_retryable());
        assert!(sqlstate_error("40P01").is_retryable());
        // numeric SQLSTATEs whose low byte looks like SQLITE_BUSY/LOCKED
        assert!(!sqlstate_error("42501").is_retryable());
        assert!(!sqlstate_error("22022").is_retryable());
        assert!(!sqlstate_error("23505").is_retryable());
        assert!(!sqlstate_error("5").is_retryable());
    }

    #[test]
    fn test_sqlite_code_classification() {
        // BUSY, LOCKED, BUSY_SNAPSHOT, LOCKED_SHAREDCACHE
        for code in ["5", "6", "517", "262"] {
            assert!(sqlite_code_is_transient(code), "{code}");
        }
        // CONSTRAINT_PRIMARYKEY, READONLY, not a number
        for code in ["1555", "8", "40001"] {
            assert!(!sqlite_code_is_transient(code), "{code}");
        }
    }

    #[tokio::test]
    async fn test_sqlite_busy_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let opts = SqliteConnectOptions::new()
            .filename(dir.path().join("busy.db"))
            .create_if_missing(true)
            .busy_timeout(Duration::ZERO);
        let mut first = SqliteConnection::connect_with(&opts).await.unwrap();
        let mut second = SqliteConnection::connect_with(&opts).await.unwrap();

        sqlx::query("CREATE TABLE t (x INTEGER)")
            .execute(&mut first)
            .await
            .unwrap();
        sqlx::query("BEGIN IMMEDIATE").execute(&mut first).await.unwrap();
        let err = sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut second)
            .await
            .unwrap_err();
        assert!(MetaError::from(err).is_retryable());

        let err = sqlx::query("INSERT INTO missing VALUES (1)")
            .execute(&mut first)
            .await
            .unwrap_err();
        assert!(!MetaError::from(err).is_retryable());
    }
}
