//! SQL metadata store (SQLite and PostgreSQL) on top of `sqlx`.
//!
//! PostgreSQL serializes lock attempts with `SELECT ... FOR UPDATE`.
//! SQLite has no row locks; the pool is kept at a single connection so
//! transactions of one process run one at a time, and writers from other
//! processes surface as `SQLITE_BUSY`, which the transaction runner retries.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool, Row, Transaction};
use tracing::info;

use crate::meta::config::{Config, DatabaseType};
use crate::meta::file_lock::{FlockType, LockHolder};
use crate::meta::store::{FlockRow, MetaError, MetaStore, MetaTxn, PlockRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    fn for_update(self) -> &'static str {
        match self {
            Dialect::Sqlite => "",
            Dialect::Postgres => " FOR UPDATE",
        }
    }

    fn blob_type(self) -> &'static str {
        match self {
            Dialect::Sqlite => "BLOB",
            Dialect::Postgres => "BYTEA",
        }
    }
}

/// Database-based metadata store
pub struct DatabaseMetaStore {
    pool: AnyPool,
    dialect: Dialect,
}

impl DatabaseMetaStore {
    pub async fn from_config(config: &Config) -> Result<Self, MetaError> {
        info!("Database type: {}", config.database.db_type_str());
        match &config.database.db_config {
            DatabaseType::Sqlite { url } => Self::connect(url, Dialect::Sqlite).await,
            DatabaseType::Postgres { url } => Self::connect(url, Dialect::Postgres).await,
            DatabaseType::Memory {} => Err(MetaError::Config(
                "memory backend not supported by DatabaseMetaStore. Use MemoryMetaStore instead."
                    .to_string(),
            )),
        }
    }

    pub async fn connect(url: &str, dialect: Dialect) -> Result<Self, MetaError> {
        sqlx::any::install_default_drivers();

        let opts = match dialect {
            // one connection: keeps `sqlite::memory:` alive and serializes local writers
            Dialect::Sqlite => AnyPoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None),
            Dialect::Postgres => AnyPoolOptions::new().max_connections(16),
        };
        let pool = opts
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await?;

        let store = Self { pool, dialect };
        store.init_schema().await?;
        info!("DatabaseMetaStore initialized successfully");
        Ok(store)
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Create lock tables. The layout is shared by every client of the
    /// database and must not change incompatibly.
    async fn init_schema(&self) -> Result<(), MetaError> {
        let stmts = [
            "CREATE TABLE IF NOT EXISTS meta_node (inode BIGINT NOT NULL PRIMARY KEY)".to_string(),
            "CREATE TABLE IF NOT EXISTS meta_flock (\
                inode BIGINT NOT NULL, \
                sid BIGINT NOT NULL, \
                owner BIGINT NOT NULL, \
                ltype TEXT NOT NULL, \
                PRIMARY KEY (inode, sid, owner))"
                .to_string(),
            format!(
                "CREATE TABLE IF NOT EXISTS meta_plock (\
                    inode BIGINT NOT NULL, \
                    sid BIGINT NOT NULL, \
                    owner BIGINT NOT NULL, \
                    records {} NOT NULL, \
                    PRIMARY KEY (inode, sid, owner))",
                self.dialect.blob_type()
            ),
            "CREATE INDEX IF NOT EXISTS idx_meta_flock_sid ON meta_flock (sid)".to_string(),
            "CREATE INDEX IF NOT EXISTS idx_meta_plock_sid ON meta_plock (sid)".to_string(),
        ];
        for (i, stmt) in stmts.iter().enumerate() {
            sqlx::query(stmt).execute(&self.pool).await?;
            info!("Statement {} executed successfully", i + 1);
        }
        info!("Database schema initialized successfully");
        Ok(())
    }
}

fn flock_from_row(row: &AnyRow) -> Result<FlockRow, MetaError> {
    let ltype: String = row.try_get("ltype")?;
    let lock_type = FlockType::parse(&ltype)
        .ok_or_else(|| MetaError::InvariantViolation(format!("unknown flock type `{ltype}`")))?;
    Ok(FlockRow {
        inode: row.try_get("inode")?,
        holder: holder_from_row(row)?,
        lock_type,
    })
}

fn plock_from_row(row: &AnyRow) -> Result<PlockRow, MetaError> {
    Ok(PlockRow {
        inode: row.try_get("inode")?,
        holder: holder_from_row(row)?,
        records: row.try_get("records")?,
    })
}

// sid/owner are u64 stored bit-for-bit in BIGINT columns
fn holder_from_row(row: &AnyRow) -> Result<LockHolder, MetaError> {
    let sid: i64 = row.try_get("sid")?;
    let owner: i64 = row.try_get("owner")?;
    Ok(LockHolder::new(sid as u64, owner as u64))
}

pub struct DatabaseTxn {
    tx: Transaction<'static, Any>,
    dialect: Dialect,
}

#[async_trait]
impl MetaTxn for DatabaseTxn {
    async fn node_exists_for_update(&mut self, inode: i64) -> Result<bool, MetaError> {
        let sql = format!(
            "SELECT inode FROM meta_node WHERE inode = $1{}",
            self.dialect.for_update()
        );
        let row = sqlx::query(&sql)
            .bind(inode)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.is_some())
    }

    async fn find_flocks_for_update(&mut self, inode: i64) -> Result<Vec<FlockRow>, MetaError> {
        let sql = format!(
            "SELECT inode, sid, owner, ltype FROM meta_flock WHERE inode = $1{}",
            self.dialect.for_update()
        );
        let rows = sqlx::query(&sql)
            .bind(inode)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(flock_from_row).collect()
    }

    async fn insert_flock(&mut self, row: &FlockRow) -> Result<u64, MetaError> {
        let res = sqlx::query(
            "INSERT INTO meta_flock (inode, sid, owner, ltype) VALUES ($1, $2, $3, $4)",
        )
        .bind(row.inode)
        .bind(row.holder.sid as i64)
        .bind(row.holder.owner as i64)
        .bind(row.lock_type.as_str())
        .execute(&mut *self.tx)
        .await?;
        Ok(res.rows_affected())
    }

    async fn update_flock_type(
        &mut self,
        inode: i64,
        holder: LockHolder,
        lock_type: FlockType,
    ) -> Result<u64, MetaError> {
        let res = sqlx::query(
            "UPDATE meta_flock SET ltype = $1 WHERE inode = $2 AND sid = $3 AND owner = $4",
        )
        .bind(lock_type.as_str())
        .bind(inode)
        .bind(holder.sid as i64)
        .bind(holder.owner as i64)
        .execute(&mut *self.tx)
        .await?;
        Ok(res.rows_affected())
    }

    async fn delete_flock(&mut self, inode: i64, holder: LockHolder) -> Result<u64, MetaError> {
        let res = sqlx::query("DELETE FROM meta_flock WHERE inode = $1 AND sid = $2 AND owner = $3")
            .bind(inode)
            .bind(holder.sid as i64)
            .bind(holder.owner as i64)
            .execute(&mut *self.tx)
            .await?;
        Ok(res.rows_affected())
    }

    async fn get_plock_for_update(
        &mut self,
        inode: i64,
        holder: LockHolder,
    ) -> Result<Option<PlockRow>, MetaError> {
        let sql = format!(
            "SELECT inode, sid, owner, records FROM meta_plock \
             WHERE inode = $1 AND sid = $2 AND owner = $3{}",
            self.dialect.for_update()
        );
        let row = sqlx::query(&sql)
            .bind(inode)
            .bind(holder.sid as i64)
            .bind(holder.owner as i64)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(plock_from_row).transpose()
    }

    async fn find_plocks_for_update(&mut self, inode: i64) -> Result<Vec<PlockRow>, MetaError> {
        let sql = format!(
            "SELECT inode, sid, owner, records FROM meta_plock WHERE inode = $1{}",
            self.dialect.for_update()
        );
        let rows = sqlx::query(&sql)
            .bind(inode)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(plock_from_row).collect()
    }

    async fn insert_plock(&mut self, row: &PlockRow) -> Result<u64, MetaError> {
        let res = sqlx::query(
            "INSERT INTO meta_plock (inode, sid, owner, records) VALUES ($1, $2, $3, $4)",
        )
        .bind(row.inode)
        .bind(row.holder.sid as i64)
        .bind(row.holder.owner as i64)
        .bind(row.records.clone())
        .execute(&mut *self.tx)
        .await?;
        Ok(res.rows_affected())
    }

    async fn update_plock_records(
        &mut self,
        inode: i64,
        holder: LockHolder,
        records: &[u8],
    ) -> Result<u64, MetaError> {
        let res = sqlx::query(
            "UPDATE meta_plock SET records = $1 WHERE inode = $2 AND sid = $3 AND owner = $4",
        )
        .bind(records.to_vec())
        .bind(inode)
        .bind(holder.sid as i64)
        .bind(holder.owner as i64)
        .execute(&mut *self.tx)
        .await?;
        Ok(res.rows_affected())
    }

    async fn delete_plock(&mut self, inode: i64, holder: LockHolder) -> Result<u64, MetaError> {
        let res = sqlx::query("DELETE FROM meta_plock WHERE inode = $1 AND sid = $2 AND owner = $3")
            .bind(inode)
            .bind(holder.sid as i64)
            .bind(holder.owner as i64)
            .execute(&mut *self.tx)
            .await?;
        Ok(res.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), MetaError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), MetaError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl MetaStore for DatabaseMetaStore {
    async fn begin(&self) -> Result<Box<dyn MetaTxn>, MetaError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(DatabaseTxn {
            tx,
            dialect: self.dialect,
        }))
    }

    async fn scan_plocks(&self, inode: i64) -> Result<Vec<PlockRow>, MetaError> {
        let rows = sqlx::query("SELECT inode, sid, owner, records FROM meta_plock WHERE inode = $1")
            .bind(inode)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(plock_from_row).collect()
    }

    async fn scan_flocks(&self, inode: i64) -> Result<Vec<FlockRow>, MetaError> {
        let rows = sqlx::query("SELECT inode, sid, owner, ltype FROM meta_flock WHERE inode = $1")
            .bind(inode)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(flock_from_row).collect()
    }

    async fn create_node(&self, inode: i64) -> Result<(), MetaError> {
        sqlx::query("INSERT INTO meta_node (inode) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(inode)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_node(&self, inode: i64) -> Result<(), MetaError> {
        sqlx::query("DELETE FROM meta_node WHERE inode = $1")
            .bind(inode)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clean_session_locks(&self, sid: u64) -> Result<u64, MetaError> {
        let mut tx = self.pool.begin().await?;
        let flocks = sqlx::query("DELETE FROM meta_flock WHERE sid = $1")
            .bind(sid as i64)
            .execute(&mut *tx)
            .await?;
        let plocks = sqlx::query("DELETE FROM meta_plock WHERE sid = $1")
            .bind(sid as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(flocks.rows_affected() + plocks.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn new_test_store() -> DatabaseMetaStore {
        DatabaseMetaStore::connect("sqlite::memory:", Dialect::Sqlite)
            .await
            .expect("Failed to create test database store")
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let store = new_test_store().await;
        store.init_schema().await.unwrap();
        assert_eq!(store.dialect(), Dialect::Sqlite);
    }

    #[tokio::test]
    async fn test_flock_rows() {
        let store = new_test_store().await;
        store.create_node(10).await.unwrap();
        store.create_node(10).await.unwrap();
        let holder = LockHolder::new(u64::MAX, 1 << 63);

        let mut tx = store.begin().await.unwrap();
        assert!(tx.node_exists_for_update(10).await.unwrap());
        let row = FlockRow {
            inode: 10,
            holder,
            lock_type: FlockType::Read,
        };
        assert_eq!(tx.insert_flock(&row).await.unwrap(), 1);
        assert_eq!(
            tx.update_flock_type(10, holder, FlockType::Write).await.unwrap(),
            1
        );
        tx.commit().await.unwrap();

        let rows = store.scan_flocks(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].holder, holder);
        assert_eq!(rows[0].lock_type, FlockType::Write);

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.delete_flock(10, holder).await.unwrap(), 1);
        assert_eq!(tx.delete_flock(10, holder).await.unwrap(), 0);
        tx.commit().await.unwrap();
        assert!(store.scan_flocks(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plock_rows_and_rollback() {
        let store = new_test_store().await;
        let holder = LockHolder::new(3, 4);
        let row = PlockRow {
            inode: 11,
            holder,
            records: vec![1, 2, 3],
        };

        let mut tx = store.begin().await.unwrap();
        tx.insert_plock(&row).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(store.scan_plocks(11).await.unwrap().is_empty());

        let mut tx = store.begin().await.unwrap();
        tx.insert_plock(&row).await.unwrap();
        assert_eq!(
            tx.update_plock_records(11, holder, &[9, 9]).await.unwrap(),
            1
        );
        let got = tx.get_plock_for_update(11, holder).await.unwrap().unwrap();
        assert_eq!(got.records, vec![9, 9]);
        assert_eq!(tx.find_plocks_for_update(11).await.unwrap().len(), 1);
        tx.commit().await.unwrap();

        assert_eq!(store.clean_session_locks(3).await.unwrap(), 1);
        assert!(store.scan_plocks(11).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_removed_node_is_gone() {
        let store = new_test_store().await;
        store.create_node(12).await.unwrap();
        store.remove_node(12).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        assert!(!tx.node_exists_for_update(12).await.unwrap());
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_type_rejected() {
        let cfg = Config::from_url("memory://").unwrap();
        assert!(matches!(
            DatabaseMetaStore::from_config(&cfg).await,
            Err(MetaError::Config(_))
        ));
    }
}
