//! Distributed `flock(2)` / `fcntl(2)` locks on a shared metadata store.
//!
//! The manager keeps no lock table of its own. Each attempt is one store
//! transaction that locks the inode row, reads every lock row of the inode,
//! decides, and writes. A blocked request is a polling loop around such
//! attempts; the sleep between two attempts is the only cancellation point.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::meta::backoff::run_in_txn;
use crate::meta::config::LockConfig;
use crate::meta::file_lock::codec::{decode_records, encode_records};
use crate::meta::file_lock::conflict::{find_conflict, flock_conflicts};
use crate::meta::file_lock::range::update_locks;
use crate::meta::file_lock::{
    FileLockInfo, FileLockQuery, FileLockRange, FileLockType, FlockInfo, FlockType, LockHolder,
    PlockInfo, PlockRecord,
};
use crate::meta::store::{FlockRow, MetaError, MetaStore, MetaTxn, PlockRow};

/// Lock manager of one mount session.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn MetaStore>,
    sid: u64,
    config: LockConfig,
}

impl LockManager {
    pub fn new(store: Arc<dyn MetaStore>, sid: u64, config: LockConfig) -> Self {
        Self { store, sid, config }
    }

    pub fn sid(&self) -> u64 {
        self.sid
    }

    /// Whole-file lock (`flock(2)`).
    ///
    /// Unlock always succeeds. With `block`, a conflicting request polls until
    /// granted or until `ctx` is cancelled (`Interrupted`); without it, a
    /// conflict is `WouldBlock`.
    #[tracing::instrument(level = "debug", skip(self, ctx), fields(sid = self.sid))]
    pub async fn flock(
        &self,
        ctx: &CancellationToken,
        inode: i64,
        owner: u64,
        lock_type: FileLockType,
        block: bool,
    ) -> Result<(), MetaError> {
        let holder = LockHolder::new(self.sid, owner);
        let ftype = match FlockType::try_from(lock_type) {
            Ok(t) => t,
            Err(_) => {
                return run_in_txn(self.store.as_ref(), &self.config, move |tx| {
                    async move { tx.delete_flock(inode, holder).await.map(|_| ()) }.boxed()
                })
                .await;
            }
        };

        self.wait_for(ctx, inode, lock_type, block, move || {
            run_in_txn(self.store.as_ref(), &self.config, move |tx| {
                try_flock(tx, inode, holder, ftype).boxed()
            })
        })
        .await
    }

    /// Report the first record lock of another holder that would block `query`.
    ///
    /// Read only: never blocks, never writes. Locks of the caller's own
    /// `(sid, owner)` are ignored; locks of other owners in the same session
    /// are not. The pid is only reported for holders of this session.
    pub async fn getlk(&self, inode: i64, query: &FileLockQuery) -> Result<FileLockInfo, MetaError> {
        if query.lock_type == FileLockType::UnLock {
            return Ok(FileLockInfo::unlocked());
        }
        if !query.range.is_valid() {
            return Err(invalid_range(&query.range));
        }

        let me = LockHolder::new(self.sid, query.owner);
        let rows = self.store.scan_plocks(inode).await?;
        for row in rows.iter().filter(|r| r.holder != me) {
            let records = decode_records(&row.records)?;
            if let Some(rec) = find_conflict(query.lock_type, &query.range, &records) {
                return Ok(FileLockInfo {
                    lock_type: rec.lock_type,
                    range: rec.range(),
                    pid: if row.holder.sid == self.sid { rec.pid } else { 0 },
                });
            }
        }
        Ok(FileLockInfo::unlocked())
    }

    /// Byte-range lock (`fcntl(F_SETLK/F_SETLKW)`).
    ///
    /// The caller's own records over `range` are replaced, split or merged;
    /// they never conflict with the request.
    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "debug", skip(self, ctx), fields(sid = self.sid))]
    pub async fn setlk(
        &self,
        ctx: &CancellationToken,
        inode: i64,
        owner: u64,
        block: bool,
        lock_type: FileLockType,
        range: FileLockRange,
        pid: u32,
    ) -> Result<(), MetaError> {
        if !range.is_valid() {
            return Err(invalid_range(&range));
        }
        let holder = LockHolder::new(self.sid, owner);
        let request = PlockRecord::new(lock_type, pid, range.start, range.end);

        if lock_type == FileLockType::UnLock {
            return run_in_txn(self.store.as_ref(), &self.config, move |tx| {
                try_unlock_range(tx, inode, holder, request).boxed()
            })
            .await;
        }

        self.wait_for(ctx, inode, lock_type, block, move || {
            run_in_txn(self.store.as_ref(), &self.config, move |tx| {
                try_setlk(tx, inode, holder, request).boxed()
            })
        })
        .await
    }

    /// Drop every lock `owner` of this session holds on `inode`.
    pub async fn release_owner(&self, inode: i64, owner: u64) -> Result<(), MetaError> {
        let holder = LockHolder::new(self.sid, owner);
        run_in_txn(self.store.as_ref(), &self.config, move |tx| {
            async move {
                tx.delete_flock(inode, holder).await?;
                tx.delete_plock(inode, holder).await?;
                Ok(())
            }
            .boxed()
        })
        .await
    }

    /// Every whole-file and record lock on `inode`, from all sessions.
    pub async fn list_locks(&self, inode: i64) -> Result<(Vec<FlockInfo>, Vec<PlockInfo>), MetaError> {
        let flocks = self
            .store
            .scan_flocks(inode)
            .await?
            .into_iter()
            .map(|row| FlockInfo {
                holder: row.holder,
                lock_type: row.lock_type,
            })
            .collect();
        let plocks = self
            .store
            .scan_plocks(inode)
            .await?
            .into_iter()
            .map(|row| {
                Ok(PlockInfo {
                    holder: row.holder,
                    records: decode_records(&row.records)?,
                })
            })
            .collect::<Result<Vec<_>, MetaError>>()?;
        Ok((flocks, plocks))
    }

    /// Run `attempt` until it stops reporting a conflict.
    ///
    /// Only `WouldBlock` with `block` set is retried; any other outcome,
    /// store errors included, ends the operation.
    async fn wait_for<F, Fut>(
        &self,
        ctx: &CancellationToken,
        inode: i64,
        lock_type: FileLockType,
        block: bool,
        mut attempt: F,
    ) -> Result<(), MetaError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), MetaError>>,
    {
        let interval = self.config.retry_interval(lock_type);
        let mut retries = 0u64;
        loop {
            match attempt().await {
                Err(MetaError::WouldBlock { .. }) if block => {
                    retries += 1;
                    debug!(inode, ?lock_type, retries, "lock conflict, waiting");
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(MetaError::Interrupted),
                        _ = tokio::time::sleep(interval) => {}
                    }
                    if ctx.is_cancelled() {
                        return Err(MetaError::Interrupted);
                    }
                }
                other => return other,
            }
        }
    }
}

fn invalid_range(range: &FileLockRange) -> MetaError {
    MetaError::InvalidArgument(format!(
        "lock range start {} is past end {}",
        range.start, range.end
    ))
}

fn check_affected(n: u64, what: &str, inode: i64) -> Result<(), MetaError> {
    if n == 0 {
        warn!(inode, "{what} affected no rows");
        return Err(MetaError::InvariantViolation(format!(
            "{what} on inode {inode} affected no rows"
        )));
    }
    Ok(())
}

async fn lock_node(tx: &mut dyn MetaTxn, inode: i64) -> Result<(), MetaError> {
    if tx.node_exists_for_update(inode).await? {
        Ok(())
    } else {
        Err(MetaError::NotFound(inode))
    }
}

async fn try_flock(
    tx: &mut dyn MetaTxn,
    inode: i64,
    holder: LockHolder,
    lock_type: FlockType,
) -> Result<(), MetaError> {
    lock_node(tx, inode).await?;

    let rows = tx.find_flocks_for_update(inode).await?;
    let mut mine = None;
    let mut others = Vec::with_capacity(rows.len());
    for row in rows {
        if row.holder == holder {
            mine = Some(row.lock_type);
        } else {
            others.push(row.lock_type);
        }
    }
    if flock_conflicts(lock_type, others) {
        return Err(MetaError::WouldBlock { inode });
    }

    let n = match mine {
        Some(held) if held == lock_type => return Ok(()),
        Some(_) => tx.update_flock_type(inode, holder, lock_type).await?,
        None => {
            tx.insert_flock(&FlockRow {
                inode,
                holder,
                lock_type,
            })
            .await?
        }
    };
    check_affected(n, "flock insert/update", inode)
}

async fn try_unlock_range(
    tx: &mut dyn MetaTxn,
    inode: i64,
    holder: LockHolder,
    request: PlockRecord,
) -> Result<(), MetaError> {
    lock_node(tx, inode).await?;

    let Some(row) = tx.get_plock_for_update(inode, holder).await? else {
        return Ok(());
    };
    let current = decode_records(&row.records)?;
    let updated = update_locks(current.clone(), request);
    if updated.is_empty() {
        tx.delete_plock(inode, holder).await?;
    } else if updated != current {
        let n = tx
            .update_plock_records(inode, holder, &encode_records(&updated)?)
            .await?;
        check_affected(n, "plock update", inode)?;
    }
    Ok(())
}

async fn try_setlk(
    tx: &mut dyn MetaTxn,
    inode: i64,
    holder: LockHolder,
    request: PlockRecord,
) -> Result<(), MetaError> {
    lock_node(tx, inode).await?;

    let rows = tx.find_plocks_for_update(inode).await?;
    let range = request.range();
    let mut mine = None;
    for row in &rows {
        let records = decode_records(&row.records)?;
        if row.holder == holder {
            mine = Some(records);
            continue;
        }
        if let Some(held) = find_conflict(request.lock_type, &range, &records) {
            debug!(inode, holder = %row.holder, start = held.start, end = held.end, "plock conflict");
            return Err(MetaError::WouldBlock { inode });
        }
    }

    let n = match mine {
        Some(current) => {
            let updated = update_locks(current.clone(), request);
            if updated == current {
                return Ok(());
            }
            tx.update_plock_records(inode, holder, &encode_records(&updated)?)
                .await?
        }
        None => {
            let records = encode_records(&update_locks(Vec::new(), request))?;
            tx.insert_plock(&PlockRow {
                inode,
                holder,
                records,
            })
            .await?
        }
    };
    check_affected(n, "plock insert/update", inode)
}
