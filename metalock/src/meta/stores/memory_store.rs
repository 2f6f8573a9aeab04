//! In-process metadata store for tests and single-node use.
//!
//! A transaction holds the store mutex from `begin` until commit/rollback,
//! so transactions are fully serialized. Writes go to a private copy of the
//! state that replaces the shared one on commit.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::meta::file_lock::{FlockType, LockHolder};
use crate::meta::store::{FlockRow, MetaError, MetaStore, MetaTxn, PlockRow};

type RowKey = (i64, LockHolder);

#[derive(Debug, Clone, Default)]
struct MemState {
    nodes: BTreeSet<i64>,
    flocks: BTreeMap<RowKey, FlockType>,
    plocks: BTreeMap<RowKey, Vec<u8>>,
}

impl MemState {
    fn flocks_of(&self, inode: i64) -> Vec<FlockRow> {
        self.flocks
            .iter()
            .filter(|((ino, _), _)| *ino == inode)
            .map(|(&(inode, holder), &lock_type)| FlockRow {
                inode,
                holder,
                lock_type,
            })
            .collect()
    }

    fn plocks_of(&self, inode: i64) -> Vec<PlockRow> {
        self.plocks
            .iter()
            .filter(|((ino, _), _)| *ino == inode)
            .map(|(&(inode, holder), records)| PlockRow {
                inode,
                holder,
                records: records.clone(),
            })
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct MemoryMetaStore {
    state: Arc<Mutex<MemState>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct MemoryTxn {
    guard: OwnedMutexGuard<MemState>,
    work: MemState,
}

#[async_trait]
impl MetaTxn for MemoryTxn {
    async fn node_exists_for_update(&mut self, inode: i64) -> Result<bool, MetaError> {
        Ok(self.work.nodes.contains(&inode))
    }

    async fn find_flocks_for_update(&mut self, inode: i64) -> Result<Vec<FlockRow>, MetaError> {
        Ok(self.work.flocks_of(inode))
    }

    async fn insert_flock(&mut self, row: &FlockRow) -> Result<u64, MetaError> {
        let key = (row.inode, row.holder);
        if self.work.flocks.contains_key(&key) {
            return Ok(0);
        }
        self.work.flocks.insert(key, row.lock_type);
        Ok(1)
    }

    async fn update_flock_type(
        &mut self,
        inode: i64,
        holder: LockHolder,
        lock_type: FlockType,
    ) -> Result<u64, MetaError> {
        match self.work.flocks.get_mut(&(inode, holder)) {
            Some(t) => {
                *t = lock_type;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete_flock(&mut self, inode: i64, holder: LockHolder) -> Result<u64, MetaError> {
        Ok(self.work.flocks.remove(&(inode, holder)).map_or(0, |_| 1))
    }

    async fn get_plock_for_update(
        &mut self,
        inode: i64,
        holder: LockHolder,
    ) -> Result<Option<PlockRow>, MetaError> {
        Ok(self
            .work
            .plocks
            .get(&(inode, holder))
            .map(|records| PlockRow {
                inode,
                holder,
                records: records.clone(),
            }))
    }

    async fn find_plocks_for_update(&mut self, inode: i64) -> Result<Vec<PlockRow>, MetaError> {
        Ok(self.work.plocks_of(inode))
    }

    async fn insert_plock(&mut self, row: &PlockRow) -> Result<u64, MetaError> {
        let key = (row.inode, row.holder);
        if self.work.plocks.contains_key(&key) {
            return Ok(0);
        }
        self.work.plocks.insert(key, row.records.clone());
        Ok(1)
    }

    async fn update_plock_records(
        &mut self,
        inode: i64,
        holder: LockHolder,
        records: &[u8],
    ) -> Result<u64, MetaError> {
        match self.work.plocks.get_mut(&(inode, holder)) {
            Some(r) => {
                *r = records.to_vec();
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete_plock(&mut self, inode: i64, holder: LockHolder) -> Result<u64, MetaError> {
        Ok(self.work.plocks.remove(&(inode, holder)).map_or(0, |_| 1))
    }

    async fn commit(self: Box<Self>) -> Result<(), MetaError> {
        let MemoryTxn { mut guard, work } = *self;
        *guard = work;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), MetaError> {
        Ok(())
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn begin(&self) -> Result<Box<dyn MetaTxn>, MetaError> {
        let guard = self.state.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTxn { guard, work }))
    }

    async fn scan_plocks(&self, inode: i64) -> Result<Vec<PlockRow>, MetaError> {
        Ok(self.state.lock().await.plocks_of(inode))
    }

    async fn scan_flocks(&self, inode: i64) -> Result<Vec<FlockRow>, MetaError> {
        Ok(self.state.lock().await.flocks_of(inode))
    }

    async fn create_node(&self, inode: i64) -> Result<(), MetaError> {
        self.state.lock().await.nodes.insert(inode);
        Ok(())
    }

    async fn remove_node(&self, inode: i64) -> Result<(), MetaError> {
        self.state.lock().await.nodes.remove(&inode);
        Ok(())
    }

    async fn clean_session_locks(&self, sid: u64) -> Result<u64, MetaError> {
        let mut state = self.state.lock().await;
        let before = state.flocks.len() + state.plocks.len();
        state.flocks.retain(|(_, holder), _| holder.sid != sid);
        state.plocks.retain(|(_, holder), _| holder.sid != sid);
        Ok((before - state.flocks.len() - state.plocks.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_uncommitted_writes_are_discarded() {
        let store = MemoryMetaStore::new();
        store.create_node(2).await.unwrap();
        let holder = LockHolder::new(1, 7);
        {
            let mut tx = store.begin().await.unwrap();
            let row = PlockRow {
                inode: 2,
                holder,
                records: vec![0; 24],
            };
            assert_eq!(tx.insert_plock(&row).await.unwrap(), 1);
            assert_eq!(tx.insert_plock(&row).await.unwrap(), 0);
            tx.rollback().await.unwrap();
        }
        assert!(store.scan_plocks(2).await.unwrap().is_empty());

        let mut tx = store.begin().await.unwrap();
        assert!(tx.node_exists_for_update(2).await.unwrap());
        assert!(!tx.node_exists_for_update(3).await.unwrap());
        assert_eq!(tx.update_plock_records(2, holder, &[]).await.unwrap(), 0);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_session_locks() {
        let store = MemoryMetaStore::new();
        let mut tx = store.begin().await.unwrap();
        for (sid, owner) in [(1, 1), (1, 2), (2, 1)] {
            let holder = LockHolder::new(sid, owner);
            tx.insert_flock(&FlockRow {
                inode: 5,
                holder,
                lock_type: FlockType::Read,
            })
            .await
            .unwrap();
            tx.insert_plock(&PlockRow {
                inode: 5,
                holder,
                records: vec![],
            })
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();

        assert_eq!(store.clean_session_locks(1).await.unwrap(), 4);
        let left = store.scan_flocks(5).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].holder.sid, 2);
    }
}
