//! In-process transactional key-value store
//!
//! Writes are staged on the `MemoryTx` handle and applied atomically on commit. Commit and
//! rollback failures can be injected to exercise coordinator error paths.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;

use super::TransactionalStore;
use crate::error::ServiceError;

#[derive(Debug, Clone, PartialEq)]
enum StagedWrite {
    Put(String, Value),
    Delete(String),
}

/// Open transaction on a `MemoryTransactionalStore`.
#[derive(Debug, Default)]
pub struct MemoryTx {
    writes: Vec<StagedWrite>,
}

impl MemoryTx {
    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.writes.push(StagedWrite::Put(key.into(), value));
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.writes.push(StagedWrite::Delete(key.into()));
    }

    pub fn staged(&self) -> usize {
        self.writes.len()
    }
}

pub struct MemoryTransactionalStore {
    name: String,
    data: RwLock<BTreeMap<String, Value>>,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
}

impl MemoryTransactionalStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: RwLock::new(BTreeMap::new()),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            fail_commit: AtomicBool::new(false),
            fail_rollback: AtomicBool::new(false),
        }
    }

    /// Committed value for `key`
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.data.read().await.get(key).cloned()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, Value> {
        self.data.read().await.clone()
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> u64 {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn inject_commit_failure(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn inject_rollback_failure(&self, fail: bool) {
        self.fail_rollback.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransactionalStore for MemoryTransactionalStore {
    type Tx = MemoryTx;

    fn name(&self) -> &str {
        &self.name
    }

    async fn begin(&self) -> Result<MemoryTx, ServiceError> {
        Ok(MemoryTx::default())
    }

    async fn commit(&self, tx: MemoryTx) -> Result<(), ServiceError> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(ServiceError::DatabaseError(format!("{}: commit rejected", self.name)));
        }

        let mut data = self.data.write().await;
        for write in tx.writes {
            match write {
                StagedWrite::Put(key, value) => {
                    data.insert(key, value);
                }
                StagedWrite::Delete(key) => {
                    data.remove(&key);
                }
            }
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, tx: MemoryTx) -> Result<(), ServiceError> {
        drop(tx);
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.fail_rollback.load(Ordering::SeqCst) {
            return Err(ServiceError::DatabaseError(format!("{}: rollback rejected", self.name)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn commit_applies_puts_and_deletes_in_order() {
        let store = MemoryTransactionalStore::new("kv");
        let mut tx = store.begin().await.unwrap();
        tx.put("a", json!(1));
        tx.put("b", json!(2));
        tx.delete("a");
        assert_eq!(tx.staged(), 3);
        store.commit(tx).await.unwrap();

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("b"), Some(&json!(2)));
    }
}
