//! In-process canonical and mirror stores
//!
//! Used by development setups and tests. Both support failure injection so sync retry and
//! sweep aggregation can be exercised without a real database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;
use uuid::Uuid;

use super::{CanonicalRecord, CanonicalStore, MirrorStore};
use crate::error::ServiceError;

/// Consume one unit of an injected-failure budget.
fn take_failure(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Default)]
pub struct MemoryCanonicalStore {
    records: RwLock<BTreeMap<String, CanonicalRecord>>,
    read_failures: AtomicU32,
}

impl MemoryCanonicalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` reads fail with a transient database error.
    pub fn fail_next_reads(&self, count: u32) {
        self.read_failures.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_read(&self) -> Result<(), ServiceError> {
        if take_failure(&self.read_failures) {
            return Err(ServiceError::DatabaseError("canonical store read failed".to_string()));
        }
        Ok(())
    }

    fn poisoned() -> ServiceError {
        ServiceError::DatabaseError("canonical store lock poisoned".to_string())
    }
}

#[async_trait]
impl CanonicalStore for MemoryCanonicalStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<CanonicalRecord>, ServiceError> {
        self.check_read()?;
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        Ok(records.get(id).cloned())
    }

    async fn find(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, ServiceError> {
        self.check_read()?;
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        let lower = match after {
            Some(after) => Bound::Excluded(after.to_string()),
            None => Bound::Unbounded,
        };
        Ok(records
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn upsert(&self, record: CanonicalRecord) -> Result<CanonicalRecord, ServiceError> {
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool, ServiceError> {
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        Ok(records.remove(id).is_some())
    }
}

/// One mirrored row, keyed by `(entity_type, business_key)`. A canonical record owns at most
/// one row; a changed business key moves it.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorRow {
    pub mirror_id: String,
    pub canonical_id: String,
    pub payload: Value,
    pub source_updated_at: DateTime<Utc>,
}

pub struct MemoryMirrorStore {
    name: String,
    rows: RwLock<HashMap<(String, String), MirrorRow>>,
    rejected: RwLock<HashSet<String>>,
    transient_failures: AtomicU32,
    upsert_calls: AtomicU64,
}

impl MemoryMirrorStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: RwLock::new(HashMap::new()),
            rejected: RwLock::new(HashSet::new()),
            transient_failures: AtomicU32::new(0),
            upsert_calls: AtomicU64::new(0),
        }
    }

    /// Permanently reject upserts of `canonical_id` with a non-transient error.
    pub fn reject(&self, canonical_id: &str) {
        if let Ok(mut rejected) = self.rejected.write() {
            rejected.insert(canonical_id.to_string());
        }
    }

    /// Make the next `count` upserts fail with a transient error.
    pub fn fail_next_upserts(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    pub fn upsert_calls(&self) -> u64 {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn row(&self, entity_type: &str, business_key: &str) -> Option<MirrorRow> {
        self.rows
            .read()
            .ok()?
            .get(&(entity_type.to_string(), business_key.to_string()))
            .cloned()
    }

    fn poisoned(&self) -> ServiceError {
        ServiceError::DatabaseError(format!("{}: lock poisoned", self.name))
    }
}

#[async_trait]
impl MirrorStore for MemoryMirrorStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upsert(&self, record: &CanonicalRecord) -> Result<String, ServiceError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);

        if take_failure(&self.transient_failures) {
            return Err(ServiceError::DatabaseError(format!("{}: connection reset", self.name)));
        }
        let rejected = self
            .rejected
            .read()
            .map_err(|_| self.poisoned())?
            .contains(&record.id);
        if rejected {
            return Err(ServiceError::ValidationError(format!(
                "{}: record {} rejected",
                self.name, record.id
            )));
        }

        let mut rows = self.rows.write().map_err(|_| self.poisoned())?;
        let moved_from = rows
            .iter()
            .find(|((row_type, business_key), row)| {
                row_type == &record.entity_type
                    && row.canonical_id == record.id
                    && business_key != &record.business_key
            })
            .map(|(key, _)| key.clone());
        let released = moved_from.and_then(|key| rows.remove(&key));

        let row = rows
            .entry((record.entity_type.clone(), record.business_key.clone()))
            .or_insert_with(|| MirrorRow {
                mirror_id: released
                    .map(|row| row.mirror_id)
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                canonical_id: record.id.clone(),
                payload: Value::Null,
                source_updated_at: record.updated_at,
            });
        row.canonical_id = record.id.clone();
        row.payload = record.payload.clone();
        row.source_updated_at = record.updated_at;
        Ok(row.mirror_id.clone())
    }

    async fn remove(&self, entity_type: &str, canonical_id: &str) -> Result<bool, ServiceError> {
        let mut rows = self.rows.write().map_err(|_| self.poisoned())?;
        let before = rows.len();
        rows.retain(|(row_type, _), row| {
            !(row_type == entity_type && row.canonical_id == canonical_id)
        });
        Ok(rows.len() < before)
    }
}
