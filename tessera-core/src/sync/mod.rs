//! Propagation of canonical records into mirror stores
//!
//! The canonical store is the source of truth. Every write to it is followed, directly or
//! through the `SyncDispatcher` queue, by a `sync_entity` that upserts the record into each
//! mirror by business key and records the identity mapping between the canonical id and the
//! id the first mirror assigned. Periodic sweeps (`sync_all`) reconcile anything missed.

pub mod dispatcher;
pub mod mapping;
pub mod memory;
pub mod orchestrator;
pub mod search_index;
pub mod sql_mirror;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ServiceError;

pub use dispatcher::{spawn_periodic_sweep, DispatcherStats, SyncDispatcher};
pub use mapping::{IdentityMappingStore, MappingDirection, MappingLookup};
pub use memory::{MemoryCanonicalStore, MemoryMirrorStore, MirrorRow};
pub use orchestrator::{SweepOptions, SweepReport, SyncItemFailure, SyncOrchestrator, SyncOutcome};
pub use search_index::{HttpSearchIndex, SearchIndexConfig};
pub use sql_mirror::SqlMirrorStore;

/// Record exchanged between the canonical store and its mirrors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalRecord {
    pub id: String,
    pub entity_type: String,
    /// Natural key mirrors upsert on; stable across re-syncs.
    pub business_key: String,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalRecord {
    pub fn new(
        id: impl Into<String>,
        entity_type: impl Into<String>,
        business_key: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            business_key: business_key.into(),
            payload,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Upsert,
    Remove,
}

/// Unit of work for the sync queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTask {
    pub entity_type: String,
    pub canonical_id: String,
    pub action: SyncAction,
}

impl SyncTask {
    pub fn upsert(entity_type: impl Into<String>, canonical_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            canonical_id: canonical_id.into(),
            action: SyncAction::Upsert,
        }
    }

    pub fn remove(entity_type: impl Into<String>, canonical_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            canonical_id: canonical_id.into(),
            action: SyncAction::Remove,
        }
    }
}

/// The authoritative store for synced entities.
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<CanonicalRecord>, ServiceError>;

    /// Up to `limit` records with id strictly greater than `after`, ordered by id.
    async fn find(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, ServiceError>;

    async fn upsert(&self, record: CanonicalRecord) -> Result<CanonicalRecord, ServiceError>;

    async fn delete_by_id(&self, id: &str) -> Result<bool, ServiceError>;
}

/// A derived copy of canonical data. Both operations must be safe to repeat.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    fn name(&self) -> &str;

    /// Insert or update by `(entity_type, business_key)`; returns the mirror's id for the record.
    ///
    /// A mirror holds at most one row per canonical id. When the record's business key changed
    /// since the last upsert, the row under the old key must not survive.
    async fn upsert(&self, record: &CanonicalRecord) -> Result<String, ServiceError>;

    /// Remove whatever this mirror holds for the canonical record. `Ok(false)` if nothing was
    /// there.
    async fn remove(&self, entity_type: &str, canonical_id: &str) -> Result<bool, ServiceError>;
}
