//! Sync orchestration
//!
//! `sync_entity` is safe to repeat: mirrors upsert by business key, the mapping upsert is
//! idempotent and the write-through copy is last-write-wins. A sweep therefore can re-run any
//! record without creating duplicates.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::mapping::{IdentityMappingStore, MappingDirection, MappingLookup};
use super::{CanonicalRecord, CanonicalStore, MirrorStore};
use crate::cache::{CacheNamespace, CacheRegistry, ServiceCache};
use crate::config::SyncConfig;
use crate::error::ServiceError;
use crate::metrics::CoreMetrics;

const RECORD_PURPOSE: &str = "record";

/// Result of syncing one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub canonical_id: String,
    pub entity_type: String,
    /// `(mirror name, mirror id)` per mirror, in mirror order.
    pub mirror_ids: Vec<(String, String)>,
    /// Id assigned by the identity mirror, recorded in the mapping.
    pub identity_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncItemFailure {
    pub canonical_id: String,
    pub entity_type: String,
    pub reason: String,
}

/// Controls for a sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepOptions {
    /// Resume after this canonical id.
    pub start_after: Option<String>,
    /// Stop after this many records.
    pub max_items: Option<usize>,
    /// Stop between items once the value becomes `true`.
    pub cancel: Option<watch::Receiver<bool>>,
}

impl SweepOptions {
    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: Vec<SyncItemFailure>,
    /// Cursor to pass as `start_after` to continue. `None` after a sweep that reached the end,
    /// or one that stopped before passing its first record.
    pub next_cursor: Option<String>,
    /// The canonical store ran out of records during this sweep.
    pub exhausted: bool,
    pub cancelled: bool,
    /// Set when the canonical store could not be paged; the sweep stopped at `next_cursor`.
    pub aborted: Option<String>,
}

impl SweepReport {
    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.exhausted && !self.cancelled && self.aborted.is_none()
    }
}

pub struct SyncOrchestrator {
    canonical: Arc<dyn CanonicalStore>,
    mirrors: Vec<Arc<dyn MirrorStore>>,
    mappings: IdentityMappingStore,
    records: CacheNamespace<CanonicalRecord>,
    config: SyncConfig,
    metrics: Option<Arc<CoreMetrics>>,
}

impl SyncOrchestrator {
    /// `mirrors[0]` is the identity mirror whose ids are mapped to canonical ids.
    pub fn new(
        canonical: Arc<dyn CanonicalStore>,
        mirrors: Vec<Arc<dyn MirrorStore>>,
        cache: ServiceCache,
        config: SyncConfig,
    ) -> Self {
        let identity_source = mirrors
            .first()
            .map(|mirror| mirror.name().to_string())
            .unwrap_or_else(|| "mirror".to_string());

        Self {
            canonical,
            mirrors,
            mappings: IdentityMappingStore::new(cache.clone(), identity_source),
            records: cache.namespace(RECORD_PURPOSE),
            config,
            metrics: None,
        }
    }

    /// Orchestrator on the registry's `config.service` namespace, reporting into its metrics.
    pub fn from_registry(
        registry: &CacheRegistry,
        canonical: Arc<dyn CanonicalStore>,
        mirrors: Vec<Arc<dyn MirrorStore>>,
        config: SyncConfig,
    ) -> Self {
        let cache = registry.service(&config.service);
        Self::new(canonical, mirrors, cache, config).with_metrics(registry.metrics())
    }

    pub fn with_metrics(mut self, metrics: Arc<CoreMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn mappings(&self) -> &IdentityMappingStore {
        &self.mappings
    }

    /// Propagate the current canonical state of `canonical_id` to every mirror.
    #[instrument(skip(self))]
    pub async fn sync_entity(&self, canonical_id: &str) -> Result<SyncOutcome, ServiceError> {
        let record = self
            .canonical
            .find_by_id(canonical_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Canonical record {}", canonical_id)))?;

        self.sync_record(&record).await
    }

    async fn sync_record(&self, record: &CanonicalRecord) -> Result<SyncOutcome, ServiceError> {
        self.records
            .set(&record.id, record, Some(self.config.record_ttl))
            .await;

        let mut outcome = SyncOutcome {
            canonical_id: record.id.clone(),
            entity_type: record.entity_type.clone(),
            mirror_ids: Vec::with_capacity(self.mirrors.len()),
            identity_id: None,
        };
        let mut failures = Vec::new();

        for (index, mirror) in self.mirrors.iter().enumerate() {
            let result = self
                .config
                .retry
                .retry_transient(mirror.name(), || mirror.upsert(record))
                .await;

            match result {
                Ok(mirror_id) => {
                    if index == 0 {
                        self.mappings.upsert(&record.id, &mirror_id).await;
                        outcome.identity_id = Some(mirror_id.clone());
                    }
                    outcome.mirror_ids.push((mirror.name().to_string(), mirror_id));
                }
                Err(e) => {
                    warn!(
                        mirror = mirror.name(),
                        canonical_id = %record.id,
                        "Mirror write failed: {}",
                        e
                    );
                    failures.push(format!("{}: {}", mirror.name(), e));
                }
            }
        }

        if failures.is_empty() {
            debug!(canonical_id = %record.id, "Synced to {} mirror(s)", outcome.mirror_ids.len());
            self.record(&record.entity_type, "synced");
            Ok(outcome)
        } else {
            self.record(&record.entity_type, "failed");
            Err(ServiceError::SyncItemFailed {
                entity_type: record.entity_type.clone(),
                canonical_id: record.id.clone(),
                reason: failures.join("; "),
            })
        }
    }

    /// Sweep every canonical record. Never fails; per-item failures are in the report.
    pub async fn sync_all(&self) -> SweepReport {
        self.sync_all_with(SweepOptions::default()).await
    }

    #[instrument(skip(self, options), fields(start_after = ?options.start_after))]
    pub async fn sync_all_with(&self, options: SweepOptions) -> SweepReport {
        let page_size = self.config.page_size.max(1);
        let mut report = SweepReport::default();
        let mut cursor = options.start_after.clone();

        'sweep: loop {
            let page = self
                .config
                .retry
                .retry_transient("canonical page", || {
                    self.canonical.find(cursor.as_deref(), page_size)
                })
                .await;

            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    error!("Sweep stopped, canonical store unavailable: {}", e);
                    report.aborted = Some(e.to_string());
                    report.next_cursor = cursor;
                    break;
                }
            };

            let exhausted = page.len() < page_size;
            for record in page {
                if options.is_cancelled() {
                    report.cancelled = true;
                    report.next_cursor = cursor;
                    break 'sweep;
                }
                if options.max_items.is_some_and(|max| report.processed >= max) {
                    report.next_cursor = cursor;
                    break 'sweep;
                }

                match self.sync_record(&record).await {
                    Ok(_) => report.succeeded += 1,
                    Err(e) => report.failed.push(SyncItemFailure {
                        canonical_id: record.id.clone(),
                        entity_type: record.entity_type.clone(),
                        reason: e.to_string(),
                    }),
                }
                report.processed += 1;
                cursor = Some(record.id);
            }

            if exhausted {
                report.exhausted = true;
                report.next_cursor = None;
                break;
            }
        }

        info!(
            "Sync sweep processed {} record(s): {} succeeded, {} failed",
            report.processed,
            report.succeeded,
            report.failed.len()
        );
        report
    }

    /// Look up the counterpart of `id`. Absence is a normal result.
    pub async fn resolve_mapping(&self, id: &str, direction: MappingDirection) -> MappingLookup {
        self.mappings.resolve(id, direction).await
    }

    /// Canonical record through the write-through cache.
    pub async fn read_through(
        &self,
        canonical_id: &str,
    ) -> Result<Option<CanonicalRecord>, ServiceError> {
        if let Some(record) = self.records.get(canonical_id).await {
            return Ok(Some(record));
        }

        let record = self.canonical.find_by_id(canonical_id).await?;
        if let Some(record) = &record {
            self.records
                .set(canonical_id, record, Some(self.config.record_ttl))
                .await;
        }
        Ok(record)
    }

    /// Propagate a canonical delete: remove from every mirror, then drop the mapping and the
    /// cached copy.
    #[instrument(skip(self))]
    pub async fn remove_entity(
        &self,
        entity_type: &str,
        canonical_id: &str,
    ) -> Result<(), ServiceError> {
        let mut failures = Vec::new();

        for mirror in &self.mirrors {
            let result = self
                .config
                .retry
                .retry_transient(mirror.name(), || mirror.remove(entity_type, canonical_id))
                .await;
            if let Err(e) = result {
                warn!(mirror = mirror.name(), "Mirror removal failed: {}", e);
                failures.push(format!("{}: {}", mirror.name(), e));
            }
        }

        self.mappings.remove(canonical_id).await;
        self.records.del(canonical_id).await;

        if failures.is_empty() {
            self.record(entity_type, "removed");
            Ok(())
        } else {
            self.record(entity_type, "failed");
            Err(ServiceError::SyncItemFailed {
                entity_type: entity_type.to_string(),
                canonical_id: canonical_id.to_string(),
                reason: failures.join("; "),
            })
        }
    }

    fn record(&self, entity_type: &str, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.sync_items.with_label_values(&[entity_type, outcome]).inc();
        }
    }
}
