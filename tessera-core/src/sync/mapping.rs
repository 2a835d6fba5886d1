//! Cache-backed identity mapping between canonical ids and mirror ids
//!
//! Each direction is one cache entry without expiry:
//! `mapping:{source}:{id} -> {targetId}` inside the sync service namespace.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{CacheKey, ServiceCache};

const MAPPING_PURPOSE: &str = "mapping";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingDirection {
    CanonicalToMirror,
    MirrorToCanonical,
}

impl MappingDirection {
    pub fn reverse(self) -> Self {
        match self {
            MappingDirection::CanonicalToMirror => MappingDirection::MirrorToCanonical,
            MappingDirection::MirrorToCanonical => MappingDirection::CanonicalToMirror,
        }
    }
}

/// Result of a mapping lookup. Absence is expected for records not synced yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingLookup {
    Found(String),
    NotFound,
}

impl MappingLookup {
    pub fn found(self) -> Option<String> {
        match self {
            MappingLookup::Found(id) => Some(id),
            MappingLookup::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, MappingLookup::Found(_))
    }
}

#[derive(Clone)]
pub struct IdentityMappingStore {
    cache: ServiceCache,
    canonical_source: String,
    mirror_source: String,
}

impl IdentityMappingStore {
    /// `mirror_source` names the identity mirror whose ids are mapped.
    pub fn new(cache: ServiceCache, mirror_source: impl Into<String>) -> Self {
        Self {
            cache,
            canonical_source: "canonical".to_string(),
            mirror_source: mirror_source.into(),
        }
    }

    fn source(&self, direction: MappingDirection) -> &str {
        match direction {
            MappingDirection::CanonicalToMirror => &self.canonical_source,
            MappingDirection::MirrorToCanonical => &self.mirror_source,
        }
    }

    pub fn key(&self, id: &str, direction: MappingDirection) -> CacheKey {
        CacheKey::new(MAPPING_PURPOSE, format!("{}:{}", self.source(direction), id))
    }

    pub async fn resolve(&self, id: &str, direction: MappingDirection) -> MappingLookup {
        match self.cache.get_raw(&self.key(id, direction)).await {
            Some(target) => MappingLookup::Found(target),
            None => MappingLookup::NotFound,
        }
    }

    /// Record `canonical_id <-> mirror_id` in both directions.
    ///
    /// Repeating the same pair leaves the entries unchanged. If the canonical id was mapped to
    /// a different mirror id before, the stale reverse entry is dropped. Returns false if the
    /// cache rejected either write.
    pub async fn upsert(&self, canonical_id: &str, mirror_id: &str) -> bool {
        if let MappingLookup::Found(previous) =
            self.resolve(canonical_id, MappingDirection::CanonicalToMirror).await
        {
            if previous == mirror_id {
                return true;
            }
            debug!(
                canonical_id = canonical_id,
                previous = %previous,
                current = mirror_id,
                "Identity mapping moved to a new mirror id"
            );
            self.cache
                .del(&self.key(&previous, MappingDirection::MirrorToCanonical))
                .await;
        }

        let forward = self
            .cache
            .set_raw(&self.key(canonical_id, MappingDirection::CanonicalToMirror), mirror_id, None)
            .await;
        let reverse = self
            .cache
            .set_raw(&self.key(mirror_id, MappingDirection::MirrorToCanonical), canonical_id, None)
            .await;

        if !(forward && reverse) {
            warn!(
                canonical_id = canonical_id,
                mirror_id = mirror_id,
                "Identity mapping write incomplete"
            );
        }
        forward && reverse
    }

    /// Drop both directions for `canonical_id`. Returns the mirror id that was mapped, if any.
    pub async fn remove(&self, canonical_id: &str) -> Option<String> {
        let mirror_id = self
            .resolve(canonical_id, MappingDirection::CanonicalToMirror)
            .await
            .found()?;

        self.cache
            .del(&self.key(canonical_id, MappingDirection::CanonicalToMirror))
            .await;
        self.cache
            .del(&self.key(&mirror_id, MappingDirection::MirrorToCanonical))
            .await;
        Some(mirror_id)
    }
}
