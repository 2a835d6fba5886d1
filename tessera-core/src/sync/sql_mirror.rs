//! Relational mirror over `mirror_records`
//!
//! Upserts on the `(entity_type, business_key)` primary key, so a repeated sync updates the
//! existing row and keeps its `mirror_id`. A canonical record owns at most one row: when its
//! business key changes, the row under the old key is released and its `mirror_id` carried
//! over to the new key.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{CanonicalRecord, MirrorStore};
use crate::database::DatabasePool;
use crate::error::ServiceError;

const RELEASE_MOVED_POSTGRES: &str = r#"
    DELETE FROM mirror_records
    WHERE entity_type = $1 AND canonical_id = $2 AND business_key <> $3
    RETURNING mirror_id
"#;

const RELEASE_MOVED_SQLITE: &str = r#"
    DELETE FROM mirror_records
    WHERE entity_type = ? AND canonical_id = ? AND business_key <> ?
    RETURNING mirror_id
"#;

const UPSERT_POSTGRES: &str = r#"
    INSERT INTO mirror_records
        (entity_type, business_key, mirror_id, canonical_id, payload, source_updated_at, synced_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
    ON CONFLICT (entity_type, business_key) DO UPDATE SET
        canonical_id = excluded.canonical_id,
        payload = excluded.payload,
        source_updated_at = excluded.source_updated_at,
        synced_at = excluded.synced_at
    RETURNING mirror_id
"#;

const UPSERT_SQLITE: &str = r#"
    INSERT INTO mirror_records
        (entity_type, business_key, mirror_id, canonical_id, payload, source_updated_at, synced_at)
    VALUES (?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (entity_type, business_key) DO UPDATE SET
        canonical_id = excluded.canonical_id,
        payload = excluded.payload,
        source_updated_at = excluded.source_updated_at,
        synced_at = excluded.synced_at
    RETURNING mirror_id
"#;

/// Release the row held under a previous business key, then upsert, in one transaction.
macro_rules! upsert_record {
    ($pool:expr, $release:expr, $upsert:expr, $record:expr, $payload:expr, $synced_at:expr) => {{
        let mut tx = $pool.begin().await?;

        let released = sqlx::query_scalar::<_, String>($release)
            .bind(&$record.entity_type)
            .bind(&$record.id)
            .bind(&$record.business_key)
            .fetch_all(&mut *tx)
            .await?;
        if !released.is_empty() {
            debug!(
                business_key = %$record.business_key,
                "Business key changed, moved mirror row"
            );
        }
        let candidate_id = released
            .into_iter()
            .next()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mirror_id = sqlx::query_scalar::<_, String>($upsert)
            .bind(&$record.entity_type)
            .bind(&$record.business_key)
            .bind(&candidate_id)
            .bind(&$record.id)
            .bind($payload)
            .bind($record.updated_at.to_rfc3339())
            .bind($synced_at)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        mirror_id
    }};
}

pub struct SqlMirrorStore {
    name: String,
    pool: DatabasePool,
}

impl SqlMirrorStore {
    pub fn new(name: impl Into<String>, pool: DatabasePool) -> Self {
        Self {
            name: name.into(),
            pool,
        }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// Number of mirrored rows for `entity_type`
    pub async fn count(&self, entity_type: &str) -> Result<i64, ServiceError> {
        let count = match &self.pool {
            DatabasePool::Postgres(pool) => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM mirror_records WHERE entity_type = $1",
                )
                .bind(entity_type)
                .fetch_one(pool)
                .await?
            }
            DatabasePool::Sqlite(pool) => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM mirror_records WHERE entity_type = ?",
                )
                .bind(entity_type)
                .fetch_one(pool)
                .await?
            }
        };
        Ok(count)
    }

    /// Mirror id of the row for `(entity_type, business_key)`, if mirrored
    pub async fn mirror_id(
        &self,
        entity_type: &str,
        business_key: &str,
    ) -> Result<Option<String>, ServiceError> {
        let mirror_id = match &self.pool {
            DatabasePool::Postgres(pool) => {
                sqlx::query_scalar::<_, String>(
                    "SELECT mirror_id FROM mirror_records \
                     WHERE entity_type = $1 AND business_key = $2",
                )
                .bind(entity_type)
                .bind(business_key)
                .fetch_optional(pool)
                .await?
            }
            DatabasePool::Sqlite(pool) => {
                sqlx::query_scalar::<_, String>(
                    "SELECT mirror_id FROM mirror_records \
                     WHERE entity_type = ? AND business_key = ?",
                )
                .bind(entity_type)
                .bind(business_key)
                .fetch_optional(pool)
                .await?
            }
        };
        Ok(mirror_id)
    }
}

#[async_trait]
impl MirrorStore for SqlMirrorStore {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, record), fields(mirror = %self.name, canonical_id = %record.id))]
    async fn upsert(&self, record: &CanonicalRecord) -> Result<String, ServiceError> {
        let payload = serde_json::to_string(&record.payload)?;
        let synced_at = Utc::now().to_rfc3339();

        let mirror_id = match &self.pool {
            DatabasePool::Postgres(pool) => upsert_record!(
                pool,
                RELEASE_MOVED_POSTGRES,
                UPSERT_POSTGRES,
                record,
                &payload,
                &synced_at
            ),
            DatabasePool::Sqlite(pool) => upsert_record!(
                pool,
                RELEASE_MOVED_SQLITE,
                UPSERT_SQLITE,
                record,
                &payload,
                &synced_at
            ),
        };

        debug!(mirror_id = %mirror_id, "Mirrored record");
        Ok(mirror_id)
    }

    async fn remove(&self, entity_type: &str, canonical_id: &str) -> Result<bool, ServiceError> {
        let result = match &self.pool {
            DatabasePool::Postgres(pool) => {
                sqlx::query(
                    "DELETE FROM mirror_records WHERE entity_type = $1 AND canonical_id = $2",
                )
                .bind(entity_type)
                .bind(canonical_id)
                .execute(pool)
                .await?
                    .rows_affected()
            }
            DatabasePool::Sqlite(pool) => {
                sqlx::query("DELETE FROM mirror_records WHERE entity_type = ? AND canonical_id = ?")
                    .bind(entity_type)
                    .bind(canonical_id)
                    .execute(pool)
                    .await?
                    .rows_affected()
            }
        };
        Ok(result > 0)
    }
}
