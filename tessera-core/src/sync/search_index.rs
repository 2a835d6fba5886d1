//! Search-index mirror over an Elasticsearch-compatible HTTP API
//!
//! Documents are addressed by canonical id (`PUT/DELETE {base}/{index}/_doc/{id}`), which makes
//! both operations naturally idempotent.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

use super::{CanonicalRecord, MirrorStore};
use crate::config::env_or;
use crate::error::ServiceError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchIndexConfig {
    pub base_url: String,
    pub index: String,
    pub timeout: Duration,
}

impl Default for SearchIndexConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9200".to_string(),
            index: "tessera".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

impl SearchIndexConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: env_or("SEARCH_INDEX_URL", defaults.base_url),
            index: env_or("SEARCH_INDEX_NAME", defaults.index),
            timeout: Duration::from_millis(env_or(
                "SEARCH_INDEX_TIMEOUT_MS",
                defaults.timeout.as_millis() as u64,
            )),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchDocument<'a> {
    canonical_id: &'a str,
    entity_type: &'a str,
    business_key: &'a str,
    payload: &'a Value,
    updated_at: String,
}

#[derive(Debug, Deserialize)]
struct IndexResponse {
    #[serde(rename = "_id")]
    id: Option<String>,
}

pub struct HttpSearchIndex {
    name: String,
    base_url: String,
    index: String,
    client: reqwest::Client,
}

impl HttpSearchIndex {
    pub fn new(name: impl Into<String>, config: &SearchIndexConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| {
                ServiceError::ConfigError(format!("Failed to build search index client: {}", e))
            })?;

        Ok(Self {
            name: name.into(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            index: config.index.clone(),
            client,
        })
    }

    fn document_url(&self, id: &str) -> String {
        format!("{}/{}/_doc/{}", self.base_url, self.index, id)
    }
}

#[async_trait]
impl MirrorStore for HttpSearchIndex {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, record), fields(index = %self.index, canonical_id = %record.id))]
    async fn upsert(&self, record: &CanonicalRecord) -> Result<String, ServiceError> {
        let document = SearchDocument {
            canonical_id: &record.id,
            entity_type: &record.entity_type,
            business_key: &record.business_key,
            payload: &record.payload,
            updated_at: record.updated_at.to_rfc3339(),
        };

        let response = self
            .client
            .put(self.document_url(&record.id))
            .json(&document)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ServiceError::SearchIndexError(format!(
                "Indexing {} failed with status: {}",
                record.id,
                response.status()
            )));
        }

        let body: IndexResponse = response.json().await?;
        debug!("Indexed document");
        Ok(body.id.unwrap_or_else(|| record.id.clone()))
    }

    async fn remove(&self, _entity_type: &str, canonical_id: &str) -> Result<bool, ServiceError> {
        let response = self.client.delete(self.document_url(canonical_id)).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(ServiceError::SearchIndexError(format!(
                "Deleting {} failed with status: {}",
                canonical_id, status
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_url_strips_trailing_slash() {
        let config = SearchIndexConfig {
            base_url: "http://search:9200/".to_string(),
            index: "users".to_string(),
            timeout: Duration::from_secs(1),
        };
        let index = HttpSearchIndex::new("search", &config).unwrap();
        assert_eq!(index.document_url("c-1"), "http://search:9200/users/_doc/c-1");
        assert_eq!(index.name(), "search");
    }

    #[tokio::test]
    async fn unreachable_index_is_a_transient_error() {
        let config = SearchIndexConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            index: "users".to_string(),
            timeout: Duration::from_millis(200),
        };
        let index = HttpSearchIndex::new("search", &config).unwrap();
        let record = CanonicalRecord::new("c-1", "user", "alice", Value::Null);

        let err = index.upsert(&record).await.unwrap_err();
        assert!(matches!(err, ServiceError::SearchIndexError(_)));
        assert!(err.is_transient());
    }
}
