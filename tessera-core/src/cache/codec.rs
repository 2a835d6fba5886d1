//! Serialization contract between typed cache values and UTF-8 payloads

use serde::{de::DeserializeOwned, Serialize};

use crate::error::ServiceError;

/// Encodes and decodes the values stored under one cache namespace.
pub trait CacheCodec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<String, ServiceError>;
    fn decode(&self, payload: &str) -> Result<T, ServiceError>;
}

/// JSON codec, the default for every namespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> CacheCodec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<String, ServiceError> {
        serde_json::to_string(value)
            .map_err(|e| ServiceError::SerializationError(format!("Cache encode failed: {}", e)))
    }

    fn decode(&self, payload: &str) -> Result<T, ServiceError> {
        serde_json::from_str(payload)
            .map_err(|e| ServiceError::SerializationError(format!("Cache decode failed: {}", e)))
    }
}
