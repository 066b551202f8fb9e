//! Pluggable decision cache.
//!
//! The cache is a capability (get/set plus metrics publication) rather than a
//! class hierarchy; two implementations satisfy it, an in-memory TTL store
//! and a remote memcached store. Entries are the JSON serialization of the
//! decided response and must round-trip exactly.

mod memcached;
mod memory;

pub use memcached::MemcachedCache;
pub use memory::MemoryCache;

use async_trait::async_trait;
use thiserror::Error;

use crate::authorizer::response::DataResponse;

/// Errors raised by cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A decision could not be serialized for storage.
    #[error("failed to encode decision for the cache: {0}")]
    Encode(#[source] serde_json::Error),

    /// A stored entry could not be decoded back into a decision.
    #[error("failed to decode cached decision: {0}")]
    Decode(#[source] serde_json::Error),

    /// The backing store failed.
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Get/set capability over decided responses, shared by all request handlers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Cache: Send + Sync {
    /// Fetch the decision stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<DataResponse>, CacheError>;

    /// Store a decision under `key`, bounded by the configured TTL.
    async fn set(&self, key: &str, response: &DataResponse) -> Result<(), CacheError>;
}

fn to_json(response: &DataResponse) -> Result<Vec<u8>, CacheError> {
    serde_json::to_vec(response).map_err(CacheError::Encode)
}

fn from_json(bytes: &[u8]) -> Result<DataResponse, CacheError> {
    serde_json::from_slice(bytes).map_err(CacheError::Decode)
}
