//! In-memory TTL cache.
//!
//! Entries expire a fixed interval after insertion; a hit does not extend the
//! lifetime, so a decision is re-evaluated at most once per TTL window per
//! key. Capacity is capped to bound memory on pathological key cardinality.

use std::time::Duration;

use async_trait::async_trait;
use moka::notification::RemovalCause;

use super::{from_json, to_json, Cache, CacheError};
use crate::authorizer::response::DataResponse;
use crate::metrics;

/// Upper bound on resident entries; TTL alone already bounds staleness.
const MAX_ENTRIES: u64 = 8192;

/// TTL-bounded in-memory decision store.
pub struct MemoryCache {
    entries: moka::future::Cache<String, Vec<u8>>,
}

impl MemoryCache {
    /// Create a store whose entries expire `ttl` after insertion.
    ///
    /// A zero TTL disables expiry; the capacity cap still applies.
    pub fn new(ttl: Duration) -> Self {
        let mut builder = moka::future::Cache::<String, Vec<u8>>::builder()
            .max_capacity(MAX_ENTRIES)
            .eviction_listener(|_key, _value, cause| {
                if matches!(cause, RemovalCause::Expired | RemovalCause::Size) {
                    metrics::record_cache_eviction();
                }
            });
        if !ttl.is_zero() {
            builder = builder.time_to_live(ttl);
        }

        Self {
            entries: builder.build(),
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<DataResponse>, CacheError> {
        let entry = self.entries.get(key).await;
        metrics::record_cache_request(entry.is_some());

        match entry {
            Some(bytes) => from_json(&bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, response: &DataResponse) -> Result<(), CacheError> {
        let bytes = to_json(response)?;
        self.entries.insert(key.to_string(), bytes).await;

        metrics::record_cache_insert();
        metrics::set_cache_items(self.entries.entry_count());

        Ok(())
    }
}
