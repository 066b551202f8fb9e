//! Memcached-backed cache.
//!
//! Server addresses are resolved at startup and, when an interval is
//! configured, re-resolved periodically so rolling memcached deployments are
//! picked up without a restart. The memcached client is synchronous; calls
//! are bridged onto the blocking pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::{from_json, to_json, Cache, CacheError};
use crate::authorizer::response::DataResponse;
use crate::metrics;

/// Decision store on one or more memcached servers.
pub struct MemcachedCache {
    client: Arc<RwLock<Arc<memcache::Client>>>,
    expire: u32,
}

impl MemcachedCache {
    /// Connect to `servers` (`host:port`), storing values with `expire`
    /// seconds of lifetime.
    ///
    /// A non-zero `refresh_interval` starts a background task that
    /// re-resolves the server DNS on that interval; zero disables refresh.
    pub async fn connect(
        servers: Vec<String>,
        expire: u32,
        refresh_interval: Duration,
    ) -> Result<Self, CacheError> {
        let client = Arc::new(RwLock::new(Arc::new(build_client(&servers).await?)));

        if !refresh_interval.is_zero() {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(refresh_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick completes immediately; the initial client
                // was just built from the same addresses.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match build_client(&servers).await {
                        Ok(fresh) => {
                            *client.write().await = Arc::new(fresh);
                            debug!("refreshed memcached server addresses");
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to refresh memcached server addresses");
                        }
                    }
                }
            });
        }

        Ok(Self { client, expire })
    }

    async fn current(&self) -> Arc<memcache::Client> {
        self.client.read().await.clone()
    }
}

async fn build_client(servers: &[String]) -> Result<memcache::Client, CacheError> {
    let mut urls = Vec::new();
    for server in servers {
        let addrs = tokio::net::lookup_host(server.as_str())
            .await
            .map_err(|e| CacheError::Backend(format!("failed to resolve {server}: {e}")))?;
        for addr in addrs {
            urls.push(format!("memcache://{addr}"));
        }
    }

    if urls.is_empty() {
        return Err(CacheError::Backend(
            "no memcached servers resolved".to_string(),
        ));
    }

    tokio::task::spawn_blocking(move || memcache::Client::connect(urls))
        .await
        .map_err(|e| CacheError::Backend(e.to_string()))?
        .map_err(|e| CacheError::Backend(e.to_string()))
}

#[async_trait]
impl Cache for MemcachedCache {
    async fn get(&self, key: &str) -> Result<Option<DataResponse>, CacheError> {
        let client = self.current().await;
        let key = key.to_string();

        let bytes: Option<Vec<u8>> =
            tokio::task::spawn_blocking(move || client.get::<Vec<u8>>(&key))
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?
                .map_err(|e| CacheError::Backend(e.to_string()))?;

        metrics::record_cache_request(bytes.is_some());
        match bytes {
            Some(bytes) => from_json(&bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, response: &DataResponse) -> Result<(), CacheError> {
        let bytes = to_json(response)?;
        let client = self.current().await;
        let key = key.to_string();
        let expire = self.expire;

        tokio::task::spawn_blocking(move || client.set(&key, bytes.as_slice(), expire))
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        metrics::record_cache_insert();
        Ok(())
    }
}
