//! Metric names and recording helpers.
//!
//! All metrics go through the `metrics` facade; the Prometheus recorder is
//! installed at startup and rendered from the internal server's `/metrics`
//! route.

use std::time::Instant;

/// Public endpoint request counter, labeled by handler, method and code.
pub const HTTP_REQUESTS_TOTAL: &str = "warden_http_requests_total";
/// Public endpoint request latency histogram, labeled by handler and method.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "warden_http_request_duration_seconds";

/// Cache retrieval counter, labeled by `result` (`hit`/`miss`).
pub const CACHE_REQUESTS_TOTAL: &str = "warden_cache_requests_total";
/// Cache insert counter.
pub const CACHE_INSERTS_TOTAL: &str = "warden_cache_inserts_total";
/// Cache eviction counter (TTL and capacity evictions).
pub const CACHE_EVICTIONS_TOTAL: &str = "warden_cache_evictions_total";
/// Resident cache entry gauge.
pub const CACHE_ITEMS: &str = "warden_cache_items";

/// Cluster API call counter, labeled by `operation` and `result`.
pub const CLUSTER_API_REQUESTS_TOTAL: &str = "warden_cluster_api_requests_total";
/// Cluster API call latency histogram, labeled by `operation`.
pub const CLUSTER_API_DURATION_SECONDS: &str = "warden_cluster_api_request_duration_seconds";

/// Record one cache retrieval.
pub fn record_cache_request(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    metrics::counter!(CACHE_REQUESTS_TOTAL, "result" => result).increment(1);
}

/// Record one cache insert.
pub fn record_cache_insert() {
    metrics::counter!(CACHE_INSERTS_TOTAL).increment(1);
}

/// Record one cache eviction.
pub fn record_cache_eviction() {
    metrics::counter!(CACHE_EVICTIONS_TOTAL).increment(1);
}

/// Update the resident cache entry gauge.
pub fn set_cache_items(count: u64) {
    metrics::gauge!(CACHE_ITEMS).set(count as f64);
}

/// Record one cluster API call with its outcome and latency.
pub fn record_cluster_api_call(operation: &'static str, started: Instant, ok: bool) {
    let result = if ok { "success" } else { "error" };
    metrics::counter!(CLUSTER_API_REQUESTS_TOTAL, "operation" => operation, "result" => result)
        .increment(1);
    metrics::histogram!(CLUSTER_API_DURATION_SECONDS, "operation" => operation)
        .record(started.elapsed().as_secs_f64());
}

/// Record one public endpoint request with its status and latency.
pub fn record_http_request(handler: &'static str, method: String, code: u16, started: Instant) {
    metrics::counter!(
        HTTP_REQUESTS_TOTAL,
        "handler" => handler,
        "method" => method.clone(),
        "code" => code.to_string(),
    )
    .increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION_SECONDS, "handler" => handler, "method" => method)
        .record(started.elapsed().as_secs_f64());
}
