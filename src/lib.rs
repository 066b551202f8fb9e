//! Warden - namespace-scoped policy decisions for observability gateways
//!
//! Warden is the external policy decision endpoint a multi-tenant
//! observability gateway consults before forwarding a read or write to the
//! downstream log store. Given a forwarded bearer token, a subject, a tenant
//! and an optional set of namespace selectors, it answers an OPA-style data
//! query with allow/deny and, for constrained readers, the label matchers the
//! gateway must inject into the downstream query.
//!
//! # Architecture
//!
//! The endpoint specializes the configured matcher for the caller, then asks
//! the decision engine. The engine consults the cache and, on a miss, runs a
//! cluster-scoped access review followed by namespace resolution or a
//! per-namespace review fan-out before synthesizing and caching the reply.
//! The cache and matcher configuration are process-wide; the cluster client
//! is built per request because it carries the caller's token in its
//! transport.
//!
//! # Modules
//!
//! - [`authorizer`] - The decision engine, cache key derivation and response model
//! - [`cache`] - Pluggable decision cache (in-memory TTL or memcached)
//! - [`cluster`] - Access-review client on the Kubernetes API
//! - [`config`] - Startup flags and validated configuration
//! - [`handler`] - The OPA-compatible decision endpoint
//! - [`matcher`] - Label matcher configuration and per-request specialization
//! - [`metrics`] - Metric names and recording helpers
//! - [`server`] - Public/internal serving plumbing and shutdown handling

#![deny(missing_docs)]

pub mod authorizer;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod handler;
pub mod matcher;
pub mod metrics;
pub mod server;
