//! Serving plumbing for the public and internal endpoints.
//!
//! The public server carries only the decision endpoint; the internal server
//! exposes Prometheus metrics and health probes on a separate listener.
//! Either listener can terminate TLS from PEM files.

use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::info;

use crate::config::TlsMaterial;
use crate::metrics;

/// Timeout for the readiness probe against the public listener.
const HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// State behind the internal endpoints.
#[derive(Clone)]
pub struct InternalState {
    prometheus: PrometheusHandle,
    probe: reqwest::Client,
    healthchecks_url: String,
}

impl InternalState {
    /// Bundle the metrics handle with the readiness probe target.
    pub fn new(prometheus: PrometheusHandle, healthchecks_url: String) -> Self {
        let probe = reqwest::Client::builder()
            .timeout(HEALTHCHECK_TIMEOUT)
            .build()
            .expect("failed to build healthcheck client");

        Self {
            prometheus,
            probe,
            healthchecks_url,
        }
    }
}

/// Build the internal router: `/metrics`, `/live` and `/ready`.
pub fn internal_router(state: InternalState) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/live", get(live))
        .route("/ready", get(ready))
        .with_state(state)
}

async fn render_metrics(State(state): State<InternalState>) -> String {
    state.prometheus.render()
}

async fn live() -> StatusCode {
    StatusCode::OK
}

async fn ready(State(state): State<InternalState>) -> Response {
    // The public router has no route at its root, so an answering listener
    // returns 404 there; anything else means it is not the public server.
    match state.probe.get(&state.healthchecks_url).send().await {
        Ok(response) if response.status() == StatusCode::NOT_FOUND => StatusCode::OK.into_response(),
        Ok(response) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("unexpected healthcheck status: {}", response.status()),
        )
            .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("healthcheck failed: {e}"),
        )
            .into_response(),
    }
}

/// Record request count and latency for the public endpoint.
pub async fn track_requests(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    metrics::record_http_request("data", method, response.status().as_u16(), started);
    response
}

/// Serve `router` on `addr`, terminating TLS when material is configured.
///
/// Runs until the listener fails; shutdown happens by dropping this future.
pub async fn serve(
    addr: SocketAddr,
    tls: Option<TlsMaterial>,
    router: Router,
) -> std::io::Result<()> {
    match tls {
        Some(material) => {
            let tls_config =
                RustlsConfig::from_pem_file(&material.cert_file, &material.key_file).await?;
            info!(%addr, "listening with TLS");
            axum_server::bind_rustls(addr, tls_config)
                .serve(router.into_make_service())
                .await
        }
        None => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!(%addr, "listening");
            axum::serve(listener, router.into_make_service()).await
        }
    }
}

/// Resolve when the process receives SIGINT or SIGTERM.
pub fn shutdown_signal() -> impl Future<Output = ()> {
    async {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install SIGINT handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
    }
}
