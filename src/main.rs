//! Warden - policy decision endpoint for multi-tenant observability gateways

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use warden::cache::{Cache, MemcachedCache, MemoryCache};
use warden::cluster::{KubeReviewerFactory, ReviewMode};
use warden::config::{CacheBackend, Config, Flags, LogFormat};
use warden::handler::{decision_router, AppState};
use warden::server::{
    internal_router, serve, shutdown_signal, track_requests, InternalState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install the process-wide crypto provider before any TLS user spins up.
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("failed to install crypto provider");

    let flags = Flags::parse();
    let config = Config::from_flags(flags).context("invalid configuration")?;

    init_tracing(&config);

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    tracing::info!(name = %config.name, "starting warden");
    run(config, prometheus).await
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_directive()));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init(),
        LogFormat::Logfmt => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init(),
    }
}

async fn run(config: Config, prometheus: PrometheusHandle) -> anyhow::Result<()> {
    let cache: Arc<dyn Cache> = match &config.cache {
        CacheBackend::InMemory { expire } => {
            tracing::info!(expire_secs = expire, "using in-memory decision cache");
            Arc::new(MemoryCache::new(Duration::from_secs(u64::from(*expire))))
        }
        CacheBackend::Memcached {
            servers,
            expire,
            interval,
        } => {
            tracing::info!(?servers, expire_secs = expire, "using memcached decision cache");
            Arc::new(
                MemcachedCache::connect(
                    servers.clone(),
                    *expire,
                    Duration::from_secs(u64::from(*interval)),
                )
                .await
                .context("failed to connect to memcached")?,
            )
        }
    };

    let mode = if config.ssar {
        ReviewMode::SelfSubjectAccessReview
    } else {
        ReviewMode::SubjectAccessReview
    };
    let factory = Arc::new(KubeReviewerFactory::new(config.kubeconfig.clone(), mode));

    let state = AppState {
        cache,
        factory,
        matcher: config.matcher.clone(),
        mappings: config.mappings.clone(),
        debug_token: config.debug_token.clone(),
    };

    let public = decision_router(&config.package, &config.rule, state)
        .layer(axum::middleware::from_fn(track_requests));
    let internal = internal_router(InternalState::new(
        prometheus,
        config.healthchecks_url.clone(),
    ));

    tracing::info!(
        public = %config.listen,
        internal = %config.listen_internal,
        "starting the HTTP servers"
    );

    tokio::select! {
        result = serve(config.listen, config.tls.clone(), public) => {
            result.context("public server failed")?;
        }
        result = serve(config.listen_internal, config.tls_internal.clone(), internal) => {
            result.context("internal server failed")?;
        }
        _ = shutdown_signal() => {
            tracing::info!("caught interrupt");
        }
    }

    tracing::info!("exiting");
    Ok(())
}
