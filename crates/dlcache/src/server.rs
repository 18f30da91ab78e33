use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum_server::Handle;
use dlcache_service::config::Config;
use dlcache_service::metric;
use dlcache_service::service::ProxyService;

use crate::endpoints;
use crate::endpoints::RateLimiter;

/// How long in-flight downloads may continue after a shutdown was requested.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Starts the sweepers and the HTTP server based on the loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("dlcache-web")
        .enable_all()
        .build()?;

    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> Result<()> {
    let service = ProxyService::create(&config).context("failed to create proxy service")?;
    service
        .caches()
        .clear_tmp()
        .context("failed to clear temporary cache files")?;

    let sweepers = service.sweeper().spawn();

    let socket = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address `{}`", config.bind))?;
    let limiter = Arc::new(RateLimiter::new(config.rate_limit));
    let app = endpoints::create_app(service.clone(), limiter);

    let handle = Handle::new();
    tokio::spawn(shutdown_on_ctrl_c(handle.clone()));

    tracing::info!("Starting HTTP server on {}", socket);
    axum_server::bind(socket)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("HTTP server failed")?;

    for sweeper in sweepers {
        sweeper.abort();
    }

    let bandwidth = service.bandwidth();
    match bandwidth.flush() {
        Ok(_) => tracing::info!("Bandwidth saved: {} bytes", bandwidth.total()),
        Err(e) => tracing::error!("Failed to save bandwidth counter: {}", e),
    }

    tracing::info!("System shutdown complete");
    Ok(())
}

async fn shutdown_on_ctrl_c(handle: Handle) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Shutting down");
            handle.graceful_shutdown(Some(SHUTDOWN_GRACE_PERIOD));
        }
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
    }
}
