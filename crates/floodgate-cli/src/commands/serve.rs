//! Serve command implementation.

use crate::server;
use anyhow::{Context, Result};
use floodgate_core::{Config, DocumentStore, InMemoryStore, LazyStore, ResilienceLayer, StoreError};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Run the gateway until SIGINT or SIGTERM, then flush and exit.
pub async fn run(mut config: Config, port: Option<u16>) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid server address in config: {}:{}",
                config.server.host, config.server.port
            )
        })?;

    // No external store is wired in yet; the in-memory store stands in behind
    // the same lazy construction a remote client would use.
    let store = Arc::new(LazyStore::new(|| {
        Ok::<_, StoreError>(Arc::new(InMemoryStore::new()) as Arc<dyn DocumentStore>)
    }));

    let layer = Arc::new(ResilienceLayer::new(config, store)?);
    layer.start();

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, "Gateway listening");

    let app = server::router(Arc::clone(&layer));
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    // Flush whatever is buffered even if the server failed.
    layer.shutdown().await;

    served.context("HTTP server error")?;
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, initiating graceful shutdown");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, initiating graceful shutdown");
    }
}
