// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Chat server bootstrap

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use aegis_chat_core::{
    application::ChatService,
    domain::node_config::NodeConfigManifest,
    infrastructure::{llm::backend_from_config, stages::llm_stages},
    presentation::app,
};

/// Runs until SIGINT/SIGTERM. On a signal the slot pool closes first, so
/// queued callers get an `unavailable` frame while running streams drain.
pub async fn start_server(
    config: NodeConfigManifest,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    config
        .validate()
        .context("Configuration validation failed")?;

    let spec = &config.spec;
    info!(
        node_id = %spec.node.id,
        capacity = spec.scheduler.capacity,
        model = %spec.inference.model,
        "AEGIS chat server starting"
    );

    if let Some(metrics_port) = spec.observability.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Metrics exporter listening on {}", addr);
    }

    let backend =
        backend_from_config(&spec.inference).context("Failed to initialize inference backend")?;
    if let Err(e) = backend.health_check().await {
        warn!(
            "Inference backend at {} is not reachable yet: {}",
            spec.inference.endpoint, e
        );
    }

    let chat = Arc::new(ChatService::new(backend.clone(), llm_stages(backend), spec));
    let router = app(chat.clone());

    let host = host.unwrap_or_else(|| spec.server.host.clone());
    let port = port.unwrap_or(spec.server.port);
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Chat server listening on {}", addr);

    let draining = chat.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            draining.shutdown();
        })
        .await
        .context("HTTP server failed")?;

    info!("Chat server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
