//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Main binary for Orasi Discovery

use orasi_discovery::{
    config::DiscoveryConfig,
    engine::DiscoveryEngine,
    providers::{
        NodeInfo, PresharedKeyProvider, StaticTopology, CAPABILITY_READY,
        CAPABILITY_SECURE_CHANNEL,
    },
    DiscoveryEvent, DISCOVERY_NAME, DISCOVERY_VERSION,
};
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting {} v{}", DISCOVERY_NAME, DISCOVERY_VERSION);

    let config = DiscoveryConfig::load()?;
    info!("Configuration loaded successfully");

    let node_id = config
        .node_id
        .clone()
        .unwrap_or_else(|| format!("node-{}", uuid::Uuid::new_v4()));
    let local_node = NodeInfo::new(&node_id)
        .with_capability(CAPABILITY_READY)
        .with_capability(CAPABILITY_SECURE_CHANNEL)
        .with_channel_quality(1.0);

    let topology = Arc::new(StaticTopology::new(local_node));
    let sessions = Arc::new(PresharedKeyProvider::generate(&node_id));
    let report_interval = config.health.aggregate_interval;

    let engine = DiscoveryEngine::with_network_probe(config, topology, sessions)?;
    let _events = engine
        .subscribe_events(Arc::new(|event: &DiscoveryEvent| match event {
            DiscoveryEvent::Error { message, .. } => error!("Discovery error: {}", message),
            other => debug!("Discovery event: {}", other.kind()),
        }))
        .await;

    engine.initialize().await?;
    info!("Discovery engine started on node {}", engine.node_id());

    let mut report = interval(report_interval);
    report.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = report.tick() => {
                match engine.get_discovery_statistics().await {
                    Ok(stats) => info!(
                        "Registry: {} services, {}/{} instances healthy, {} active bindings, mean response {:.1} ms",
                        stats.total_services,
                        stats.healthy_instances,
                        stats.total_instances,
                        stats.active_bindings,
                        stats.mean_response_time_ms
                    ),
                    Err(e) => error!("Failed to read statistics: {}", e),
                }
            }
            _ = &mut shutdown => break,
        }
    }

    engine.shutdown().await?;
    info!("Discovery shutdown completed");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Ctrl+C received, shutting down");
        }
        _ = terminate => {
            info!("SIGTERM received, shutting down");
        }
    }
}
