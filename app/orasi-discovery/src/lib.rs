//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Orasi Discovery: service registry, health checking and load balancing
//!
//! This crate keeps an in-memory registry of services and their instances,
//! probes them on a schedule, and hands out instances and bindings through
//! pluggable selection strategies. [`DiscoveryEngine`] is the entry point.

pub mod config;
pub mod engine;
pub mod error;
pub mod load_balancer;
pub mod providers;
pub mod registry;
pub mod types;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

// Re-export main types
pub use config::DiscoveryConfig;
pub use engine::{DiscoveryEngine, DiscoveryEvent, EngineStatus, ListenerHandle};
pub use error::DiscoveryError;
pub use providers::{SecureSessionProvider, TopologyProvider};
pub use types::*;

/// Result type for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Discovery version information
pub const DISCOVERY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Discovery name
pub const DISCOVERY_NAME: &str = "orasi-discovery";

/// Build and initialize a discovery engine that probes over the network
pub async fn init_discovery(
    config: DiscoveryConfig,
    topology: Arc<dyn TopologyProvider>,
    sessions: Arc<dyn SecureSessionProvider>,
) -> DiscoveryResult<DiscoveryEngine> {
    tracing::info!("Initializing Orasi discovery v{}", DISCOVERY_VERSION);

    let engine = DiscoveryEngine::with_network_probe(config, topology, sessions)?;
    engine.initialize().await?;
    tracing::info!("Orasi discovery initialization completed");

    Ok(engine)
}

/// Shutdown a discovery engine
pub async fn shutdown_discovery(engine: DiscoveryEngine) -> DiscoveryResult<()> {
    tracing::info!("Shutting down Orasi discovery");

    engine.shutdown().await?;
    tracing::info!("Orasi discovery shutdown completed");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{NodeInfo, PresharedKeyProvider, StaticTopology};

    #[tokio::test]
    async fn test_discovery_initialization() {
        let mut config = DiscoveryConfig::default();
        config.health.enabled = false;

        let engine = init_discovery(
            config,
            Arc::new(StaticTopology::new(NodeInfo::new("node-1"))),
            Arc::new(PresharedKeyProvider::generate("node-1")),
        )
        .await
        .unwrap();
        assert_eq!(engine.status().await, EngineStatus::Ready);

        shutdown_discovery(engine).await.unwrap();
    }
}
