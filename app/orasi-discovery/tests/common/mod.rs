//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use orasi_discovery::providers::{
    NodeInfo, PresharedKeyProvider, SecureSessionProvider, ServiceKeyPair, StaticTopology,
    CAPABILITY_READY, CAPABILITY_SECURE_CHANNEL,
};
use orasi_discovery::registry::{HealthProbe, ProbeResult};
use orasi_discovery::{
    DiscoveryConfig, DiscoveryEngine, DiscoveryError, HealthCheck, ServiceEndpoint,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const LOCAL_NODE: &str = "node-local";

/// Probe whose per-endpoint outcome the test controls
#[derive(Default)]
pub struct ScriptedProbe {
    failing: Mutex<HashMap<String, bool>>,
}

impl ScriptedProbe {
    pub fn fail(&self, endpoint: &ServiceEndpoint) {
        self.failing
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), true);
    }

    pub fn recover(&self, endpoint: &ServiceEndpoint) {
        self.failing.lock().unwrap().remove(&endpoint.to_string());
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, check: &HealthCheck) -> ProbeResult {
        let failing = self
            .failing
            .lock()
            .unwrap()
            .contains_key(&check.endpoint.to_string());
        if failing {
            ProbeResult::failure(Duration::from_millis(2), "connection refused")
        } else {
            ProbeResult::success(Duration::from_millis(2))
        }
    }
}

/// Session provider that can never negotiate a key
pub struct BrokenSessions;

#[async_trait]
impl SecureSessionProvider for BrokenSessions {
    async fn negotiate_session_key(
        &self,
        peer_id: &str,
        _bit_length: u32,
    ) -> Result<Option<Vec<u8>>, DiscoveryError> {
        Err(DiscoveryError::SecureNegotiation(format!(
            "handshake with {} aborted",
            peer_id
        )))
    }

    async fn generate_service_key_pair(
        &self,
        service_name: &str,
    ) -> Result<ServiceKeyPair, DiscoveryError> {
        Err(DiscoveryError::SecureNegotiation(format!(
            "no key material for {}",
            service_name
        )))
    }
}

pub fn test_config() -> DiscoveryConfig {
    let mut config = DiscoveryConfig::minimal();
    config.node_id = Some(LOCAL_NODE.to_string());
    config
}

pub async fn topology() -> Arc<StaticTopology> {
    let topology = StaticTopology::new(
        NodeInfo::new(LOCAL_NODE)
            .with_capability(CAPABILITY_READY)
            .with_capability(CAPABILITY_SECURE_CHANNEL)
            .with_channel_quality(1.0),
    );
    topology
        .upsert_node(NodeInfo::new("node-a").with_capability(CAPABILITY_READY))
        .await;
    topology
        .upsert_node(NodeInfo::new("node-b").with_capability(CAPABILITY_READY))
        .await;
    Arc::new(topology)
}

pub async fn engine_with(
    config: DiscoveryConfig,
    sessions: Arc<dyn SecureSessionProvider>,
) -> (DiscoveryEngine, Arc<ScriptedProbe>) {
    let probe = Arc::new(ScriptedProbe::default());
    let engine = DiscoveryEngine::new(config, topology().await, sessions, probe.clone());
    engine.initialize().await.unwrap();
    (engine, probe)
}

pub async fn engine() -> (DiscoveryEngine, Arc<ScriptedProbe>) {
    engine_with(
        test_config(),
        Arc::new(PresharedKeyProvider::generate(LOCAL_NODE)),
    )
    .await
}

pub fn endpoint(node: &str, port: u16) -> ServiceEndpoint {
    ServiceEndpoint::new(node, "10.1.0.1", port)
}
