//! Network topology provider

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

/// Capability flag of nodes able to hold a secure channel
pub const CAPABILITY_SECURE_CHANNEL: &str = "secure_channel";

/// Capability flag of nodes ready to take traffic
pub const CAPABILITY_READY: &str = "ready";

/// Node as reported by the topology
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,

    /// Capability flags carried by the node
    pub capabilities: HashSet<String>,

    /// Channel quality score in `[0, 1]`
    pub channel_quality: f64,
}

impl NodeInfo {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            capabilities: HashSet::new(),
            channel_quality: 0.0,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_channel_quality(mut self, quality: f64) -> Self {
        self.channel_quality = quality;
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Whether the node carries every listed capability
    pub fn satisfies<S: AsRef<str>>(&self, requirements: &[S]) -> bool {
        requirements
            .iter()
            .all(|requirement| self.has_capability(requirement.as_ref()))
    }
}

/// Source of node identity and capabilities
#[async_trait]
pub trait TopologyProvider: Send + Sync {
    /// Identifier of the node this engine runs on
    fn local_node_id(&self) -> String;

    /// Look up a node
    async fn node(&self, node_id: &str) -> Option<NodeInfo>;
}

/// In-memory topology
pub struct StaticTopology {
    local_node_id: String,
    nodes: RwLock<HashMap<String, NodeInfo>>,
}

impl StaticTopology {
    pub fn new(local_node: NodeInfo) -> Self {
        let local_node_id = local_node.node_id.clone();
        let mut nodes = HashMap::new();
        nodes.insert(local_node_id.clone(), local_node);

        Self {
            local_node_id,
            nodes: RwLock::new(nodes),
        }
    }

    /// Add or replace a node
    pub async fn upsert_node(&self, node: NodeInfo) {
        debug!("Topology node updated: {}", node.node_id);
        let mut nodes = self.nodes.write().await;
        nodes.insert(node.node_id.clone(), node);
    }

    /// Remove a node
    pub async fn remove_node(&self, node_id: &str) -> bool {
        let mut nodes = self.nodes.write().await;
        nodes.remove(node_id).is_some()
    }
}

#[async_trait]
impl TopologyProvider for StaticTopology {
    fn local_node_id(&self) -> String {
        self.local_node_id.clone()
    }

    async fn node(&self, node_id: &str) -> Option<NodeInfo> {
        let nodes = self.nodes.read().await;
        nodes.get(node_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_topology_lookup() {
        let topology = StaticTopology::new(
            NodeInfo::new("node-1")
                .with_capability(CAPABILITY_READY)
                .with_channel_quality(0.9),
        );
        assert_eq!(topology.local_node_id(), "node-1");

        topology
            .upsert_node(NodeInfo::new("node-2").with_capability(CAPABILITY_SECURE_CHANNEL))
            .await;
        let node = topology.node("node-2").await.unwrap();
        assert!(node.has_capability(CAPABILITY_SECURE_CHANNEL));
        assert!(!node.has_capability(CAPABILITY_READY));

        assert!(topology.remove_node("node-2").await);
        assert!(topology.node("node-2").await.is_none());
    }

    #[test]
    fn test_requirements_must_all_be_present() {
        let node = NodeInfo::new("node-1")
            .with_capability("gpu")
            .with_capability(CAPABILITY_READY);
        assert!(node.satisfies(&["gpu"]));
        assert!(node.satisfies::<&str>(&[]));
        assert!(!node.satisfies(&["gpu", CAPABILITY_SECURE_CHANNEL]));
    }
}
