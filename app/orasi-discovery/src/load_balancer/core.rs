//! Load balancer

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::LoadBalancingConfig;
use crate::error::DiscoveryError;
use crate::load_balancer::strategy::{self, SelectionContext};
use crate::providers::{NodeInfo, SecureSessionProvider, TopologyProvider};
use crate::registry::ServiceRegistry;
use crate::types::*;

/// Balancer bookkeeping, guarded as one unit
#[derive(Default)]
struct BalancerState {
    /// Round robin sequence per service id
    sequences: HashMap<String, usize>,
    /// Open connections per instance id
    connections: HashMap<String, usize>,
    /// Sticky instance per (service id, client id)
    affinity: HashMap<(String, String), String>,
    bindings: HashMap<String, ServiceBinding>,
}

impl BalancerState {
    fn release_connection(&mut self, instance_id: &str) {
        if let Some(count) = self.connections.get_mut(instance_id) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Selects instances and issues service bindings
pub struct LoadBalancer {
    config: LoadBalancingConfig,
    registry: Arc<ServiceRegistry>,
    topology: Arc<dyn TopologyProvider>,
    sessions: Arc<dyn SecureSessionProvider>,
    state: RwLock<BalancerState>,
}

impl LoadBalancer {
    pub fn new(
        config: &LoadBalancingConfig,
        registry: Arc<ServiceRegistry>,
        topology: Arc<dyn TopologyProvider>,
        sessions: Arc<dyn SecureSessionProvider>,
    ) -> Self {
        Self {
            config: config.clone(),
            registry,
            topology,
            sessions,
            state: RwLock::new(BalancerState::default()),
        }
    }

    /// Select a healthy instance of a service
    ///
    /// A client's sticky instance is reused while it stays selectable.
    /// Otherwise `strategy`, or the service's own strategy when `None`,
    /// picks one. `Ok(None)` means no instance is selectable.
    pub async fn select_instance(
        &self,
        service_id: &str,
        client_id: Option<&str>,
        strategy: Option<SelectionStrategy>,
    ) -> Result<Option<ServiceInstance>, DiscoveryError> {
        let (service, instances) = self
            .registry
            .selection_snapshot(service_id)
            .await
            .ok_or_else(|| DiscoveryError::NotFound(format!("Service not found: {}", service_id)))?;

        let strategy = strategy.unwrap_or(service.load_balancing.strategy);
        let nodes = if strategy == SelectionStrategy::Optimized {
            self.node_view(&instances).await
        } else {
            HashMap::new()
        };

        let selected = {
            let mut state = self.state.write().await;
            let sticky = client_id.and_then(|client| {
                let key = (service_id.to_string(), client.to_string());
                let pinned = state.affinity.get(&key)?.clone();
                match instances.iter().find(|i| i.instance_id == pinned) {
                    Some(instance) if instance.is_selectable() => Some(instance.clone()),
                    _ => {
                        debug!("Evicting stale affinity {} -> {}", client, pinned);
                        state.affinity.remove(&key);
                        None
                    }
                }
            });

            let selected = match sticky {
                Some(instance) => Some(instance),
                None => {
                    let sequence = match strategy {
                        SelectionStrategy::RoundRobin | SelectionStrategy::WeightedRoundRobin => {
                            let counter = state.sequences.entry(service_id.to_string()).or_insert(0);
                            let current = *counter;
                            *counter = counter.wrapping_add(1);
                            current
                        }
                        _ => 0,
                    };
                    let ctx = SelectionContext {
                        sequence,
                        entropy: rand::random(),
                        connections: Some(&state.connections),
                        weights: Some(&service.load_balancing.weights),
                        nodes: Some(&nodes),
                    };
                    let picked = strategy::select(strategy, &instances, &ctx).cloned();

                    if let (Some(instance), Some(client)) = (&picked, client_id) {
                        if service.load_balancing.sticky_sessions {
                            state.affinity.insert(
                                (service_id.to_string(), client.to_string()),
                                instance.instance_id.clone(),
                            );
                        }
                    }
                    picked
                }
            };

            if let Some(instance) = &selected {
                *state
                    .connections
                    .entry(instance.instance_id.clone())
                    .or_insert(0) += 1;
            }
            selected
        };

        match &selected {
            Some(instance) => {
                self.registry.record_request(&instance.instance_id).await;
                debug!(
                    "Selected instance {} of {} with {}",
                    instance.instance_id, service.name, strategy
                );
            }
            None => debug!("No selectable instance for {}", service.name),
        }
        Ok(selected)
    }

    /// Bind a client to an instance of a service
    ///
    /// Returns `Ok(None)` when no instance is selectable. A failed secure
    /// negotiation still yields a binding, marked `secured = false`.
    pub async fn bind_to_service(
        &self,
        service_id: &str,
        client_node_id: &str,
        require_secure_session: bool,
    ) -> Result<Option<ServiceBinding>, DiscoveryError> {
        let Some(instance) = self
            .select_instance(service_id, Some(client_node_id), None)
            .await?
        else {
            info!("No healthy instance to bind {} to {}", client_node_id, service_id);
            return Ok(None);
        };

        let ttl = chrono::Duration::from_std(self.config.binding_ttl).map_err(|e| {
            DiscoveryError::Configuration(format!("Invalid binding TTL: {}", e))
        })?;

        let session_key = if require_secure_session {
            self.negotiate(&instance.node_id).await
        } else {
            None
        };

        let binding_time = current_timestamp();
        let binding = ServiceBinding {
            binding_id: generate_id("bind"),
            service_id: service_id.to_string(),
            instance_id: instance.instance_id.clone(),
            client_node_id: client_node_id.to_string(),
            secured: session_key.is_some(),
            session_key: session_key.unwrap_or_default(),
            binding_time,
            expires_at: binding_time + ttl,
        };

        {
            let mut state = self.state.write().await;
            state
                .bindings
                .insert(binding.binding_id.clone(), binding.clone());
        }

        info!(
            "Bound {} to instance {} (secured: {})",
            client_node_id, binding.instance_id, binding.secured
        );
        Ok(Some(binding))
    }

    /// Release a binding and its connection
    pub async fn release_binding(&self, binding_id: &str) -> Result<ServiceBinding, DiscoveryError> {
        let binding = {
            let mut state = self.state.write().await;
            let binding = state.bindings.remove(binding_id).ok_or_else(|| {
                DiscoveryError::NotFound(format!("Binding not found: {}", binding_id))
            })?;
            state.release_connection(&binding.instance_id);
            binding
        };

        self.registry.record_completion(&binding.instance_id).await;
        info!("Released binding {}", binding_id);
        Ok(binding)
    }

    /// Look up a live binding, evicting it if it has expired
    pub async fn get_binding(&self, binding_id: &str) -> Option<ServiceBinding> {
        let mut state = self.state.write().await;
        let expired = state.bindings.get(binding_id)?.is_expired();
        if !expired {
            return state.bindings.get(binding_id).cloned();
        }

        if let Some(binding) = state.bindings.remove(binding_id) {
            debug!("Binding {} expired at {}", binding_id, binding.expires_at);
            state.release_connection(&binding.instance_id);
        }
        None
    }

    /// Give back a connection, never going below zero
    pub async fn release_connection(&self, instance_id: &str) {
        let mut state = self.state.write().await;
        state.release_connection(instance_id);
    }

    pub async fn connection_count(&self, instance_id: &str) -> usize {
        let state = self.state.read().await;
        state.connections.get(instance_id).copied().unwrap_or(0)
    }

    pub async fn connection_distribution(&self) -> HashMap<String, usize> {
        self.state.read().await.connections.clone()
    }

    pub async fn active_affinities(&self) -> usize {
        self.state.read().await.affinity.len()
    }

    /// Bindings that have not expired yet
    pub async fn active_bindings(&self) -> usize {
        let now = current_timestamp();
        let state = self.state.read().await;
        state
            .bindings
            .values()
            .filter(|binding| !binding.is_expired_at(now))
            .count()
    }

    /// Drop all bookkeeping of an unregistered service
    pub async fn purge_service(&self, service_id: &str, instance_ids: &[String]) {
        let mut state = self.state.write().await;
        state.sequences.remove(service_id);
        for instance_id in instance_ids {
            state.connections.remove(instance_id);
        }
        state.affinity.retain(|(service, _), _| service != service_id);
        let before = state.bindings.len();
        state.bindings.retain(|_, binding| binding.service_id != service_id);

        debug!(
            "Purged {} bindings of service {}",
            before - state.bindings.len(),
            service_id
        );
    }

    async fn negotiate(&self, peer_id: &str) -> Option<Vec<u8>> {
        let negotiation = self
            .sessions
            .negotiate_session_key(peer_id, self.config.session_key_bits);

        match timeout(self.config.negotiation_timeout, negotiation).await {
            Ok(Ok(Some(key))) if !key.is_empty() => Some(key),
            Ok(Ok(_)) => {
                warn!("Secure negotiation with {} produced no key, binding unsecured", peer_id);
                None
            }
            Ok(Err(e)) => {
                warn!("Secure negotiation with {} failed, binding unsecured: {}", peer_id, e);
                None
            }
            Err(_) => {
                warn!(
                    "Secure negotiation with {} timed out after {:?}, binding unsecured",
                    peer_id, self.config.negotiation_timeout
                );
                None
            }
        }
    }

    async fn node_view(&self, instances: &[ServiceInstance]) -> HashMap<String, NodeInfo> {
        let mut nodes = HashMap::new();
        for instance in instances {
            if nodes.contains_key(&instance.node_id) {
                continue;
            }
            if let Some(node) = self.topology.node(&instance.node_id).await {
                nodes.insert(instance.node_id.clone(), node);
            }
        }
        nodes
    }
}
