//! Discovery engine facade

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::DiscoveryConfig;
use crate::engine::events::{DiscoveryEvent, EventBus, EventListener, ListenerHandle};
use crate::engine::state::{EngineState, EngineStatus};
use crate::error::DiscoveryError;
use crate::load_balancer::LoadBalancer;
use crate::providers::{SecureSessionProvider, TopologyProvider};
use crate::registry::{
    HealthMonitor, HealthProbe, NetworkProbe, ServiceRegistry, SubscriptionCallback,
};
use crate::types::*;

/// Name of the bootstrap service describing the registry itself
pub const REGISTRY_SERVICE_NAME: &str = "discovery-registry";

/// Name of the bootstrap service describing the health monitor
pub const HEALTH_MONITOR_SERVICE_NAME: &str = "health-monitor";

const BOOTSTRAP_ADDRESS: &str = "127.0.0.1";
const REGISTRY_SERVICE_PORT: u16 = 7400;
const HEALTH_MONITOR_SERVICE_PORT: u16 = 7401;

/// Public entry point composing the registry, balancer and event stream
pub struct DiscoveryEngine {
    /// Engine configuration
    config: DiscoveryConfig,

    /// Local node id, used when a caller names no requester
    node_id: String,

    /// Service registry
    registry: Arc<ServiceRegistry>,

    /// Load balancer
    load_balancer: Arc<LoadBalancer>,

    /// Background health monitor
    monitor: HealthMonitor,

    /// Event stream
    events: EventBus,

    /// Lifecycle state
    state: RwLock<EngineState>,
}

impl DiscoveryEngine {
    /// Create an engine; it accepts no calls until [`initialize`](Self::initialize)
    pub fn new(
        config: DiscoveryConfig,
        topology: Arc<dyn TopologyProvider>,
        sessions: Arc<dyn SecureSessionProvider>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| topology.local_node_id());

        let registry = Arc::new(ServiceRegistry::new(
            &config,
            topology.clone(),
            sessions.clone(),
            probe,
        ));
        let load_balancer = Arc::new(LoadBalancer::new(
            &config.load_balancing,
            registry.clone(),
            topology,
            sessions,
        ));
        let monitor = HealthMonitor::new(&config.health, registry.clone());

        Self {
            config,
            node_id,
            registry,
            load_balancer,
            monitor,
            events: EventBus::new(),
            state: RwLock::new(EngineState::default()),
        }
    }

    /// Create an engine probing targets over the network
    pub fn with_network_probe(
        config: DiscoveryConfig,
        topology: Arc<dyn TopologyProvider>,
        sessions: Arc<dyn SecureSessionProvider>,
    ) -> Result<Self, DiscoveryError> {
        let probe = Arc::new(NetworkProbe::new(&config, topology.clone(), sessions.clone())?);
        Ok(Self::new(config, topology, sessions, probe))
    }

    /// Bootstrap default services and start health monitoring
    ///
    /// A failure is reported once through an `error` event and leaves the
    /// engine permanently unusable.
    pub async fn initialize(&self) -> Result<(), DiscoveryError> {
        // Held for the whole bootstrap so no call observes a half-built registry
        let mut state = self.state.write().await;
        match state.status() {
            EngineStatus::Ready => return Ok(()),
            EngineStatus::Failed | EngineStatus::Stopped => {
                return Err(DiscoveryError::NotInitialized)
            }
            EngineStatus::Uninitialized => {}
        }

        info!("Initializing discovery engine on node {}", self.node_id);

        let started = match self.bootstrap().await {
            Ok(()) if self.config.health.enabled => self.monitor.start().await,
            other => other,
        };

        if let Err(e) = started {
            let message = format!("Discovery engine bootstrap failed: {}", e);
            error!("{}", message);
            state.fail(message.clone());
            self.events.emit(DiscoveryEvent::error(message.clone())).await;
            return Err(DiscoveryError::Bootstrap(message));
        }

        state.set_status(EngineStatus::Ready);
        info!(
            "Discovery engine ready with {} services",
            self.registry.service_count().await
        );
        Ok(())
    }

    async fn bootstrap(&self) -> Result<(), DiscoveryError> {
        if let Err(e) = self.config.validate() {
            return Err(DiscoveryError::Bootstrap(e.to_string()));
        }
        if !self.config.bootstrap.enabled {
            info!("Bootstrap services disabled");
            return Ok(());
        }

        let mut definitions = self.default_services();
        definitions.extend(self.config.bootstrap.services.iter().cloned());

        for def in definitions {
            let name = def.name.clone();
            let service_id = self.registry.register_service(def).await.map_err(|e| {
                DiscoveryError::Bootstrap(format!("Failed to register {}: {}", name, e))
            })?;
            info!("Bootstrapped service {} ({})", name, service_id);
        }
        Ok(())
    }

    fn default_services(&self) -> Vec<ServiceDefinition> {
        let system = |name: &str, port: u16| {
            let mut def = ServiceDefinition::new(
                name,
                ServiceEndpoint::new(&self.node_id, BOOTSTRAP_ADDRESS, port),
            )
            .with_tags(["system", "discovery"])
            .with_health_check(HealthCheckType::SecureChannel);
            def.service_type = "system".to_string();
            def.metadata.version = crate::DISCOVERY_VERSION.to_string();
            def
        };

        vec![
            system(REGISTRY_SERVICE_NAME, REGISTRY_SERVICE_PORT),
            system(HEALTH_MONITOR_SERVICE_NAME, HEALTH_MONITOR_SERVICE_PORT),
        ]
    }

    async fn ensure_ready(&self) -> Result<(), DiscoveryError> {
        if self.state.read().await.is_ready() {
            Ok(())
        } else {
            Err(DiscoveryError::NotInitialized)
        }
    }

    pub async fn status(&self) -> EngineStatus {
        self.state.read().await.status()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Register a service
    pub async fn register_service(&self, def: ServiceDefinition) -> Result<String, DiscoveryError> {
        self.ensure_ready().await?;
        let name = def.name.trim().to_string();
        let service_id = self.registry.register_service(def).await?;

        self.events
            .emit(DiscoveryEvent::ServiceRegistered {
                service_id: service_id.clone(),
                name,
                timestamp: current_timestamp(),
            })
            .await;
        Ok(service_id)
    }

    /// Register an instance of a registered service
    pub async fn register_service_instance(
        &self,
        def: InstanceDefinition,
    ) -> Result<String, DiscoveryError> {
        self.ensure_ready().await?;
        let service_id = def.service_id.clone();
        let instance_id = self.registry.register_instance(def).await?;

        self.events
            .emit(DiscoveryEvent::InstanceRegistered {
                service_id,
                instance_id: instance_id.clone(),
                timestamp: current_timestamp(),
            })
            .await;
        Ok(instance_id)
    }

    /// Services matching `pattern` visible to the requester, the local node by default
    pub async fn discover_services(
        &self,
        pattern: &str,
        requester_node_id: Option<&str>,
    ) -> Result<Vec<Service>, DiscoveryError> {
        self.ensure_ready().await?;
        let requester = requester_node_id.unwrap_or(self.node_id.as_str());
        let services = self.registry.discover_services(pattern, requester).await;

        self.events
            .emit(DiscoveryEvent::ServicesDiscovered {
                pattern: pattern.to_string(),
                requester_node_id: requester.to_string(),
                count: services.len(),
                timestamp: current_timestamp(),
            })
            .await;
        Ok(services)
    }

    /// Subscribe to services matching `pattern`
    ///
    /// The callback receives the current matching set before this returns,
    /// then each matching service registered afterwards.
    pub async fn subscribe_to_services(
        &self,
        pattern: &str,
        requester_node_id: Option<&str>,
        callback: SubscriptionCallback,
    ) -> Result<String, DiscoveryError> {
        self.ensure_ready().await?;
        let requester = requester_node_id.unwrap_or(self.node_id.as_str());
        let subscription_id = self.registry.subscribe(pattern, requester, callback).await;

        self.events
            .emit(DiscoveryEvent::SubscriptionCreated {
                subscription_id: subscription_id.clone(),
                pattern: pattern.to_string(),
                timestamp: current_timestamp(),
            })
            .await;
        Ok(subscription_id)
    }

    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<bool, DiscoveryError> {
        self.ensure_ready().await?;
        Ok(self.registry.unsubscribe(subscription_id).await)
    }

    /// Bind a client to a healthy instance of a service, given by id or name
    ///
    /// `Ok(None)` when no instance is healthy.
    pub async fn bind_to_service(
        &self,
        service: &str,
        client_node_id: Option<&str>,
        require_secure_session: bool,
    ) -> Result<Option<ServiceBinding>, DiscoveryError> {
        self.ensure_ready().await?;
        let service_id = self.resolve_service_id(service).await?;
        let client = client_node_id.unwrap_or(self.node_id.as_str());

        let binding = self
            .load_balancer
            .bind_to_service(&service_id, client, require_secure_session)
            .await?;

        if let Some(binding) = &binding {
            self.events
                .emit(DiscoveryEvent::ServiceBound {
                    binding_id: binding.binding_id.clone(),
                    service_id: binding.service_id.clone(),
                    instance_id: binding.instance_id.clone(),
                    secured: binding.secured,
                    timestamp: current_timestamp(),
                })
                .await;
        }
        Ok(binding)
    }

    /// Select an instance without creating a binding
    ///
    /// The caller owns the connection and gives it back with
    /// [`release_connection`](Self::release_connection).
    pub async fn select_instance(
        &self,
        service: &str,
        client_id: Option<&str>,
        strategy: Option<SelectionStrategy>,
    ) -> Result<Option<ServiceInstance>, DiscoveryError> {
        self.ensure_ready().await?;
        let service_id = self.resolve_service_id(service).await?;
        self.load_balancer
            .select_instance(&service_id, client_id, strategy)
            .await
    }

    pub async fn release_connection(&self, instance_id: &str) -> Result<(), DiscoveryError> {
        self.ensure_ready().await?;
        self.load_balancer.release_connection(instance_id).await;
        Ok(())
    }

    /// Release a binding
    pub async fn release_service_binding(&self, binding_id: &str) -> Result<(), DiscoveryError> {
        self.ensure_ready().await?;
        let binding = self.load_balancer.release_binding(binding_id).await?;

        self.events
            .emit(DiscoveryEvent::BindingReleased {
                binding_id: binding.binding_id,
                timestamp: current_timestamp(),
            })
            .await;
        Ok(())
    }

    /// Look up a live binding; expired bindings are NotFound
    pub async fn get_binding(&self, binding_id: &str) -> Result<ServiceBinding, DiscoveryError> {
        self.ensure_ready().await?;
        self.load_balancer
            .get_binding(binding_id)
            .await
            .ok_or_else(|| DiscoveryError::NotFound(format!("Binding not found: {}", binding_id)))
    }

    /// Remove a service with its instances, checks, bindings and affinities
    ///
    /// Returns false when the service is unknown.
    pub async fn unregister_service(&self, service_id: &str) -> Result<bool, DiscoveryError> {
        self.ensure_ready().await?;
        let Some(instance_ids) = self.registry.unregister_service(service_id).await else {
            warn!("Cannot unregister unknown service {}", service_id);
            return Ok(false);
        };
        self.load_balancer
            .purge_service(service_id, &instance_ids)
            .await;

        self.events
            .emit(DiscoveryEvent::ServiceUnregistered {
                service_id: service_id.to_string(),
                timestamp: current_timestamp(),
            })
            .await;
        Ok(true)
    }

    pub async fn get_service(&self, service_id: &str) -> Result<Option<Service>, DiscoveryError> {
        self.ensure_ready().await?;
        Ok(self.registry.get_service(service_id).await)
    }

    pub async fn get_service_by_name(&self, name: &str) -> Result<Option<Service>, DiscoveryError> {
        self.ensure_ready().await?;
        Ok(self.registry.get_service_by_name(name).await)
    }

    pub async fn get_service_instances(
        &self,
        service_id: &str,
    ) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        self.ensure_ready().await?;
        Ok(self.registry.get_service_instances(service_id).await)
    }

    /// Health checks of a service and its instances
    pub async fn get_health_checks(
        &self,
        service_id: &str,
    ) -> Result<Vec<HealthCheck>, DiscoveryError> {
        self.ensure_ready().await?;
        Ok(self.registry.get_health_checks(service_id).await)
    }

    /// Current registry and balancer counters
    pub async fn get_discovery_statistics(&self) -> Result<DiscoveryStatistics, DiscoveryError> {
        self.ensure_ready().await?;
        let totals = self.registry.live_totals().await;

        Ok(DiscoveryStatistics {
            total_services: self.registry.service_count().await,
            total_instances: totals.total_instances,
            healthy_instances: totals.healthy_instances,
            total_requests: totals.total_requests,
            mean_response_time_ms: totals.mean_response_time_ms,
            active_bindings: self.load_balancer.active_bindings().await,
            active_affinities: self.load_balancer.active_affinities().await,
            active_subscriptions: self.registry.subscription_count().await,
            connection_distribution: self.load_balancer.connection_distribution().await,
        })
    }

    /// Aggregates from the monitor's last aggregate pass
    pub async fn get_registry_aggregates(&self) -> Result<RegistryAggregates, DiscoveryError> {
        self.ensure_ready().await?;
        Ok(self.registry.aggregates().await)
    }

    /// Run every health check now instead of waiting for the monitor
    pub async fn run_health_checks(&self) -> Result<usize, DiscoveryError> {
        self.ensure_ready().await?;
        let completed = self.registry.run_all_checks().await;
        self.registry.recompute_aggregates().await;
        Ok(completed)
    }

    /// Register an event listener; allowed before initialization
    pub async fn subscribe_events(&self, listener: EventListener) -> ListenerHandle {
        self.events.subscribe(listener).await
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Stop background monitoring and refuse further calls
    pub async fn shutdown(&self) -> Result<(), DiscoveryError> {
        info!("Shutting down discovery engine");
        self.monitor.stop().await?;

        let mut state = self.state.write().await;
        state.set_status(EngineStatus::Stopped);
        Ok(())
    }

    async fn resolve_service_id(&self, service: &str) -> Result<String, DiscoveryError> {
        self.registry
            .resolve_service(service)
            .await
            .map(|found| found.service_id)
            .ok_or_else(|| DiscoveryError::NotFound(format!("Service not found: {}", service)))
    }
}
