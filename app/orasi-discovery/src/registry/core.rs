//! Service registry
//!
//! All records live in a single [`RegistryState`] behind one `RwLock`. Every
//! mutation, whether from an API call or a health check completion, takes the
//! write lock for the whole update, so readers always see whole records and
//! a selection snapshot is consistent across a service and its instances.
//! Probes themselves run outside the lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::{self, JoinSet};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::providers::{SecureSessionProvider, TopologyProvider};
use crate::registry::pattern::{access_permitted, service_matches};
use crate::registry::probe::{HealthProbe, ProbeResult};
use crate::registry::schedule::HealthSchedule;
use crate::types::*;

/// Callback receiving the services matching a subscription
pub type SubscriptionCallback = Arc<dyn Fn(&[Service]) + Send + Sync>;

/// Standing discovery query
#[derive(Clone)]
pub struct Subscription {
    pub subscription_id: String,
    pub pattern: String,
    pub requester_node_id: String,
    pub callback: SubscriptionCallback,
    pub last_notified: Option<chrono::DateTime<chrono::Utc>>,
}

/// Instance totals read under one lock
#[derive(Debug, Clone, Default)]
pub struct InstanceTotals {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub total_requests: u64,
    pub mean_response_time_ms: f64,
}

/// Smoothing factor of the instance error rate
const ERROR_RATE_ALPHA: f64 = 0.1;

/// Registry records
#[derive(Default)]
pub struct RegistryState {
    services: HashMap<String, Service>,
    instances: HashMap<String, ServiceInstance>,
    checks: HashMap<String, HealthCheck>,
    subscriptions: HashMap<String, Subscription>,
    schedule: HealthSchedule,
    aggregates: RegistryAggregates,
}

impl RegistryState {
    fn checks_for_service(&self, service_id: &str) -> Vec<String> {
        self.checks
            .values()
            .filter(|check| check.target.service_id() == service_id)
            .map(|check| check.check_id.clone())
            .collect()
    }
}

/// Service and instance registry with health checking
pub struct ServiceRegistry {
    config: DiscoveryConfig,
    state: RwLock<RegistryState>,
    topology: Arc<dyn TopologyProvider>,
    sessions: Arc<dyn SecureSessionProvider>,
    probe: Arc<dyn HealthProbe>,
}

impl ServiceRegistry {
    pub fn new(
        config: &DiscoveryConfig,
        topology: Arc<dyn TopologyProvider>,
        sessions: Arc<dyn SecureSessionProvider>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            config: config.clone(),
            state: RwLock::new(RegistryState::default()),
            topology,
            sessions,
            probe,
        }
    }

    /// Register a service and its service-level health check
    pub async fn register_service(&self, def: ServiceDefinition) -> Result<String, DiscoveryError> {
        let name = def.name.trim().to_string();
        if name.is_empty() {
            return Err(DiscoveryError::Registration(
                "Service name is required".to_string(),
            ));
        }
        let endpoint = def.endpoint.clone().ok_or_else(|| {
            DiscoveryError::Registration(format!("Service {} has no endpoint", name))
        })?;

        let mut security = def.security.clone();
        if security.secure_authentication {
            let key_pair = self.sessions.generate_service_key_pair(&name).await?;
            security.public_key = Some(key_pair.public_key);
        }

        let service_id = generate_id("svc");
        let service = Service {
            service_id: service_id.clone(),
            name: name.clone(),
            service_type: if def.service_type.is_empty() {
                "generic".to_string()
            } else {
                def.service_type.clone()
            },
            endpoint: endpoint.clone(),
            metadata: def.metadata.clone(),
            security,
            health: ServiceHealth::default(),
            load_balancing: LoadBalancingPolicy {
                strategy: def
                    .strategy
                    .unwrap_or(self.config.load_balancing.default_strategy),
                instances: Vec::new(),
                weights: HashMap::new(),
                sticky_sessions: def
                    .sticky_sessions
                    .unwrap_or(self.config.load_balancing.sticky_sessions),
            },
            registered_at: current_timestamp(),
        };

        let check = self.new_check(
            CheckTarget::Service {
                service_id: service_id.clone(),
            },
            def.health_check.unwrap_or(HealthCheckType::Http),
            endpoint,
            self.config.health.service_check_interval,
        );

        let subscriptions: Vec<Subscription> = {
            let mut state = self.state.write().await;
            state.schedule.schedule(check.check_id.clone(), Instant::now());
            state.checks.insert(check.check_id.clone(), check);
            state.services.insert(service_id.clone(), service.clone());
            state
                .subscriptions
                .values()
                .filter(|sub| service_matches(&sub.pattern, &service))
                .cloned()
                .collect()
        };

        info!("Registered service {} ({})", name, service_id);
        self.notify(subscriptions, &service).await;

        Ok(service_id)
    }

    /// Register an instance of an existing service
    pub async fn register_instance(&self, def: InstanceDefinition) -> Result<String, DiscoveryError> {
        let instance_id = generate_id("inst");
        let node_id = def
            .node_id
            .clone()
            .unwrap_or_else(|| def.endpoint.node_id.clone());

        let instance = ServiceInstance {
            instance_id: instance_id.clone(),
            service_id: def.service_id.clone(),
            node_id,
            endpoint: def.endpoint.clone(),
            status: InstanceStatus::Starting,
            health: InstanceHealth::default(),
            metrics: InstanceMetrics::default(),
            registered_at: current_timestamp(),
        };

        let check = self.new_check(
            CheckTarget::Instance {
                service_id: def.service_id.clone(),
                instance_id: instance_id.clone(),
            },
            def.health_check.unwrap_or(HealthCheckType::Http),
            def.endpoint.clone(),
            self.config.health.instance_check_interval,
        );

        let mut state = self.state.write().await;
        let service = state.services.get_mut(&def.service_id).ok_or_else(|| {
            DiscoveryError::NotFound(format!("Service not found: {}", def.service_id))
        })?;

        service.load_balancing.instances.push(instance_id.clone());
        if let Some(weight) = def.weight {
            service
                .load_balancing
                .weights
                .insert(instance_id.clone(), weight);
        }
        let service_name = service.name.clone();

        state.schedule.schedule(check.check_id.clone(), Instant::now());
        state.checks.insert(check.check_id.clone(), check);
        state.instances.insert(instance_id.clone(), instance);

        info!(
            "Registered instance {} of service {} at {}",
            instance_id, service_name, def.endpoint
        );
        Ok(instance_id)
    }

    /// Services matching `pattern` that `requester_node_id` may see
    pub async fn discover_services(
        &self,
        pattern: &str,
        requester_node_id: &str,
    ) -> Vec<Service> {
        let candidates: Vec<Service> = {
            let state = self.state.read().await;
            state
                .services
                .values()
                .filter(|service| service_matches(pattern, service))
                .cloned()
                .collect()
        };

        let requester = self.topology.node(requester_node_id).await;
        let mut visible: Vec<Service> = candidates
            .into_iter()
            .filter(|service| {
                let permitted = access_permitted(service, requester.as_ref());
                if !permitted {
                    debug!(
                        "Service {} hidden from {}: missing capabilities",
                        service.name, requester_node_id
                    );
                }
                permitted
            })
            .collect();
        visible.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));

        debug!(
            "Discovery for '{}' by {} matched {} services",
            pattern,
            requester_node_id,
            visible.len()
        );
        visible
    }

    /// Register a subscription and deliver the current matching set
    pub async fn subscribe(
        &self,
        pattern: &str,
        requester_node_id: &str,
        callback: SubscriptionCallback,
    ) -> String {
        let subscription_id = generate_id("sub");
        let subscription = Subscription {
            subscription_id: subscription_id.clone(),
            pattern: pattern.to_string(),
            requester_node_id: requester_node_id.to_string(),
            callback: callback.clone(),
            last_notified: Some(current_timestamp()),
        };

        {
            let mut state = self.state.write().await;
            state
                .subscriptions
                .insert(subscription_id.clone(), subscription);
        }

        let snapshot = self.discover_services(pattern, requester_node_id).await;
        callback(&snapshot);

        info!(
            "Subscription {} created for '{}' by {}",
            subscription_id, pattern, requester_node_id
        );
        subscription_id
    }

    /// Remove a subscription
    pub async fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut state = self.state.write().await;
        state.subscriptions.remove(subscription_id).is_some()
    }

    /// Remove a service with its instances and health checks
    ///
    /// Returns the removed instance ids, `None` when the service is unknown.
    pub async fn unregister_service(&self, service_id: &str) -> Option<Vec<String>> {
        let mut state = self.state.write().await;
        let service = state.services.remove(service_id)?;

        let mut removed = Vec::new();
        for instance_id in &service.load_balancing.instances {
            if let Some(instance) = state.instances.remove(instance_id) {
                debug!("Instance {} removed", instance.instance_id);
                removed.push(instance.instance_id);
            }
        }

        for check_id in state.checks_for_service(service_id) {
            state.checks.remove(&check_id);
        }
        let RegistryState {
            checks, schedule, ..
        } = &mut *state;
        schedule.retain(|check_id| checks.contains_key(check_id));

        info!(
            "Unregistered service {} ({}) with {} instances",
            service.name,
            service_id,
            removed.len()
        );
        Some(removed)
    }

    pub async fn get_service(&self, service_id: &str) -> Option<Service> {
        let state = self.state.read().await;
        state.services.get(service_id).cloned()
    }

    pub async fn get_service_by_name(&self, name: &str) -> Option<Service> {
        let state = self.state.read().await;
        state
            .services
            .values()
            .filter(|service| service.name.eq_ignore_ascii_case(name))
            .min_by(|a, b| a.registered_at.cmp(&b.registered_at))
            .cloned()
    }

    /// Resolve a service id or name
    pub async fn resolve_service(&self, service: &str) -> Option<Service> {
        match self.get_service(service).await {
            Some(found) => Some(found),
            None => self.get_service_by_name(service).await,
        }
    }

    /// Instances of a service in registration order
    pub async fn get_service_instances(&self, service_id: &str) -> Vec<ServiceInstance> {
        let state = self.state.read().await;
        Self::instances_of(&state, service_id)
    }

    pub async fn get_instance(&self, instance_id: &str) -> Option<ServiceInstance> {
        let state = self.state.read().await;
        state.instances.get(instance_id).cloned()
    }

    /// Service and its instances read under one lock
    pub async fn selection_snapshot(
        &self,
        service_id: &str,
    ) -> Option<(Service, Vec<ServiceInstance>)> {
        let state = self.state.read().await;
        let service = state.services.get(service_id)?.clone();
        let instances = Self::instances_of(&state, service_id);
        Some((service, instances))
    }

    /// Health checks targeting a service or its instances
    pub async fn get_health_checks(&self, service_id: &str) -> Vec<HealthCheck> {
        let state = self.state.read().await;
        state
            .checks
            .values()
            .filter(|check| check.target.service_id() == service_id)
            .cloned()
            .collect()
    }

    pub async fn service_count(&self) -> usize {
        self.state.read().await.services.len()
    }

    pub async fn subscription_count(&self) -> usize {
        self.state.read().await.subscriptions.len()
    }

    /// Count a request routed to an instance
    pub async fn record_request(&self, instance_id: &str) {
        let mut state = self.state.write().await;
        if let Some(instance) = state.instances.get_mut(instance_id) {
            instance.metrics.request_count += 1;
        }
    }

    /// Count a completed operation on an instance
    pub async fn record_completion(&self, instance_id: &str) {
        let mut state = self.state.write().await;
        if let Some(instance) = state.instances.get_mut(instance_id) {
            instance.metrics.op_count += 1;
        }
    }

    /// Run checks whose due time has passed
    pub async fn run_due_checks(&self) -> usize {
        self.run_checks(Some(Instant::now())).await
    }

    /// Run every check regardless of its schedule
    pub async fn run_all_checks(&self) -> usize {
        self.run_checks(None).await
    }

    async fn run_checks(&self, due_before: Option<Instant>) -> usize {
        let due: Vec<HealthCheck> = {
            let mut state = self.state.write().await;
            let ids = match due_before {
                Some(now) => state.schedule.pop_due(now),
                None => {
                    state.schedule = HealthSchedule::new();
                    state.checks.keys().cloned().collect()
                }
            };

            // Rescheduled before probing so a lost probe never drops its check
            let now = Instant::now();
            let mut due = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(check) = state.checks.get(&id).cloned() {
                    state.schedule.schedule(id, now + check.interval);
                    due.push(check);
                }
            }
            due
        };

        if due.is_empty() {
            return 0;
        }

        let mut probes = JoinSet::new();
        let mut in_flight: HashMap<task::Id, String> = HashMap::with_capacity(due.len());
        for check in due {
            let probe = Arc::clone(&self.probe);
            let check_id = check.check_id.clone();
            let handle = probes.spawn(async move {
                let started = std::time::Instant::now();
                match timeout(check.timeout, probe.probe(&check)).await {
                    Ok(result) => result,
                    Err(_) => ProbeResult::failure(
                        started.elapsed(),
                        format!("timed out after {:?}", check.timeout),
                    ),
                }
            });
            in_flight.insert(handle.id(), check_id);
        }

        let mut completed = 0;
        while let Some(joined) = probes.join_next_with_id().await {
            let (task_id, result) = match joined {
                Ok((task_id, result)) => (task_id, result),
                Err(e) => {
                    warn!("Health probe task failed: {}", e);
                    let detail = format!("health task aborted: {}", e);
                    (e.id(), ProbeResult::failure(Duration::ZERO, detail))
                }
            };
            if let Some(check_id) = in_flight.remove(&task_id) {
                self.apply_probe_result(&check_id, result).await;
                completed += 1;
            }
        }

        debug!("Completed {} health checks", completed);
        completed
    }

    async fn apply_probe_result(&self, check_id: &str, result: ProbeResult) {
        let mut state = self.state.write().await;
        let RegistryState {
            services,
            instances,
            checks,
            ..
        } = &mut *state;

        // Removed while the probe was in flight
        let Some(check) = checks.get_mut(check_id) else {
            return;
        };

        let latency_ms = result.latency.as_secs_f64() * 1000.0;

        if result.healthy {
            check.record_success();
        } else {
            let outcome = check.record_failure();
            warn!(
                "Health check {} failed ({}/{}): {}",
                check_id,
                check.consecutive_failures,
                check.max_failures,
                result.detail.as_deref().unwrap_or("unknown error")
            );
            if outcome == FailureOutcome::Absorbed {
                // Debounced, health and status stay as they are
                if let Some(instance_id) = check.target.instance_id() {
                    if let Some(instance) = instances.get_mut(instance_id) {
                        instance.health.consecutive_failures = check.consecutive_failures;
                        instance.health.last_check = check.last_check;
                        update_error_rate(&mut instance.metrics, false);
                    }
                }
                return;
            }
        }

        match &check.target {
            CheckTarget::Instance { instance_id, .. } => {
                if let Some(instance) = instances.get_mut(instance_id) {
                    apply_to_instance(instance, check, &result, latency_ms);
                }
            }
            CheckTarget::Service { service_id } => {
                if let Some(service) = services.get_mut(service_id) {
                    service.health.last_check = check.last_check;
                    if result.healthy {
                        service.health.response_time_ms = latency_ms;
                    }
                    if let Some(secure) = result.secure_channel {
                        service.health.secure_channel = secure;
                    }
                    // With instances, status belongs to the aggregate pass
                    if service.load_balancing.instances.is_empty() {
                        service.health.status = if result.healthy {
                            ServiceHealthStatus::Healthy
                        } else {
                            ServiceHealthStatus::Unhealthy
                        };
                    }
                }
            }
        }
    }

    /// Recompute registry-wide aggregates and per-service health
    pub async fn recompute_aggregates(&self) -> RegistryAggregates {
        let mut state = self.state.write().await;
        let RegistryState {
            services,
            instances,
            aggregates,
            ..
        } = &mut *state;

        let total_instances = instances.len();
        let healthy: Vec<&ServiceInstance> =
            instances.values().filter(|i| i.is_selectable()).collect();
        let mean_response_time_ms = mean_response_time(&healthy);

        for service in services.values_mut() {
            let members = &service.load_balancing.instances;
            if members.is_empty() {
                continue;
            }
            let up = members
                .iter()
                .filter_map(|id| instances.get(id))
                .filter(|i| i.is_selectable())
                .count();
            service.health.status = if up == members.len() {
                ServiceHealthStatus::Healthy
            } else if up > 0 {
                ServiceHealthStatus::Degraded
            } else {
                ServiceHealthStatus::Unhealthy
            };
        }

        *aggregates = RegistryAggregates {
            total_instances,
            healthy_instances: healthy.len(),
            mean_response_time_ms,
            computed_at: Some(current_timestamp()),
        };

        debug!(
            "Registry aggregates: {}/{} instances healthy",
            aggregates.healthy_instances, aggregates.total_instances
        );
        aggregates.clone()
    }

    /// Aggregates from the last aggregate pass
    pub async fn aggregates(&self) -> RegistryAggregates {
        self.state.read().await.aggregates.clone()
    }

    /// Totals over current instances, without waiting for the aggregate pass
    pub async fn live_totals(&self) -> InstanceTotals {
        let state = self.state.read().await;
        let healthy: Vec<&ServiceInstance> = state
            .instances
            .values()
            .filter(|i| i.is_selectable())
            .collect();

        InstanceTotals {
            total_instances: state.instances.len(),
            healthy_instances: healthy.len(),
            total_requests: state
                .instances
                .values()
                .map(|i| i.metrics.request_count)
                .sum(),
            mean_response_time_ms: mean_response_time(&healthy),
        }
    }

    fn new_check(
        &self,
        target: CheckTarget,
        check_type: HealthCheckType,
        endpoint: ServiceEndpoint,
        interval: Duration,
    ) -> HealthCheck {
        HealthCheck {
            check_id: generate_id("check"),
            target,
            check_type,
            endpoint,
            interval,
            timeout: self.config.health.check_timeout,
            consecutive_failures: 0,
            max_failures: self.config.health.max_failures,
            status: CheckStatus::Unknown,
            last_check: None,
        }
    }

    fn instances_of(state: &RegistryState, service_id: &str) -> Vec<ServiceInstance> {
        state
            .services
            .get(service_id)
            .map(|service| {
                service
                    .load_balancing
                    .instances
                    .iter()
                    .filter_map(|id| state.instances.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn notify(&self, subscriptions: Vec<Subscription>, service: &Service) {
        for subscription in subscriptions {
            let requester = self.topology.node(&subscription.requester_node_id).await;
            if !access_permitted(service, requester.as_ref()) {
                continue;
            }

            (subscription.callback)(std::slice::from_ref(service));

            let mut state = self.state.write().await;
            if let Some(stored) = state.subscriptions.get_mut(&subscription.subscription_id) {
                stored.last_notified = Some(current_timestamp());
            }
        }
    }
}

fn mean_response_time(instances: &[&ServiceInstance]) -> f64 {
    if instances.is_empty() {
        return 0.0;
    }
    instances
        .iter()
        .map(|i| i.metrics.response_time_ms)
        .sum::<f64>()
        / instances.len() as f64
}

fn update_error_rate(metrics: &mut InstanceMetrics, success: bool) {
    let sample = if success { 0.0 } else { 1.0 };
    metrics.error_rate = ERROR_RATE_ALPHA * sample + (1.0 - ERROR_RATE_ALPHA) * metrics.error_rate;
}

fn apply_to_instance(
    instance: &mut ServiceInstance,
    check: &HealthCheck,
    result: &ProbeResult,
    latency_ms: f64,
) {
    instance.health.consecutive_failures = check.consecutive_failures;
    instance.health.last_check = check.last_check;
    update_error_rate(&mut instance.metrics, result.healthy);

    if result.healthy {
        instance.metrics.response_time_ms = latency_ms;
        instance.health.healthy = true;
        if instance.status != InstanceStatus::Running {
            info!(
                "Instance {} is running ({:?} -> Running)",
                instance.instance_id, instance.status
            );
            instance.status = InstanceStatus::Running;
        }
    } else if instance.status != InstanceStatus::Failed {
        warn!(
            "Instance {} failed after {} consecutive failures",
            instance.instance_id, check.consecutive_failures
        );
        instance.health.healthy = false;
        instance.status = InstanceStatus::Failed;
    } else {
        instance.health.healthy = false;
    }
}
