//! Types for Orasi Discovery

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::DiscoveryError;

/// Network endpoint of a service or instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceEndpoint {
    /// Node hosting the endpoint
    pub node_id: String,

    /// Host name or IP address
    pub address: String,

    /// Port
    pub port: u16,

    /// Whether the endpoint only accepts secured connections
    #[serde(default)]
    pub secured: bool,
}

impl ServiceEndpoint {
    pub fn new(node_id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
            port,
            secured: false,
        }
    }

    pub fn secured(mut self) -> Self {
        self.secured = true;
        self
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Descriptive service metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceMetadata {
    /// Service version
    #[serde(default)]
    pub version: String,

    /// Free-form tags, matched by discovery patterns
    #[serde(default)]
    pub tags: Vec<String>,

    /// Capability flags a requesting node must carry
    #[serde(default)]
    pub capability_requirements: Vec<String>,
}

/// Security requirements of a service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// Required authentication level
    #[serde(default)]
    pub required_auth_level: u8,

    /// Whether clients must authenticate over a secure session
    #[serde(default)]
    pub secure_authentication: bool,

    /// Whether traffic must be encrypted
    #[serde(default)]
    pub encryption_required: bool,

    /// Public half of the service key pair, set on registration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<Vec<u8>>,
}

/// Aggregate service health status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceHealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Service health summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: ServiceHealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub response_time_ms: f64,
    pub secure_channel: bool,
}

impl Default for ServiceHealth {
    fn default() -> Self {
        Self {
            status: ServiceHealthStatus::Unknown,
            last_check: None,
            response_time_ms: 0.0,
            secure_channel: false,
        }
    }
}

/// Instance selection strategies
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectionStrategy {
    RoundRobin,
    LeastConnections,
    LeastResponseTime,
    Optimized,
    WeightedRoundRobin,
    Random,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::RoundRobin => "ROUND_ROBIN",
            SelectionStrategy::LeastConnections => "LEAST_CONNECTIONS",
            SelectionStrategy::LeastResponseTime => "LEAST_RESPONSE_TIME",
            SelectionStrategy::Optimized => "OPTIMIZED",
            SelectionStrategy::WeightedRoundRobin => "WEIGHTED_ROUND_ROBIN",
            SelectionStrategy::Random => "RANDOM",
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionStrategy {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        match normalized.as_str() {
            "ROUND_ROBIN" => Ok(SelectionStrategy::RoundRobin),
            "LEAST_CONNECTIONS" => Ok(SelectionStrategy::LeastConnections),
            "LEAST_RESPONSE_TIME" => Ok(SelectionStrategy::LeastResponseTime),
            "OPTIMIZED" => Ok(SelectionStrategy::Optimized),
            "WEIGHTED_ROUND_ROBIN" => Ok(SelectionStrategy::WeightedRoundRobin),
            "RANDOM" => Ok(SelectionStrategy::Random),
            _ => Err(DiscoveryError::Configuration(format!(
                "Unknown selection strategy: {}",
                s
            ))),
        }
    }
}

/// Load balancing settings of a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancingPolicy {
    /// Strategy used when the caller does not name one
    pub strategy: SelectionStrategy,

    /// Instance ids in registration order
    pub instances: Vec<String>,

    /// Optional per-instance weights
    #[serde(default)]
    pub weights: HashMap<String, u32>,

    /// Whether clients stick to the instance they were first given
    #[serde(default)]
    pub sticky_sessions: bool,
}

/// Registered service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub service_id: String,
    pub name: String,
    pub service_type: String,
    pub endpoint: ServiceEndpoint,
    pub metadata: ServiceMetadata,
    pub security: SecurityPolicy,
    pub health: ServiceHealth,
    pub load_balancing: LoadBalancingPolicy,
    pub registered_at: DateTime<Utc>,
}

/// Definition submitted to register a service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceDefinition {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub service_type: String,

    #[serde(default)]
    pub endpoint: Option<ServiceEndpoint>,

    #[serde(default)]
    pub metadata: ServiceMetadata,

    #[serde(default)]
    pub security: SecurityPolicy,

    /// Strategy override, the configured default applies otherwise
    #[serde(default)]
    pub strategy: Option<SelectionStrategy>,

    /// Sticky sessions override
    #[serde(default)]
    pub sticky_sessions: Option<bool>,

    /// Service-level check type, HTTP when absent
    #[serde(default)]
    pub health_check: Option<HealthCheckType>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>, endpoint: ServiceEndpoint) -> Self {
        Self {
            name: name.into(),
            service_type: "generic".to_string(),
            endpoint: Some(endpoint),
            ..Default::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_requirements<I, S>(mut self, requirements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata.capability_requirements = requirements.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_sticky_sessions(mut self, sticky: bool) -> Self {
        self.sticky_sessions = Some(sticky);
        self
    }

    pub fn with_secure_authentication(mut self) -> Self {
        self.security.secure_authentication = true;
        self
    }

    pub fn with_health_check(mut self, check_type: HealthCheckType) -> Self {
        self.health_check = Some(check_type);
        self
    }
}

/// Instance lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Starting,
    Running,
    Failed,
    Stopped,
}

/// Instance health as observed by its health check
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceHealth {
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Instance traffic metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceMetrics {
    pub request_count: u64,
    pub response_time_ms: f64,
    pub error_rate: f64,
    pub op_count: u64,
}

/// One running deployment of a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub instance_id: String,
    pub service_id: String,
    pub node_id: String,
    pub endpoint: ServiceEndpoint,
    pub status: InstanceStatus,
    pub health: InstanceHealth,
    pub metrics: InstanceMetrics,
    pub registered_at: DateTime<Utc>,
}

impl ServiceInstance {
    /// Only running, healthy instances may receive traffic
    pub fn is_selectable(&self) -> bool {
        self.status == InstanceStatus::Running && self.health.healthy
    }
}

/// Definition submitted to register an instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDefinition {
    pub service_id: String,

    /// Hosting node, the endpoint's node when absent
    #[serde(default)]
    pub node_id: Option<String>,

    pub endpoint: ServiceEndpoint,

    #[serde(default)]
    pub health_check: Option<HealthCheckType>,

    /// Weight for weighted round robin
    #[serde(default)]
    pub weight: Option<u32>,
}

impl InstanceDefinition {
    pub fn new(service_id: impl Into<String>, endpoint: ServiceEndpoint) -> Self {
        Self {
            service_id: service_id.into(),
            node_id: None,
            endpoint,
            health_check: None,
            weight: None,
        }
    }

    pub fn with_health_check(mut self, check_type: HealthCheckType) -> Self {
        self.health_check = Some(check_type);
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }
}

/// Probe kinds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthCheckType {
    Http,
    Tcp,
    SecureChannel,
    SecureHandshake,
}

/// Health check status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// What a health check probes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CheckTarget {
    Service { service_id: String },
    Instance { service_id: String, instance_id: String },
}

impl CheckTarget {
    pub fn service_id(&self) -> &str {
        match self {
            CheckTarget::Service { service_id } => service_id,
            CheckTarget::Instance { service_id, .. } => service_id,
        }
    }

    pub fn instance_id(&self) -> Option<&str> {
        match self {
            CheckTarget::Service { .. } => None,
            CheckTarget::Instance { instance_id, .. } => Some(instance_id),
        }
    }
}

/// What a failed probe did to its check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Still under the threshold
    Absorbed,
    /// Threshold reached on this probe
    Tripped,
    /// Already unhealthy
    StillUnhealthy,
}

/// Periodic probe of a service or instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub check_id: String,
    pub target: CheckTarget,
    pub check_type: HealthCheckType,
    pub endpoint: ServiceEndpoint,
    pub interval: Duration,
    pub timeout: Duration,
    pub consecutive_failures: u32,
    pub max_failures: u32,
    pub status: CheckStatus,
    pub last_check: Option<DateTime<Utc>>,
}

impl HealthCheck {
    /// Reset the failure counter
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.status = CheckStatus::Healthy;
        self.last_check = Some(current_timestamp());
    }

    /// Count a failure, flipping to unhealthy only at `max_failures`
    pub fn record_failure(&mut self) -> FailureOutcome {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_check = Some(current_timestamp());

        if self.consecutive_failures < self.max_failures {
            FailureOutcome::Absorbed
        } else if self.status == CheckStatus::Unhealthy {
            FailureOutcome::StillUnhealthy
        } else {
            self.status = CheckStatus::Unhealthy;
            FailureOutcome::Tripped
        }
    }
}

/// Time-limited grant of a client to an instance
#[derive(Clone, Serialize, Deserialize)]
pub struct ServiceBinding {
    pub binding_id: String,
    pub service_id: String,
    pub instance_id: String,
    pub client_node_id: String,
    #[serde(skip_serializing)]
    pub session_key: Vec<u8>,
    pub binding_time: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub secured: bool,
}

impl ServiceBinding {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp())
    }
}

impl fmt::Debug for ServiceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBinding")
            .field("binding_id", &self.binding_id)
            .field("service_id", &self.service_id)
            .field("instance_id", &self.instance_id)
            .field("client_node_id", &self.client_node_id)
            .field("session_key", &format_args!("<{} bytes>", self.session_key.len()))
            .field("binding_time", &self.binding_time)
            .field("expires_at", &self.expires_at)
            .field("secured", &self.secured)
            .finish()
    }
}

/// Registry-wide aggregates recomputed by the aggregate pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryAggregates {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub mean_response_time_ms: f64,
    pub computed_at: Option<DateTime<Utc>>,
}

/// Snapshot returned by `get_discovery_statistics`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryStatistics {
    pub total_services: usize,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub total_requests: u64,
    pub mean_response_time_ms: f64,
    pub active_bindings: usize,
    pub active_affinities: usize,
    pub active_subscriptions: usize,
    pub connection_distribution: HashMap<String, usize>,
}

/// Utility functions
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

pub fn generate_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}
