//! Configuration for Orasi Discovery

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::DiscoveryError;
use crate::types::{SelectionStrategy, ServiceDefinition};

/// Configuration for the discovery engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Local node id override, the topology provider's id otherwise
    #[serde(default)]
    pub node_id: Option<String>,

    /// Health checking settings
    #[serde(default)]
    pub health: HealthConfig,

    /// Load balancing settings
    #[serde(default)]
    pub load_balancing: LoadBalancingConfig,

    /// Services registered during initialization
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Run the background monitor
    pub enabled: bool,

    /// Scheduler tick granularity
    pub tick_interval: Duration,

    /// Registry aggregate recomputation interval
    pub aggregate_interval: Duration,

    /// Interval of service-level checks
    pub service_check_interval: Duration,

    /// Interval of instance-level checks
    pub instance_check_interval: Duration,

    /// Probe timeout
    pub check_timeout: Duration,

    /// Consecutive failures before a target is declared unhealthy
    pub max_failures: u32,

    /// Path requested by HTTP probes
    pub http_path: String,

    /// Minimum channel quality for secure channel probes
    pub secure_channel_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval: Duration::from_secs(5),
            aggregate_interval: Duration::from_secs(30),
            service_check_interval: Duration::from_secs(30),
            instance_check_interval: Duration::from_secs(10),
            check_timeout: Duration::from_secs(5),
            max_failures: 3,
            http_path: "/health".to_string(),
            secure_channel_threshold: 0.7,
        }
    }
}

/// Load balancing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancingConfig {
    /// Strategy of services that do not name one
    pub default_strategy: SelectionStrategy,

    /// Lifetime of a service binding
    pub binding_ttl: Duration,

    /// Length of negotiated session keys
    pub session_key_bits: u32,

    /// Upper bound on a secure session negotiation
    pub negotiation_timeout: Duration,

    /// Sticky sessions for services that do not say otherwise
    pub sticky_sessions: bool,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            default_strategy: SelectionStrategy::RoundRobin,
            binding_ttl: Duration::from_secs(3600),
            session_key_bits: 256,
            negotiation_timeout: Duration::from_secs(5),
            sticky_sessions: false,
        }
    }
}

/// Bootstrap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Register the bootstrap services on initialization
    pub enabled: bool,

    /// Extra services registered after the built-in ones
    pub services: Vec<ServiceDefinition>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            services: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    /// Configuration without bootstrap services or background monitoring
    pub fn minimal() -> Self {
        let mut config = Self::default();
        config.bootstrap.enabled = false;
        config.health.enabled = false;
        config
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DiscoveryError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DiscoveryError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: DiscoveryConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables over defaults
    pub fn from_env() -> Result<Self, DiscoveryError> {
        let mut config = Self::default();

        if let Ok(node_id) = std::env::var("DISCOVERY_NODE_ID") {
            config.node_id = Some(node_id);
        }
        if let Some(secs) = env_u64("DISCOVERY_TICK_SECS")? {
            config.health.tick_interval = Duration::from_secs(secs);
        }
        if let Some(max_failures) = env_u32("DISCOVERY_MAX_FAILURES")? {
            config.health.max_failures = max_failures;
        }
        if let Some(secs) = env_u64("DISCOVERY_BINDING_TTL_SECS")? {
            config.load_balancing.binding_ttl = Duration::from_secs(secs);
        }
        if let Ok(strategy) = std::env::var("DISCOVERY_STRATEGY") {
            config.load_balancing.default_strategy = strategy.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `DISCOVERY_CONFIG`, then the environment
    pub fn load() -> Result<Self, DiscoveryError> {
        if let Ok(path) = std::env::var("DISCOVERY_CONFIG") {
            return Self::from_file(path);
        }
        Self::from_env()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if self.health.tick_interval.is_zero() {
            return Err(DiscoveryError::Configuration(
                "health.tick_interval must be greater than zero".to_string(),
            ));
        }
        if self.health.max_failures == 0 {
            return Err(DiscoveryError::Configuration(
                "health.max_failures must be at least 1".to_string(),
            ));
        }
        if self.load_balancing.binding_ttl.is_zero() {
            return Err(DiscoveryError::Configuration(
                "load_balancing.binding_ttl must be greater than zero".to_string(),
            ));
        }
        if self.load_balancing.session_key_bits == 0 {
            return Err(DiscoveryError::Configuration(
                "load_balancing.session_key_bits must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_u64(name: &str) -> Result<Option<u64>, DiscoveryError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|e| DiscoveryError::Configuration(format!("Invalid {}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

fn env_u32(name: &str) -> Result<Option<u32>, DiscoveryError> {
    env_u64(name)?
        .map(|value| {
            u32::try_from(value).map_err(|_| {
                DiscoveryError::Configuration(format!("{} out of range: {}", name, value))
            })
        })
        .transpose()
}
