//! Health probes
//!
//! Success criteria per check type:
//!
//! - `HTTP`: `GET {scheme}://{address}:{port}{path}` answers with a 2xx status.
//! - `TCP`: a TCP connection to `{address}:{port}` is established.
//! - `SECURE_CHANNEL`: the topology knows the endpoint's node, the node carries
//!   the `secure_channel` capability and its channel quality reaches the
//!   configured threshold.
//! - `SECURE_HANDSHAKE`: a session key negotiated with the endpoint's node is
//!   non-empty.
//!
//! Every probe is bounded by the check's timeout; running out of time is a
//! failure like any other.

use async_trait::async_trait;
use reqwest::{Client, Url};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::{DiscoveryConfig, HealthConfig};
use crate::error::DiscoveryError;
use crate::providers::{SecureSessionProvider, TopologyProvider, CAPABILITY_SECURE_CHANNEL};
use crate::types::{HealthCheck, HealthCheckType, ServiceEndpoint};

/// Outcome of a single probe
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub healthy: bool,

    /// Time spent probing
    pub latency: Duration,

    /// Secure channel state, for probes that establish one
    pub secure_channel: Option<bool>,

    /// Failure description
    pub detail: Option<String>,
}

impl ProbeResult {
    pub fn success(latency: Duration) -> Self {
        Self {
            healthy: true,
            latency,
            secure_channel: None,
            detail: None,
        }
    }

    pub fn failure(latency: Duration, detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency,
            secure_channel: None,
            detail: Some(detail.into()),
        }
    }

    fn with_secure_channel(mut self, secure: bool) -> Self {
        self.secure_channel = Some(secure);
        self
    }
}

/// Executes the probe behind a health check
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, check: &HealthCheck) -> ProbeResult;
}

/// Probe talking to real endpoints
pub struct NetworkProbe {
    http_client: Client,
    topology: Arc<dyn TopologyProvider>,
    sessions: Arc<dyn SecureSessionProvider>,
    http_path: String,
    secure_channel_threshold: f64,
    session_key_bits: u32,
}

impl NetworkProbe {
    pub fn new(
        config: &DiscoveryConfig,
        topology: Arc<dyn TopologyProvider>,
        sessions: Arc<dyn SecureSessionProvider>,
    ) -> Result<Self, DiscoveryError> {
        let HealthConfig {
            check_timeout,
            http_path,
            secure_channel_threshold,
            ..
        } = &config.health;

        let http_client = Client::builder().timeout(*check_timeout).build()?;

        Ok(Self {
            http_client,
            topology,
            sessions,
            http_path: http_path.clone(),
            secure_channel_threshold: *secure_channel_threshold,
            session_key_bits: config.load_balancing.session_key_bits,
        })
    }

    fn health_url(&self, endpoint: &ServiceEndpoint) -> Result<Url, String> {
        let scheme = if endpoint.secured { "https" } else { "http" };
        let host = match endpoint.address.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{}]", ip),
            _ => endpoint.address.clone(),
        };

        let raw = format!("{}://{}:{}{}", scheme, host, endpoint.port, self.http_path);
        Url::parse(&raw).map_err(|e| format!("invalid health url {}: {}", raw, e))
    }

    async fn probe_http(&self, check: &HealthCheck) -> Result<(), String> {
        let url = self.health_url(&check.endpoint)?;

        let response = self
            .http_client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| format!("request to {} failed: {}", url, e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("{} answered {}", url, response.status()))
        }
    }

    async fn probe_tcp(&self, check: &HealthCheck) -> Result<(), String> {
        TcpStream::connect((check.endpoint.address.as_str(), check.endpoint.port))
            .await
            .map(|_| ())
            .map_err(|e| format!("connect to {} failed: {}", check.endpoint, e))
    }

    async fn probe_secure_channel(&self, check: &HealthCheck) -> Result<(), String> {
        let node_id = &check.endpoint.node_id;
        let node = self
            .topology
            .node(node_id)
            .await
            .ok_or_else(|| format!("node {} is not in the topology", node_id))?;

        if !node.has_capability(CAPABILITY_SECURE_CHANNEL) {
            return Err(format!("node {} has no secure channel", node_id));
        }
        if node.channel_quality < self.secure_channel_threshold {
            return Err(format!(
                "node {} channel quality {:.2} below {:.2}",
                node_id, node.channel_quality, self.secure_channel_threshold
            ));
        }
        Ok(())
    }

    async fn probe_secure_handshake(&self, check: &HealthCheck) -> Result<(), String> {
        let node_id = &check.endpoint.node_id;
        match self
            .sessions
            .negotiate_session_key(node_id, self.session_key_bits)
            .await
        {
            Ok(Some(key)) if !key.is_empty() => Ok(()),
            Ok(_) => Err(format!("handshake with {} produced no key", node_id)),
            Err(e) => Err(format!("handshake with {} failed: {}", node_id, e)),
        }
    }
}

#[async_trait]
impl HealthProbe for NetworkProbe {
    async fn probe(&self, check: &HealthCheck) -> ProbeResult {
        let started = Instant::now();

        let attempt = async {
            match check.check_type {
                HealthCheckType::Http => self.probe_http(check).await,
                HealthCheckType::Tcp => self.probe_tcp(check).await,
                HealthCheckType::SecureChannel => self.probe_secure_channel(check).await,
                HealthCheckType::SecureHandshake => self.probe_secure_handshake(check).await,
            }
        };

        let outcome = match timeout(check.timeout, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => Err(format!("timed out after {:?}", check.timeout)),
        };

        let latency = started.elapsed();
        let secure = matches!(
            check.check_type,
            HealthCheckType::SecureChannel | HealthCheckType::SecureHandshake
        );

        let result = match outcome {
            Ok(()) => {
                debug!("Probe {} passed in {:?}", check.check_id, latency);
                ProbeResult::success(latency)
            }
            Err(detail) => ProbeResult::failure(latency, detail),
        };

        if secure {
            let healthy = result.healthy;
            result.with_secure_channel(healthy)
        } else {
            result
        }
    }
}
