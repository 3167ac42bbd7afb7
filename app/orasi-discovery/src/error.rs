//! Error types for Orasi Discovery

use thiserror::Error;

/// Error type for discovery operations
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Registration error: {0}")]
    Registration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Discovery engine is not initialized")]
    NotInitialized,

    #[error("Bootstrap error: {0}")]
    Bootstrap(String),

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("Secure negotiation error: {0}")]
    SecureNegotiation(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DiscoveryError {
    /// Whether this error means the engine cannot serve calls
    pub fn is_not_initialized(&self) -> bool {
        matches!(self, DiscoveryError::NotInitialized)
    }
}

impl From<std::io::Error> for DiscoveryError {
    fn from(err: std::io::Error) -> Self {
        DiscoveryError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(err: serde_json::Error) -> Self {
        DiscoveryError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for DiscoveryError {
    fn from(err: toml::de::Error) -> Self {
        DiscoveryError::Configuration(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for DiscoveryError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        DiscoveryError::Timeout(err.to_string())
    }
}

impl From<reqwest::Error> for DiscoveryError {
    fn from(err: reqwest::Error) -> Self {
        DiscoveryError::Probe(err.to_string())
    }
}
