//! Secure session negotiation
//!
//! The engine only relies on the [`SecureSessionProvider`] contract: a
//! negotiation either yields key material or reports that none could be
//! agreed. [`PresharedKeyProvider`] derives per-session keys from a node-local
//! secret with HKDF-SHA256 and a fresh random salt, rotating the key on every
//! negotiation.

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use hkdf::Hkdf;
use rand::{Rng, RngCore};
use sha2::Sha256;
use tracing::debug;

use crate::error::DiscoveryError;

/// Key pair issued to a service requiring secure authentication
pub struct ServiceKeyPair {
    pub public_key: Vec<u8>,
    pub secret_key: Vec<u8>,
}

/// Negotiates ephemeral symmetric keys between nodes
#[async_trait]
pub trait SecureSessionProvider: Send + Sync {
    /// Negotiate a key of `bit_length` bits with `peer_id`
    ///
    /// `Ok(None)` means the peer declined or no key could be agreed.
    async fn negotiate_session_key(
        &self,
        peer_id: &str,
        bit_length: u32,
    ) -> Result<Option<Vec<u8>>, DiscoveryError>;

    /// Issue a signing key pair for a service
    async fn generate_service_key_pair(
        &self,
        service_name: &str,
    ) -> Result<ServiceKeyPair, DiscoveryError>;
}

/// HKDF based session provider backed by a node-local secret
pub struct PresharedKeyProvider {
    node_id: String,
    secret: [u8; 32],
}

impl PresharedKeyProvider {
    pub fn new(node_id: impl Into<String>, secret: [u8; 32]) -> Self {
        Self {
            node_id: node_id.into(),
            secret,
        }
    }

    /// Provider with a freshly generated secret
    pub fn generate(node_id: impl Into<String>) -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill(&mut secret);
        Self::new(node_id, secret)
    }

    fn derive(&self, peer_id: &str, salt: &[u8], bit_length: u32) -> Result<Vec<u8>, DiscoveryError> {
        let length = bit_length.div_ceil(8) as usize;
        let info = format!("orasi-session:{}:{}", self.node_id, peer_id);

        let hk = Hkdf::<Sha256>::new(Some(salt), &self.secret);
        let mut key = vec![0u8; length];
        hk.expand(info.as_bytes(), &mut key).map_err(|e| {
            DiscoveryError::SecureNegotiation(format!(
                "Cannot derive {}-bit key for {}: {}",
                bit_length, peer_id, e
            ))
        })?;
        Ok(key)
    }
}

#[async_trait]
impl SecureSessionProvider for PresharedKeyProvider {
    async fn negotiate_session_key(
        &self,
        peer_id: &str,
        bit_length: u32,
    ) -> Result<Option<Vec<u8>>, DiscoveryError> {
        if peer_id.is_empty() || bit_length == 0 {
            return Ok(None);
        }

        let mut salt = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);
        let key = self.derive(peer_id, &salt, bit_length)?;

        debug!("Negotiated {}-bit session key with {}", bit_length, peer_id);
        Ok(Some(key))
    }

    async fn generate_service_key_pair(
        &self,
        service_name: &str,
    ) -> Result<ServiceKeyPair, DiscoveryError> {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill(&mut seed);

        let signing_key = SigningKey::from_bytes(&seed);
        let public_key = signing_key.verifying_key().to_bytes().to_vec();

        debug!("Issued key pair for service {}", service_name);
        Ok(ServiceKeyPair {
            public_key,
            secret_key: signing_key.to_bytes().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_negotiated_keys_have_requested_length_and_rotate() {
        let provider = PresharedKeyProvider::generate("node-1");

        let first = provider.negotiate_session_key("node-2", 256).await.unwrap().unwrap();
        let second = provider.negotiate_session_key("node-2", 256).await.unwrap().unwrap();
        assert_eq!(first.len(), 32);
        assert_ne!(first, second);

        let short = provider.negotiate_session_key("node-2", 12).await.unwrap().unwrap();
        assert_eq!(short.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_peer_yields_no_key() {
        let provider = PresharedKeyProvider::generate("node-1");
        assert!(provider.negotiate_session_key("", 256).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_service_key_pair() {
        let provider = PresharedKeyProvider::generate("node-1");
        let pair = provider.generate_service_key_pair("payments-api").await.unwrap();
        assert_eq!(pair.public_key.len(), 32);
        assert_eq!(pair.secret_key.len(), 32);
        assert_ne!(pair.public_key, pair.secret_key);
    }
}
