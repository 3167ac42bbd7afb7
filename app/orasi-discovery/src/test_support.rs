//! Helpers shared by unit tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::registry::{HealthProbe, ProbeResult};
use crate::types::{HealthCheck, ServiceEndpoint};

/// Probe answering from a per-endpoint script, healthy by default
pub struct ScriptedProbe {
    default_healthy: bool,
    outcomes: Mutex<HashMap<String, bool>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn healthy() -> Self {
        Self {
            default_healthy: true,
            outcomes: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, endpoint: &ServiceEndpoint, healthy: bool) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), healthy);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, check: &HealthCheck) -> ProbeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let healthy = self
            .outcomes
            .lock()
            .unwrap()
            .get(&check.endpoint.to_string())
            .copied()
            .unwrap_or(self.default_healthy);

        if healthy {
            ProbeResult::success(Duration::from_millis(5))
        } else {
            ProbeResult::failure(Duration::from_millis(5), "scripted failure")
        }
    }
}
