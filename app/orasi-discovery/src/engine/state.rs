//! Engine lifecycle state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::current_timestamp;

/// Lifecycle status of the discovery engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineStatus {
    /// Constructed, bootstrap not yet complete
    Uninitialized,
    /// Serving calls
    Ready,
    /// Bootstrap failed, the engine must be rebuilt
    Failed,
    /// Shut down
    Stopped,
}

/// Engine lifecycle record
#[derive(Debug, Clone)]
pub struct EngineState {
    status: EngineStatus,
    changed_at: DateTime<Utc>,
    failure: Option<String>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            status: EngineStatus::Uninitialized,
            changed_at: current_timestamp(),
            failure: None,
        }
    }
}

impl EngineState {
    pub fn status(&self) -> EngineStatus {
        self.status
    }

    pub fn changed_at(&self) -> DateTime<Utc> {
        self.changed_at
    }

    /// Bootstrap failure that left the engine unusable
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        self.status == EngineStatus::Ready
    }

    pub fn set_status(&mut self, status: EngineStatus) {
        self.status = status;
        self.changed_at = current_timestamp();
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.failure = Some(reason.into());
        self.set_status(EngineStatus::Failed);
    }
}
