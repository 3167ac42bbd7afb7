//! Typed discovery events
//!
//! Listeners registered when an event is emitted each receive it once.
//! Events are not replayed to listeners registered later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::types::current_timestamp;

/// Capacity of the broadcast channel handed to channel subscribers
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event emitted by the discovery engine after a successful operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    ServiceRegistered {
        service_id: String,
        name: String,
        timestamp: DateTime<Utc>,
    },
    InstanceRegistered {
        service_id: String,
        instance_id: String,
        timestamp: DateTime<Utc>,
    },
    ServicesDiscovered {
        pattern: String,
        requester_node_id: String,
        count: usize,
        timestamp: DateTime<Utc>,
    },
    SubscriptionCreated {
        subscription_id: String,
        pattern: String,
        timestamp: DateTime<Utc>,
    },
    ServiceBound {
        binding_id: String,
        service_id: String,
        instance_id: String,
        secured: bool,
        timestamp: DateTime<Utc>,
    },
    BindingReleased {
        binding_id: String,
        timestamp: DateTime<Utc>,
    },
    ServiceUnregistered {
        service_id: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl DiscoveryEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: current_timestamp(),
        }
    }

    /// Wire name of the event type
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ServiceRegistered { .. } => "service_registered",
            Self::InstanceRegistered { .. } => "instance_registered",
            Self::ServicesDiscovered { .. } => "services_discovered",
            Self::SubscriptionCreated { .. } => "subscription_created",
            Self::ServiceBound { .. } => "service_bound",
            Self::BindingReleased { .. } => "binding_released",
            Self::ServiceUnregistered { .. } => "service_unregistered",
            Self::Error { .. } => "error",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::ServiceRegistered { timestamp, .. }
            | Self::InstanceRegistered { timestamp, .. }
            | Self::ServicesDiscovered { timestamp, .. }
            | Self::SubscriptionCreated { timestamp, .. }
            | Self::ServiceBound { timestamp, .. }
            | Self::BindingReleased { timestamp, .. }
            | Self::ServiceUnregistered { timestamp, .. }
            | Self::Error { timestamp, .. } => *timestamp,
        }
    }
}

/// Event listener callback
pub type EventListener = Arc<dyn Fn(&DiscoveryEvent) + Send + Sync>;

struct BusInner {
    next_id: AtomicU64,
    listeners: RwLock<BTreeMap<u64, EventListener>>,
    channel: broadcast::Sender<DiscoveryEvent>,
}

/// Publish/subscribe hub for [`DiscoveryEvent`]s
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (channel, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                listeners: RwLock::new(BTreeMap::new()),
                channel,
            }),
        }
    }

    /// Register a listener, returning the handle that removes it
    pub async fn subscribe(&self, listener: EventListener) -> ListenerHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.write().await.insert(id, listener);
        ListenerHandle {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Receive events through a channel instead of a callback
    ///
    /// A receiver that falls more than the channel capacity behind gets
    /// `RecvError::Lagged` and skips the oldest events.
    pub fn subscribe_channel(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.inner.channel.subscribe()
    }

    /// Deliver an event to every current listener, in registration order
    pub async fn emit(&self, event: DiscoveryEvent) {
        let listeners: Vec<EventListener> =
            self.inner.listeners.read().await.values().cloned().collect();

        debug!(
            "Emitting {} to {} listeners",
            event.kind(),
            listeners.len()
        );
        for listener in &listeners {
            listener(&event);
        }
        // No receivers is not an error
        let _ = self.inner.channel.send(event);
    }

    pub async fn listener_count(&self) -> usize {
        self.inner.listeners.read().await.len()
    }
}

/// Registration of a listener on an [`EventBus`]
#[derive(Debug)]
pub struct ListenerHandle {
    id: u64,
    bus: Weak<BusInner>,
}

impl ListenerHandle {
    /// Remove the listener; returns false if it was already gone
    pub async fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.listeners.write().await.remove(&self.id).is_some(),
            None => false,
        }
    }
}
