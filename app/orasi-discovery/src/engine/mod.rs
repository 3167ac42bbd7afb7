//! Discovery engine facade, event stream and lifecycle

pub mod core;
pub mod events;
pub mod state;

pub use self::core::{DiscoveryEngine, HEALTH_MONITOR_SERVICE_NAME, REGISTRY_SERVICE_NAME};
pub use events::{DiscoveryEvent, EventBus, EventListener, ListenerHandle};
pub use state::{EngineState, EngineStatus};
