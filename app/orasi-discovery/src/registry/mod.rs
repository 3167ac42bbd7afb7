//! Service registry and health checking

pub mod core;
pub mod monitor;
pub mod pattern;
pub mod probe;
pub mod schedule;

pub use self::core::{InstanceTotals, ServiceRegistry, Subscription, SubscriptionCallback};
pub use monitor::HealthMonitor;
pub use probe::{HealthProbe, NetworkProbe, ProbeResult};
