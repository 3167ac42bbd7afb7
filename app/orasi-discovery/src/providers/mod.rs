//! External collaborators consumed by the discovery engine

pub mod session;
pub mod topology;

pub use session::{PresharedKeyProvider, SecureSessionProvider, ServiceKeyPair};
pub use topology::{
    NodeInfo, StaticTopology, TopologyProvider, CAPABILITY_READY, CAPABILITY_SECURE_CHANNEL,
};
