//! Instance selection and service bindings

pub mod core;
pub mod strategy;

pub use self::core::LoadBalancer;
pub use strategy::{optimized_score, select, SelectionContext};
