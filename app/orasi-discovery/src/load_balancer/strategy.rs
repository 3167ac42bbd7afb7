//! Instance selection strategies
//!
//! Every strategy is a pure function of the instance list and a
//! [`SelectionContext`]. Instances that are not running and healthy are
//! filtered out before any strategy sees them.

use std::collections::HashMap;

use crate::providers::{NodeInfo, CAPABILITY_READY};
use crate::types::{SelectionStrategy, ServiceInstance};

/// Weight of the ready-capability bonus in the optimized score
pub const OPTIMIZED_READY_WEIGHT: f64 = 0.30;
/// Weight of the channel quality term
pub const OPTIMIZED_QUALITY_WEIGHT: f64 = 0.30;
/// Weight of the inverse response time term
pub const OPTIMIZED_LATENCY_WEIGHT: f64 = 0.30;
/// Weight of the throughput bonus
pub const OPTIMIZED_THROUGHPUT_WEIGHT: f64 = 0.10;
/// Response time at which the latency term halves
const LATENCY_HALF_MS: f64 = 100.0;
/// Operation count at which the throughput bonus saturates
const THROUGHPUT_SATURATION: f64 = 1000.0;

/// Inputs a strategy may consult besides the instances
#[derive(Debug, Default)]
pub struct SelectionContext<'a> {
    /// Per-service sequence number for round robin strategies
    pub sequence: usize,

    /// Random value for the random strategy
    pub entropy: u64,

    /// Open connections per instance id
    pub connections: Option<&'a HashMap<String, usize>>,

    /// Weights per instance id
    pub weights: Option<&'a HashMap<String, u32>>,

    /// Topology view of instance nodes, keyed by node id
    pub nodes: Option<&'a HashMap<String, NodeInfo>>,
}

impl SelectionContext<'_> {
    fn connections_of(&self, instance: &ServiceInstance) -> usize {
        self.connections
            .and_then(|c| c.get(&instance.instance_id))
            .copied()
            .unwrap_or(0)
    }

    fn weight_of(&self, instance: &ServiceInstance) -> u32 {
        self.weights
            .and_then(|w| w.get(&instance.instance_id))
            .copied()
            .unwrap_or(1)
    }

    fn node_of(&self, instance: &ServiceInstance) -> Option<&NodeInfo> {
        self.nodes.and_then(|n| n.get(&instance.node_id))
    }
}

/// Pick an instance with the named strategy
pub fn select<'i>(
    strategy: SelectionStrategy,
    instances: &'i [ServiceInstance],
    ctx: &SelectionContext<'_>,
) -> Option<&'i ServiceInstance> {
    let healthy: Vec<&ServiceInstance> = instances.iter().filter(|i| i.is_selectable()).collect();
    if healthy.is_empty() {
        return None;
    }

    match strategy {
        SelectionStrategy::RoundRobin => round_robin(&healthy, ctx),
        SelectionStrategy::LeastConnections => least_connections(&healthy, ctx),
        SelectionStrategy::LeastResponseTime => least_response_time(&healthy),
        SelectionStrategy::Optimized => optimized(&healthy, ctx),
        SelectionStrategy::WeightedRoundRobin => weighted_round_robin(&healthy, ctx),
        SelectionStrategy::Random => random(&healthy, ctx),
    }
}

fn round_robin<'i>(
    healthy: &[&'i ServiceInstance],
    ctx: &SelectionContext<'_>,
) -> Option<&'i ServiceInstance> {
    Some(healthy[ctx.sequence % healthy.len()])
}

fn least_connections<'i>(
    healthy: &[&'i ServiceInstance],
    ctx: &SelectionContext<'_>,
) -> Option<&'i ServiceInstance> {
    healthy
        .iter()
        .copied()
        .min_by_key(|instance| ctx.connections_of(instance))
}

fn least_response_time<'i>(healthy: &[&'i ServiceInstance]) -> Option<&'i ServiceInstance> {
    healthy.iter().copied().min_by(|a, b| {
        a.metrics
            .response_time_ms
            .total_cmp(&b.metrics.response_time_ms)
    })
}

fn weighted_round_robin<'i>(
    healthy: &[&'i ServiceInstance],
    ctx: &SelectionContext<'_>,
) -> Option<&'i ServiceInstance> {
    let total_weight: u64 = healthy.iter().map(|i| ctx.weight_of(i) as u64).sum();
    if total_weight == 0 {
        return round_robin(healthy, ctx);
    }

    let target = (ctx.sequence as u64) % total_weight;
    let mut cumulative = 0u64;
    for &instance in healthy {
        cumulative += ctx.weight_of(instance) as u64;
        if target < cumulative {
            return Some(instance);
        }
    }
    healthy.last().copied()
}

fn random<'i>(
    healthy: &[&'i ServiceInstance],
    ctx: &SelectionContext<'_>,
) -> Option<&'i ServiceInstance> {
    Some(healthy[(ctx.entropy % healthy.len() as u64) as usize])
}

fn optimized<'i>(
    healthy: &[&'i ServiceInstance],
    ctx: &SelectionContext<'_>,
) -> Option<&'i ServiceInstance> {
    let mut best: Option<(&'i ServiceInstance, f64)> = None;
    for &instance in healthy {
        let score = optimized_score(instance, ctx.node_of(instance));
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((instance, score)),
        }
    }
    best.map(|(instance, _)| instance)
}

/// Composite score used by the optimized strategy, higher is better
pub fn optimized_score(instance: &ServiceInstance, node: Option<&NodeInfo>) -> f64 {
    let ready = node.is_some_and(|n| n.has_capability(CAPABILITY_READY));
    let quality = node.map(|n| n.channel_quality.clamp(0.0, 1.0)).unwrap_or(0.0);
    let latency = 1.0 / (1.0 + instance.metrics.response_time_ms.max(0.0) / LATENCY_HALF_MS);
    let throughput = (instance.metrics.op_count as f64 / THROUGHPUT_SATURATION).min(1.0);

    (if ready { OPTIMIZED_READY_WEIGHT } else { 0.0 })
        + OPTIMIZED_QUALITY_WEIGHT * quality
        + OPTIMIZED_LATENCY_WEIGHT * latency
        + OPTIMIZED_THROUGHPUT_WEIGHT * throughput
}
