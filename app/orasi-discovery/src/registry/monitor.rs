//! Background health monitor

use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::error::DiscoveryError;
use crate::registry::ServiceRegistry;

/// Drives the registry's health checks and aggregate pass on a timer
pub struct HealthMonitor {
    config: HealthConfig,
    registry: Arc<ServiceRegistry>,
    task_handle: RwLock<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl HealthMonitor {
    pub fn new(config: &HealthConfig, registry: Arc<ServiceRegistry>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config: config.clone(),
            registry,
            task_handle: RwLock::new(None),
            shutdown_tx,
        }
    }

    /// Start the monitor loop
    pub async fn start(&self) -> Result<(), DiscoveryError> {
        let mut task_handle = self.task_handle.write().await;
        if task_handle.is_some() {
            warn!("Health monitor is already running");
            return Ok(());
        }

        self.shutdown_tx.send_replace(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let registry = Arc::clone(&self.registry);
        let tick_interval = self.config.tick_interval;
        let aggregate_interval = self.config.aggregate_interval;

        let handle = tokio::spawn(async move {
            let mut tick = interval(tick_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut aggregate = interval(aggregate_interval);
            aggregate.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                "Health monitor started with tick {:?}, aggregates every {:?}",
                tick_interval, aggregate_interval
            );

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let completed = registry.run_due_checks().await;
                        if completed > 0 {
                            debug!("Health tick ran {} checks", completed);
                        }
                    }
                    _ = aggregate.tick() => {
                        registry.recompute_aggregates().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("Health monitor shutdown requested");
                            break;
                        }
                    }
                }
            }

            info!("Health monitor stopped");
        });

        *task_handle = Some(handle);
        Ok(())
    }

    /// Stop the monitor loop
    pub async fn stop(&self) -> Result<(), DiscoveryError> {
        self.shutdown_tx.send_replace(true);

        let handle = self.task_handle.write().await.take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(_) => info!("Health monitor stopped gracefully"),
                Err(_) => {
                    warn!("Health monitor did not stop within timeout, aborting");
                    abort.abort();
                }
            }
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.task_handle.read().await.is_some()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Ok(task_handle) = self.task_handle.try_read() {
            if let Some(handle) = task_handle.as_ref() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use crate::providers::{NodeInfo, PresharedKeyProvider, StaticTopology};
    use crate::test_support::ScriptedProbe;
    use crate::types::{InstanceDefinition, ServiceDefinition, ServiceEndpoint};

    #[tokio::test]
    async fn test_monitor_start_stop() {
        let mut config = DiscoveryConfig::minimal();
        config.health.tick_interval = Duration::from_millis(10);
        config.health.instance_check_interval = Duration::from_millis(10);

        let probe = Arc::new(ScriptedProbe::healthy());
        let registry = Arc::new(ServiceRegistry::new(
            &config,
            Arc::new(StaticTopology::new(NodeInfo::new("node-1"))),
            Arc::new(PresharedKeyProvider::generate("node-1")),
            probe.clone(),
        ));

        let service_id = registry
            .register_service(ServiceDefinition::new(
                "payments-api",
                ServiceEndpoint::new("node-1", "10.0.0.1", 8080),
            ))
            .await
            .unwrap();
        let instance_id = registry
            .register_instance(InstanceDefinition::new(
                &service_id,
                ServiceEndpoint::new("node-1", "10.0.0.1", 8081),
            ))
            .await
            .unwrap();

        let monitor = HealthMonitor::new(&config.health, registry.clone());
        monitor.start().await.unwrap();
        assert!(monitor.is_running().await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let instance = registry.get_instance(&instance_id).await.unwrap();
        assert!(instance.is_selectable());
        assert!(probe.calls() > 0);

        monitor.stop().await.unwrap();
        assert!(!monitor.is_running().await);
    }
}
