//! End-to-end discovery scenarios through the engine facade

mod common;

use common::*;
use orasi_discovery::{
    DiscoveryError, DiscoveryEvent, InstanceDefinition, InstanceStatus, SelectionStrategy,
    Service, ServiceDefinition,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

async fn service_with_two_instances(
    engine: &orasi_discovery::DiscoveryEngine,
    name: &str,
) -> (String, String, String) {
    let service_id = engine
        .register_service(ServiceDefinition::new(name, endpoint(LOCAL_NODE, 80)))
        .await
        .unwrap();
    let a = engine
        .register_service_instance(InstanceDefinition::new(&service_id, endpoint("node-a", 8081)))
        .await
        .unwrap();
    let b = engine
        .register_service_instance(InstanceDefinition::new(&service_id, endpoint("node-b", 8082)))
        .await
        .unwrap();
    engine.run_health_checks().await.unwrap();
    (service_id, a, b)
}

#[tokio::test]
async fn round_robin_spreads_clients_evenly() {
    let (engine, _probe) = engine().await;
    let (service_id, a, b) = service_with_two_instances(&engine, "payments-api").await;

    let mut per_instance: HashMap<String, usize> = HashMap::new();
    for client in 0..10 {
        let binding = engine
            .bind_to_service(&service_id, Some(&format!("client-{}", client)), false)
            .await
            .unwrap()
            .unwrap();
        *per_instance.entry(binding.instance_id).or_default() += 1;
    }

    assert_eq!(per_instance[&a], 5);
    assert_eq!(per_instance[&b], 5);

    let stats = engine.get_discovery_statistics().await.unwrap();
    assert_eq!(stats.active_bindings, 10);
    assert_eq!(stats.connection_distribution[&a], 5);
    assert_eq!(stats.total_requests, 10);
}

#[tokio::test]
async fn failed_instance_is_skipped_after_threshold() {
    let (engine, probe) = engine().await;
    let (service_id, a, b) = service_with_two_instances(&engine, "payments-api").await;

    probe.fail(&endpoint("node-a", 8081));
    for _ in 0..2 {
        engine.run_health_checks().await.unwrap();
    }
    let instances = engine.get_service_instances(&service_id).await.unwrap();
    let first = instances.iter().find(|i| i.instance_id == a).unwrap();
    assert_eq!(first.status, InstanceStatus::Running);
    assert_eq!(first.health.consecutive_failures, 2);

    engine.run_health_checks().await.unwrap();
    let instances = engine.get_service_instances(&service_id).await.unwrap();
    let first = instances.iter().find(|i| i.instance_id == a).unwrap();
    assert_eq!(first.status, InstanceStatus::Failed);
    assert!(!first.health.healthy);

    for client in 0..6 {
        let selected = engine
            .select_instance(&service_id, Some(&format!("client-{}", client)), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selected.instance_id, b);
    }

    probe.recover(&endpoint("node-a", 8081));
    engine.run_health_checks().await.unwrap();
    let recovered = engine
        .get_service_instances(&service_id)
        .await
        .unwrap()
        .into_iter()
        .find(|i| i.instance_id == a)
        .unwrap();
    assert_eq!(recovered.status, InstanceStatus::Running);
}

#[tokio::test]
async fn glob_discovery_matches_by_prefix() {
    let (engine, _probe) = engine().await;
    for name in ["payments-api", "inventory-api", "gateway"] {
        engine
            .register_service(ServiceDefinition::new(name, endpoint(LOCAL_NODE, 80)))
            .await
            .unwrap();
    }

    let found = engine.discover_services("pay*", None).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name, "payments-api");
    assert_eq!(engine.discover_services("*-api", None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn broken_secure_session_still_binds() {
    let (engine, _probe) = engine_with(test_config(), Arc::new(BrokenSessions)).await;
    let service_id = engine
        .register_service(ServiceDefinition::new("payments-api", endpoint(LOCAL_NODE, 80)))
        .await
        .unwrap();
    engine
        .register_service_instance(InstanceDefinition::new(&service_id, endpoint("node-a", 8081)))
        .await
        .unwrap();
    engine.run_health_checks().await.unwrap();

    let binding = engine
        .bind_to_service("payments-api", Some("client-1"), true)
        .await
        .unwrap()
        .unwrap();
    assert!(!binding.secured);
    assert!(binding.session_key.is_empty());
}

#[tokio::test]
async fn no_healthy_instance_yields_no_binding() {
    let (engine, _probe) = engine().await;
    let service_id = engine
        .register_service(ServiceDefinition::new("payments-api", endpoint(LOCAL_NODE, 80)))
        .await
        .unwrap();
    engine
        .register_service_instance(InstanceDefinition::new(&service_id, endpoint("node-a", 8081)))
        .await
        .unwrap();

    // Still starting, nothing has been probed yet
    assert!(engine
        .bind_to_service(&service_id, None, false)
        .await
        .unwrap()
        .is_none());
    assert!(matches!(
        engine.bind_to_service("svc-unknown", None, false).await,
        Err(DiscoveryError::NotFound(_))
    ));
}

#[tokio::test]
async fn release_restores_connection_count() {
    let (engine, _probe) = engine().await;
    let (service_id, _, _) = service_with_two_instances(&engine, "payments-api").await;

    let binding = engine
        .bind_to_service(&service_id, Some("client-1"), true)
        .await
        .unwrap()
        .unwrap();
    assert!(binding.secured);
    let stats = engine.get_discovery_statistics().await.unwrap();
    assert_eq!(stats.connection_distribution[&binding.instance_id], 1);

    assert_eq!(
        engine.get_binding(&binding.binding_id).await.unwrap().binding_id,
        binding.binding_id
    );
    engine
        .release_service_binding(&binding.binding_id)
        .await
        .unwrap();
    let stats = engine.get_discovery_statistics().await.unwrap();
    assert_eq!(stats.connection_distribution[&binding.instance_id], 0);
    assert_eq!(stats.active_bindings, 0);

    // Never below zero
    engine
        .release_connection(&binding.instance_id)
        .await
        .unwrap();
    let stats = engine.get_discovery_statistics().await.unwrap();
    assert_eq!(stats.connection_distribution[&binding.instance_id], 0);

    assert!(matches!(
        engine.release_service_binding(&binding.binding_id).await,
        Err(DiscoveryError::NotFound(_))
    ));
}

#[tokio::test]
async fn sticky_clients_keep_their_instance() {
    let (engine, probe) = engine().await;
    let service_id = engine
        .register_service(
            ServiceDefinition::new("carts", endpoint(LOCAL_NODE, 80))
                .with_strategy(SelectionStrategy::LeastConnections)
                .with_sticky_sessions(true),
        )
        .await
        .unwrap();
    for (node, port) in [("node-a", 8081), ("node-b", 8082)] {
        engine
            .register_service_instance(InstanceDefinition::new(&service_id, endpoint(node, port)))
            .await
            .unwrap();
    }
    engine.run_health_checks().await.unwrap();

    let first = engine
        .select_instance(&service_id, Some("client-1"), None)
        .await
        .unwrap()
        .unwrap();
    for _ in 0..3 {
        let again = engine
            .select_instance(&service_id, Some("client-1"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.instance_id, first.instance_id);
    }

    probe.fail(&first.endpoint);
    for _ in 0..3 {
        engine.run_health_checks().await.unwrap();
    }
    let moved = engine
        .select_instance(&service_id, Some("client-1"), None)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(moved.instance_id, first.instance_id);
}

#[tokio::test]
async fn unregister_cascades_to_bindings() {
    let (engine, _probe) = engine().await;
    let (service_id, a, _) = service_with_two_instances(&engine, "payments-api").await;
    let binding = engine
        .bind_to_service(&service_id, Some("client-1"), false)
        .await
        .unwrap()
        .unwrap();

    assert!(engine.unregister_service(&service_id).await.unwrap());
    assert!(!engine.unregister_service(&service_id).await.unwrap());

    assert!(engine.get_service(&service_id).await.unwrap().is_none());
    assert!(engine
        .get_service_instances(&service_id)
        .await
        .unwrap()
        .is_empty());
    assert!(engine.get_health_checks(&service_id).await.unwrap().is_empty());
    assert!(matches!(
        engine.get_binding(&binding.binding_id).await,
        Err(DiscoveryError::NotFound(_))
    ));

    let stats = engine.get_discovery_statistics().await.unwrap();
    assert_eq!(stats.total_instances, 0);
    assert!(!stats.connection_distribution.contains_key(&a));
}

#[tokio::test]
async fn subscriptions_see_snapshot_then_new_services() {
    let (engine, _probe) = engine().await;
    engine
        .register_service(ServiceDefinition::new("payments-api", endpoint(LOCAL_NODE, 80)))
        .await
        .unwrap();

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let subscription_id = engine
        .subscribe_to_services(
            "pay*",
            None,
            Arc::new(move |services: &[Service]| {
                let mut seen = sink.lock().unwrap();
                seen.extend(services.iter().map(|s| s.name.clone()));
            }),
        )
        .await
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["payments-api"]);

    engine
        .register_service(ServiceDefinition::new("payouts", endpoint(LOCAL_NODE, 81)))
        .await
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["payments-api", "payouts"]);

    assert!(engine.unsubscribe(&subscription_id).await.unwrap());
    engine
        .register_service(ServiceDefinition::new("payroll", endpoint(LOCAL_NODE, 82)))
        .await
        .unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn events_follow_successful_mutations() {
    let (engine, _probe) = engine().await;
    let kinds: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = kinds.clone();
    let handle = engine
        .subscribe_events(Arc::new(move |event: &DiscoveryEvent| {
            sink.lock().unwrap().push(event.kind());
        }))
        .await;

    let (service_id, _, _) = service_with_two_instances(&engine, "payments-api").await;
    engine.discover_services("pay*", None).await.unwrap();
    engine
        .subscribe_to_services("pay*", None, Arc::new(|_: &[Service]| {}))
        .await
        .unwrap();
    let binding = engine
        .bind_to_service(&service_id, None, false)
        .await
        .unwrap()
        .unwrap();
    engine
        .release_service_binding(&binding.binding_id)
        .await
        .unwrap();

    // Failed calls emit nothing
    assert!(engine
        .register_service(ServiceDefinition::default())
        .await
        .is_err());

    engine.unregister_service(&service_id).await.unwrap();

    assert_eq!(
        *kinds.lock().unwrap(),
        vec![
            "service_registered",
            "instance_registered",
            "instance_registered",
            "services_discovered",
            "subscription_created",
            "service_bound",
            "binding_released",
            "service_unregistered",
        ]
    );

    assert!(handle.unsubscribe().await);
    engine.discover_services("*", None).await.unwrap();
    assert_eq!(kinds.lock().unwrap().len(), 8);
}

#[tokio::test]
async fn optimized_strategy_prefers_better_node() {
    let (engine, _probe) = engine().await;
    let service_id = engine
        .register_service(ServiceDefinition::new("render", endpoint(LOCAL_NODE, 80)))
        .await
        .unwrap();
    engine
        .register_service_instance(InstanceDefinition::new(&service_id, endpoint("node-a", 8081)))
        .await
        .unwrap();
    let local = engine
        .register_service_instance(InstanceDefinition::new(
            &service_id,
            endpoint(LOCAL_NODE, 8083),
        ))
        .await
        .unwrap();
    engine.run_health_checks().await.unwrap();

    // The local node is ready with a perfect channel, node-a has no channel quality
    let selected = engine
        .select_instance(&service_id, None, Some(SelectionStrategy::Optimized))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(selected.instance_id, local);
}
