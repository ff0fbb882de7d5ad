use agent_framework::{FrameworkError, Lifecycle, ServiceRegistry, ServiceState};
use std::time::Duration;
use tokio::time::Instant;

// --- Helpers ---

fn dependency(registry: &ServiceRegistry, name: &str) -> Lifecycle {
    let lifecycle = Lifecycle::builder(name).build(registry.clone());
    registry
        .register(name, &[], lifecycle.subscribe_state())
        .unwrap();
    lifecycle
}

fn dependent(registry: &ServiceRegistry, deps: &[&str]) -> Lifecycle {
    deps.iter()
        .fold(Lifecycle::builder("Dependent"), |builder, dep| {
            builder.depends_on(*dep)
        })
        .build(registry.clone())
}

// --- Tests ---

#[tokio::test(start_paused = true)]
async fn gate_blocks_until_dependency_is_normal() {
    let registry = ServiceRegistry::new();
    let config = dependency(&registry, "Config");
    let waiter = dependent(&registry, &["Config"]);

    let gate = {
        let waiter = waiter.clone();
        tokio::spawn(async move { waiter.wait_for_dependencies(Duration::from_secs(10)).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!gate.is_finished());

    config.set_state(ServiceState::Normal);
    assert_eq!(gate.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn gate_times_out_after_exactly_the_timeout() {
    let registry = ServiceRegistry::new();
    let _config = dependency(&registry, "Config");
    let waiter = dependent(&registry, &["Config", "NeverRegistered"]);

    let start = Instant::now();
    let result = waiter.wait_for_dependencies(Duration::from_secs(10)).await;
    let elapsed = start.elapsed();

    assert_eq!(
        result,
        Err(FrameworkError::DependencyTimeout {
            service: "Dependent".into(),
            pending: vec!["Config".into(), "NeverRegistered".into()],
            timeout: Duration::from_secs(10),
        })
    );
    assert!(elapsed >= Duration::from_secs(10), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(10_100), "returned late: {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn gate_waits_for_every_dependency() {
    let registry = ServiceRegistry::new();
    let config = dependency(&registry, "Config");
    let integrations = dependency(&registry, "Integrations");
    let waiter = dependent(&registry, &["Config", "Integrations"]);

    config.set_state(ServiceState::Normal);
    let result = waiter.wait_for_dependencies(Duration::from_secs(2)).await;
    assert!(matches!(
        result,
        Err(FrameworkError::DependencyTimeout { ref pending, .. }) if pending == &vec!["Integrations".to_string()]
    ));

    integrations.set_state(ServiceState::Normal);
    assert_eq!(waiter.wait_for_dependencies(Duration::from_secs(2)).await, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn gate_picks_up_late_registration() {
    let registry = ServiceRegistry::new();
    let waiter = dependent(&registry, &["Config"]);

    let gate = {
        let waiter = waiter.clone();
        tokio::spawn(async move { waiter.wait_for_dependencies(Duration::from_secs(10)).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    let config = dependency(&registry, "Config");
    config.set_state(ServiceState::Normal);

    assert_eq!(gate.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn paused_dependency_does_not_satisfy_gate() {
    let registry = ServiceRegistry::new();
    let config = dependency(&registry, "Config");
    config.set_state(ServiceState::Paused);
    let waiter = dependent(&registry, &["Config"]);

    let result = waiter.wait_for_dependencies(Duration::from_secs(1)).await;
    assert!(matches!(result, Err(FrameworkError::DependencyTimeout { .. })));
}

#[tokio::test(start_paused = true)]
async fn stop_request_ends_the_gate() {
    let registry = ServiceRegistry::new();
    let _config = dependency(&registry, "Config");
    let waiter = dependent(&registry, &["Config"]);

    let gate = {
        let waiter = waiter.clone();
        tokio::spawn(async move { waiter.wait_for_dependencies(Duration::from_secs(60)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    waiter.request_stop();

    assert_eq!(
        gate.await.unwrap(),
        Err(FrameworkError::StopRequested("Dependent".into()))
    );
}
