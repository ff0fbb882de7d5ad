use agent_framework::ServiceState;
use edge_agent::fieldbus::FieldbusRegistry;
use edge_agent::integrations::IntegrationRegistry;
use edge_agent::integrations::generic_mqtt::OPS_TOPIC;
use edge_agent::mock::{
    wait_until, FakeBroker, IntegrationCall, Recorder, ScriptedDriver, SessionScript,
};
use edge_agent::model::connectivity::{class, provider};
use edge_agent::model::{SampleSet, SampleValue};
use edge_agent::services::names;
use edge_agent::{AgentSettings, EdgeSystem};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// --- Helpers ---

const EQUIPMENT: &str = r#"{
    "ref": "tank-1",
    "machineIntegration": {
        "modbus": [
            { "registerName": "TankFull", "functions": [2], "address": 0, "class": "state" }
        ]
    }
}"#;

fn connectivity(broker: &str) -> String {
    format!(
        r#"{{
        "deviceId": "0d80005e",
        "machineOperationsAndTelemetry": [
            {{ "provider": "GenericMQTT", "protocol": "MQTT", "endpoint": "{broker}" }}
        ],
        "machineIntegration": [
            {{ "type": "modbusTCP", "endpoint": "10.0.1.30" }}
        ]
    }}"#
    )
}

fn write_config(dir: &Path, broker: &str) {
    fs::write(dir.join("asset.json"), r#"{"machineId": "press-7"}"#).unwrap();
    fs::write(dir.join("equipment.json"), EQUIPMENT).unwrap();
    fs::write(dir.join("connections.json"), connectivity(broker)).unwrap();
}

fn fast_settings(dir: &Path) -> AgentSettings {
    let mut settings = AgentSettings {
        config_dir: dir.to_path_buf(),
        dependency_timeout_ms: 5_000,
        ..Default::default()
    };
    settings.fieldbus.sample_interval_ms = 50;
    settings.start_delays.config = 0;
    settings.start_delays.integrations = 0;
    settings.start_delays.state = 0;
    settings.start_delays.modbus = 0;
    settings
}

/// Polls once, then not again for a long while.
fn single_cycle_settings(dir: &Path) -> AgentSettings {
    let mut settings = fast_settings(dir);
    settings.fieldbus.sample_interval_ms = 1_500;
    settings
}

fn tank_full_driver() -> FieldbusRegistry {
    let mut drivers = FieldbusRegistry::new();
    drivers.register(
        class::MODBUS_TCP,
        Arc::new(ScriptedDriver::new(SessionScript::default().discrete_input(0, true))),
    );
    drivers
}

fn start_with(settings: AgentSettings, recorder: &Recorder) -> EdgeSystem {
    let mut integrations = IntegrationRegistry::new();
    integrations.register(provider::GENERIC_MQTT, recorder.factory());

    EdgeSystem::builder(settings)
        .with_integrations(integrations)
        .with_fieldbus_drivers(tank_full_driver())
        .start()
        .unwrap()
}

fn start(dir: &Path, recorder: &Recorder) -> EdgeSystem {
    start_with(fast_settings(dir), recorder)
}

// --- Tests ---

#[tokio::test]
async fn register_values_reach_the_telemetry_sink() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), "broker.local");
    let recorder = Recorder::new();
    let system = start(dir.path(), &recorder);

    wait_until(|| !recorder.data_sent_to("broker.local").is_empty()).await;

    let delivered = recorder.data_sent_to("broker.local");
    assert_eq!(
        delivered[0],
        SampleSet::from([("TankFull".to_string(), SampleValue::Bit(true))])
    );
    assert_eq!(
        recorder.calls()[0],
        IntegrationCall::Connect("broker.local".to_string())
    );
    assert_eq!(system.store().asset().machine_id, "press-7");
    for service in [names::CONFIG, names::INTEGRATIONS, names::MODBUS_TCP] {
        assert_eq!(system.registry().state(service), ServiceState::Normal);
    }

    system.shutdown().await;
    assert_eq!(
        recorder.calls().last(),
        Some(&IntegrationCall::Close("broker.local".to_string()))
    );
}

#[tokio::test]
async fn every_service_is_registered_with_its_dependencies() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), "broker.local");
    let recorder = Recorder::new();
    let system = start(dir.path(), &recorder);

    wait_until(|| {
        [names::STATE, names::MODBUS_TCP]
            .iter()
            .all(|name| system.registry().state(name) == ServiceState::Normal)
    })
    .await;

    let details = system.details();
    assert!(details.contains(&format!(
        "Service: {} [Status: Normal, Dependent Upon: ({})]",
        names::STATE,
        names::INTEGRATIONS
    )));
    assert!(details.contains(&format!(
        "Service: {} [Status: Normal, Dependent Upon: ({})]",
        names::MODBUS_TCP,
        names::CONFIG
    )));
    assert!(system.registry().contains(names::FIELDBUS_SUPERVISOR));

    system.shutdown().await;
}

#[tokio::test]
async fn connectivity_change_moves_delivery_to_the_new_sink() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), "broker-a.local");
    let recorder = Recorder::new();
    let system = start(dir.path(), &recorder);

    wait_until(|| !recorder.data_sent_to("broker-a.local").is_empty()).await;
    fs::write(
        dir.path().join("connections.json"),
        connectivity("broker-b.example.net"),
    )
    .unwrap();

    wait_until(|| !recorder.data_sent_to("broker-b.example.net").is_empty()).await;

    let calls = recorder.calls();
    let closed_a = calls
        .iter()
        .position(|c| *c == IntegrationCall::Close("broker-a.local".to_string()))
        .unwrap();
    let connected_b = calls
        .iter()
        .position(|c| *c == IntegrationCall::Connect("broker-b.example.net".to_string()))
        .unwrap();
    assert!(closed_a < connected_b);

    system.shutdown().await;
}

#[tokio::test]
async fn one_poll_cycle_is_delivered_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), "broker.local");
    let recorder = Recorder::new();
    let system = start_with(single_cycle_settings(dir.path()), &recorder);

    wait_until(|| !recorder.data_sent_to("broker.local").is_empty()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(
        recorder.data_sent_to("broker.local"),
        vec![SampleSet::from([("TankFull".to_string(), SampleValue::Bit(true))])]
    );

    system.shutdown().await;
}

#[tokio::test]
async fn one_poll_cycle_reaches_a_real_broker() {
    let mut broker = FakeBroker::start().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), &broker.endpoint());
    let system = EdgeSystem::builder(single_cycle_settings(dir.path()))
        .with_fieldbus_drivers(tank_full_driver())
        .start()
        .unwrap();

    let published = broker.next_publish().await.unwrap();
    assert_eq!(published.topic, OPS_TOPIC);
    assert!(published.payload_str().contains("TankFull"));
    let json: serde_json::Value = serde_json::from_slice(&published.payload).unwrap();
    assert_eq!(json["tags"]["machineId"], "press-7");
    assert_eq!(json["body"]["TankFull"], true);

    system.shutdown().await;
}
