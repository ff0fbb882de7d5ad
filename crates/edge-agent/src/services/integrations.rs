//! # Integration Fan-out Multiplexer
//!
//! Owns every outbound sink and hands each health record and sample set to all sinks
//! of the matching kind:
//!
//! | Message        | Sinks                                   | Call         |
//! |----------------|-----------------------------------------|--------------|
//! | state report   | `deviceState`                           | `send_state` |
//! | ops report     | `machineOperationsAndTelemetry`         | `send_data`  |
//!
//! Delivery is at-most-once per sink. A failing or slow sink is logged and skipped; it
//! never delays the others past the request timeout and never changes this service's
//! state. Nothing is queued: reports published while the sinks are being rebuilt after
//! a connectivity change are not delivered here.

use crate::config_store::ConfigStore;
use crate::error::IntegrationError;
use crate::integrations::{Integration, IntegrationContext, IntegrationRegistry};
use crate::messages::{AgentBus, AgentMessage, AgentTopic};
use crate::model::{ConnectionRecord, HealthRecord, SampleSet};
use crate::settings::IntegrationSettings;
use agent_framework::bus::Subscription;
use agent_framework::{Lifecycle, Service, ServiceState};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::error::Elapsed;
use tracing::{debug, info, trace, warn};

/// Which sink list a sink came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkKind {
    State,
    Ops,
}

impl SinkKind {
    fn as_str(self) -> &'static str {
        match self {
            SinkKind::State => "state",
            SinkKind::Ops => "ops",
        }
    }
}

/// Subscriptions to the two report topics, re-joined after every rebuild.
struct Reports {
    state: Subscription<AgentMessage>,
    ops: Subscription<AgentMessage>,
}

impl Reports {
    fn join(bus: &AgentBus) -> Self {
        Self {
            state: bus.join(AgentTopic::StateReport),
            ops: bus.join(AgentTopic::OpsReport),
        }
    }
}

pub struct IntegrationsService {
    lifecycle: Lifecycle,
    bus: AgentBus,
    store: ConfigStore,
    registry: IntegrationRegistry,
    request_timeout: Duration,
    idle_interval: Duration,
    state_sinks: Vec<Box<dyn Integration>>,
    ops_sinks: Vec<Box<dyn Integration>>,
}

impl IntegrationsService {
    pub fn new(
        lifecycle: Lifecycle,
        bus: AgentBus,
        store: ConfigStore,
        registry: IntegrationRegistry,
        settings: &IntegrationSettings,
    ) -> Self {
        Self {
            lifecycle,
            bus,
            store,
            registry,
            request_timeout: settings.request_timeout(),
            idle_interval: settings.idle_interval().max(Duration::from_millis(1)),
            state_sinks: Vec::new(),
            ops_sinks: Vec::new(),
        }
    }

    /// Closes the current sinks, then builds and connects new ones from the
    /// connectivity document.
    async fn rebuild(&mut self) {
        self.close_all().await;

        let connectivity = self.store.connectivity();
        let context = IntegrationContext {
            store: self.store.clone(),
            request_timeout: self.request_timeout,
        };
        self.state_sinks = self
            .connect_all(SinkKind::State, &connectivity.device_state, &context)
            .await;
        self.ops_sinks = self
            .connect_all(
                SinkKind::Ops,
                &connectivity.machine_operations_and_telemetry,
                &context,
            )
            .await;
        info!(
            state_sinks = self.state_sinks.len(),
            ops_sinks = self.ops_sinks.len(),
            "Sinks built"
        );
    }

    /// Sinks that fail to connect are kept; their sends fail and are logged like any
    /// other delivery error.
    async fn connect_all(
        &mut self,
        kind: SinkKind,
        records: &[ConnectionRecord],
        context: &IntegrationContext,
    ) -> Vec<Box<dyn Integration>> {
        let mut sinks = Vec::with_capacity(records.len());
        for record in records {
            let mut sink = match self.registry.create(record, context) {
                Ok(sink) => sink,
                Err(e) => {
                    warn!(kind = kind.as_str(), provider = %record.provider, error = %e, "Skipping sink");
                    continue;
                }
            };
            match tokio::time::timeout(self.request_timeout, sink.connect()).await {
                Ok(Ok(())) => {
                    info!(kind = kind.as_str(), provider = %record.provider, endpoint = %record.endpoint, "Sink connected")
                }
                Ok(Err(e)) => {
                    warn!(kind = kind.as_str(), provider = %record.provider, endpoint = %record.endpoint, error = %e, "Sink connect failed")
                }
                Err(_) => {
                    warn!(kind = kind.as_str(), provider = %record.provider, endpoint = %record.endpoint, timeout = ?self.request_timeout, "Sink connect timed out")
                }
            }
            sinks.push(sink);
        }
        sinks
    }

    async fn close_all(&mut self) {
        let sinks: Vec<_> = self
            .state_sinks
            .drain(..)
            .chain(self.ops_sinks.drain(..))
            .collect();
        for mut sink in sinks {
            let outcome = tokio::time::timeout(self.request_timeout, sink.close()).await;
            log_outcome("close", sink.connection_record(), outcome);
        }
    }

    async fn deliver_state(&mut self, record: &HealthRecord) {
        for sink in &mut self.state_sinks {
            let outcome = tokio::time::timeout(self.request_timeout, sink.send_state(record)).await;
            log_outcome("send_state", sink.connection_record(), outcome);
        }
    }

    async fn deliver_data(&mut self, samples: &SampleSet) {
        for sink in &mut self.ops_sinks {
            let outcome = tokio::time::timeout(self.request_timeout, sink.send_data(samples)).await;
            log_outcome("send_data", sink.connection_record(), outcome);
        }
    }
}

fn log_outcome(
    call: &'static str,
    record: &ConnectionRecord,
    outcome: Result<Result<(), IntegrationError>, Elapsed>,
) {
    match outcome {
        Ok(Ok(())) => {
            debug!(call, provider = %record.provider, endpoint = %record.endpoint, "Sink call succeeded")
        }
        Ok(Err(e)) => {
            warn!(call, provider = %record.provider, endpoint = %record.endpoint, error = %e, "Sink call failed")
        }
        Err(_) => warn!(call, provider = %record.provider, endpoint = %record.endpoint, "Sink call timed out"),
    }
}

#[async_trait]
impl Service for IntegrationsService {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn run(&mut self) {
        if self.lifecycle.startup().await.is_err() {
            return;
        }
        let lifecycle = self.lifecycle.clone();
        let mut asset_changes = self.bus.join(AgentTopic::AssetChanged);
        let mut equipment_changes = self.bus.join(AgentTopic::EquipmentChanged);
        let mut connectivity_changes = self.bus.join(AgentTopic::ConnectivityChanged);

        self.rebuild().await;
        let mut reports = Reports::join(&self.bus);
        lifecycle.set_state(ServiceState::Normal);

        loop {
            tokio::select! {
                _ = lifecycle.stopped() => break,
                Some(_) = asset_changes.recv() => {
                    info!("Asset configuration updated; no action taken");
                }
                Some(_) = equipment_changes.recv() => {
                    info!("Equipment configuration updated; no action taken");
                }
                Some(_) = connectivity_changes.recv() => {
                    info!("Connectivity configuration updated; rebuilding sinks");
                    drop(reports);
                    self.rebuild().await;
                    reports = Reports::join(&self.bus);
                }
                Some(message) = reports.state.recv() => match message {
                    AgentMessage::StateReport(record) => self.deliver_state(&record).await,
                    other => debug!(?other, "Unexpected payload on state topic"),
                },
                Some(message) = reports.ops.recv() => match message {
                    AgentMessage::OpsReport(samples) => self.deliver_data(&samples).await,
                    other => debug!(?other, "Unexpected payload on ops topic"),
                },
                _ = tokio::time::sleep(self.idle_interval) => {
                    // Reserved for sink liveness probing.
                    trace!("Idle");
                }
            }
        }

        self.close_all().await;
        lifecycle.set_state(ServiceState::NotRunning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ChangeKind, ConfigChange};
    use crate::mock::{wait_until, IntegrationCall, Recorder};
    use crate::model::connectivity::provider;
    use crate::model::{Connectivity, SampleValue};
    use agent_framework::ServiceRegistry;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio::sync::Notify;
    use tokio::task::JoinHandle;

    fn sink(endpoint: &str) -> ConnectionRecord {
        ConnectionRecord {
            provider: provider::GENERIC_MQTT.into(),
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    fn samples() -> SampleSet {
        SampleSet::from([("TankFull".to_string(), SampleValue::Bit(true))])
    }

    struct Harness {
        bus: AgentBus,
        store: ConfigStore,
        recorder: Recorder,
        lifecycle: Lifecycle,
        task: JoinHandle<()>,
    }

    async fn start(connectivity: Connectivity, recorder: Recorder) -> Harness {
        let bus = AgentBus::new();
        let store = ConfigStore::new();
        store.set_connectivity(connectivity);
        let mut registry = IntegrationRegistry::new();
        registry.register(provider::GENERIC_MQTT, recorder.factory());

        let lifecycle = Lifecycle::builder("IntegrationsService").build(ServiceRegistry::new());
        let mut service = IntegrationsService::new(
            lifecycle.clone(),
            bus.clone(),
            store.clone(),
            registry,
            &IntegrationSettings::default(),
        );
        let task = tokio::spawn(async move { service.run().await });
        let mut state = lifecycle.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| s.is_normal()))
            .await
            .unwrap()
            .unwrap();

        Harness {
            bus,
            store,
            recorder,
            lifecycle,
            task,
        }
    }

    #[tokio::test]
    async fn failing_sink_does_not_block_the_others() {
        let recorder = Recorder::new();
        recorder.fail_sends_to("tcp://broken");
        let harness = start(
            Connectivity {
                machine_operations_and_telemetry: vec![sink("tcp://broken"), sink("tcp://healthy")],
                ..Default::default()
            },
            recorder,
        )
        .await;

        harness.bus.publish(AgentMessage::OpsReport(samples()));

        wait_until(|| !harness.recorder.data_sent_to("tcp://healthy").is_empty()).await;
        assert_eq!(harness.recorder.data_sent_to("tcp://healthy"), vec![samples()]);
        assert_eq!(harness.recorder.data_sent_to("tcp://broken").len(), 1);
        assert_eq!(harness.lifecycle.state(), ServiceState::Normal);

        harness.lifecycle.request_stop();
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn reports_go_only_to_their_own_sink_list() {
        let harness = start(
            Connectivity {
                device_state: vec![sink("tcp://state")],
                machine_operations_and_telemetry: vec![sink("tcp://ops")],
                ..Default::default()
            },
            Recorder::new(),
        )
        .await;

        let record = HealthRecord {
            timestamp: Utc::now(),
            memory_consumed: 0.5,
            disk_consumed: 0.5,
            load_average: 0.5,
        };
        harness.bus.publish(AgentMessage::StateReport(record.clone()));
        harness.bus.publish(AgentMessage::OpsReport(samples()));

        wait_until(|| harness.recorder.data_sent_to("tcp://ops").len() == 1).await;
        wait_until(|| harness.recorder.state_sent_to("tcp://state").len() == 1).await;
        assert!(harness.recorder.data_sent_to("tcp://state").is_empty());
        assert!(harness.recorder.state_sent_to("tcp://ops").is_empty());
        assert_eq!(harness.recorder.state_sent_to("tcp://state"), vec![record]);

        harness.lifecycle.request_stop();
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn connectivity_change_replaces_every_sink() {
        let harness = start(
            Connectivity {
                machine_operations_and_telemetry: vec![sink("tcp://old")],
                ..Default::default()
            },
            Recorder::new(),
        )
        .await;

        harness.store.set_connectivity(Connectivity {
            machine_operations_and_telemetry: vec![sink("tcp://new")],
            ..Default::default()
        });
        harness.bus.publish(AgentMessage::ConnectivityChanged(ConfigChange {
            path: PathBuf::from("connections.json"),
            kind: ChangeKind::Modified,
        }));
        wait_until(|| {
            harness
                .recorder
                .calls()
                .contains(&IntegrationCall::Connect("tcp://new".into()))
        })
        .await;

        let calls = harness.recorder.calls();
        let closed_old = calls
            .iter()
            .position(|c| *c == IntegrationCall::Close("tcp://old".into()))
            .unwrap();
        let opened_new = calls
            .iter()
            .position(|c| *c == IntegrationCall::Connect("tcp://new".into()))
            .unwrap();
        assert!(closed_old < opened_new);

        // The rebuild finishes before the connect is visible, and the report
        // subscriptions are re-joined right after it.
        wait_until(|| {
            harness.bus.publish(AgentMessage::OpsReport(samples()));
            !harness.recorder.data_sent_to("tcp://new").is_empty()
        })
        .await;
        assert!(harness.recorder.data_sent_to("tcp://old").is_empty());

        harness.lifecycle.request_stop();
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_providers_are_skipped_and_stop_closes_the_rest() {
        let recorder = Recorder::new();
        recorder.fail_connects_to("tcp://unreachable");
        let mut unknown = sink("https://nowhere");
        unknown.provider = "Carrier pigeon".into();
        let harness = start(
            Connectivity {
                device_state: vec![unknown, sink("tcp://unreachable")],
                machine_operations_and_telemetry: vec![sink("tcp://ops")],
                ..Default::default()
            },
            recorder,
        )
        .await;

        harness.lifecycle.request_stop();
        harness.task.await.unwrap();

        let calls = harness.recorder.calls();
        assert!(calls.contains(&IntegrationCall::Close("tcp://unreachable".into())));
        assert!(calls.contains(&IntegrationCall::Close("tcp://ops".into())));
        assert!(calls.iter().all(|c| c.endpoint() != "https://nowhere"));
        assert_eq!(harness.lifecycle.state(), ServiceState::NotRunning);
    }

    /// A sink whose connect to `tcp://slow` parks until `gate` is released.
    struct GatedSink {
        record: ConnectionRecord,
        connecting: Arc<Notify>,
        gate: Arc<Notify>,
        delivered: Arc<Mutex<Vec<(String, SampleSet)>>>,
    }

    #[async_trait]
    impl Integration for GatedSink {
        fn set_connection_record(&mut self, record: ConnectionRecord) {
            self.record = record;
        }

        fn connection_record(&self) -> &ConnectionRecord {
            &self.record
        }

        async fn connect(&mut self) -> Result<(), IntegrationError> {
            if self.record.endpoint == "tcp://slow" {
                self.connecting.notify_one();
                self.gate.notified().await;
            }
            Ok(())
        }

        async fn close(&mut self) -> Result<(), IntegrationError> {
            Ok(())
        }

        async fn send_state(&mut self, _record: &HealthRecord) -> Result<(), IntegrationError> {
            Ok(())
        }

        async fn send_data(&mut self, samples: &SampleSet) -> Result<(), IntegrationError> {
            self.delivered
                .lock()
                .push((self.record.endpoint.clone(), samples.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn ops_report_published_mid_rebuild_is_lost() {
        let connecting = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let mut registry = IntegrationRegistry::new();
        {
            let (connecting, gate, delivered) = (connecting.clone(), gate.clone(), delivered.clone());
            registry.register(
                "Gated",
                Arc::new(move |_: &IntegrationContext| {
                    Box::new(GatedSink {
                        record: ConnectionRecord::default(),
                        connecting: connecting.clone(),
                        gate: gate.clone(),
                        delivered: delivered.clone(),
                    }) as Box<dyn Integration>
                }),
            );
        }
        let gated = |endpoint: &str| ConnectionRecord {
            provider: "Gated".into(),
            endpoint: endpoint.into(),
            ..Default::default()
        };

        let bus = AgentBus::new();
        let store = ConfigStore::new();
        store.set_connectivity(Connectivity {
            machine_operations_and_telemetry: vec![gated("tcp://first")],
            ..Default::default()
        });
        let lifecycle = Lifecycle::builder("IntegrationsService").build(ServiceRegistry::new());
        let mut service = IntegrationsService::new(
            lifecycle.clone(),
            bus.clone(),
            store.clone(),
            registry,
            &IntegrationSettings::default(),
        );
        let task = tokio::spawn(async move { service.run().await });
        wait_until(|| lifecycle.state() == ServiceState::Normal).await;

        store.set_connectivity(Connectivity {
            machine_operations_and_telemetry: vec![gated("tcp://slow")],
            ..Default::default()
        });
        bus.publish(AgentMessage::ConnectivityChanged(ConfigChange {
            path: PathBuf::from("connections.json"),
            kind: ChangeKind::Modified,
        }));
        tokio::time::timeout(Duration::from_secs(5), connecting.notified())
            .await
            .unwrap();

        let lost = SampleSet::from([("TankFull".to_string(), SampleValue::Bit(false))]);
        assert_eq!(bus.publish(AgentMessage::OpsReport(lost.clone())), 0);

        gate.notify_one();
        wait_until(|| {
            bus.publish(AgentMessage::OpsReport(samples()));
            delivered.lock().iter().any(|(endpoint, _)| endpoint == "tcp://slow")
        })
        .await;
        assert!(delivered.lock().iter().all(|(_, set)| *set != lost));

        lifecycle.request_stop();
        task.await.unwrap();
    }
}
