//! # Field-bus Polling Engine
//!
//! Every sample interval: open a session to the configured link, read every mapped
//! register, close the session, publish the sample set. Sessions never outlive a cycle.
//!
//! There is no retry here. A failed connect or read ends `run()`, and the supervisor's
//! restart policy is the only recovery, so "link healthy" and "service `Normal`" are the
//! same signal. A cycle that fails part-way publishes nothing.
//!
//! With no link of this service's class or no mapped registers at start-up, `run()`
//! returns at once; the restart after the next configuration change tries again.

use crate::config_store::ConfigStore;
use crate::error::FieldbusError;
use crate::fieldbus::{read_all, FieldbusDriver, FieldbusRegistry};
use crate::messages::{AgentBus, AgentMessage};
use crate::model::{ConnectionRecord, SampleSet};
use crate::settings::FieldbusSettings;
use agent_framework::{Lifecycle, Service, ServiceState};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};

pub struct FieldbusService {
    lifecycle: Lifecycle,
    bus: AgentBus,
    store: ConfigStore,
    drivers: FieldbusRegistry,
    class: String,
    sample_interval: Duration,
    connect_timeout: Duration,
}

impl FieldbusService {
    pub fn new(
        lifecycle: Lifecycle,
        bus: AgentBus,
        store: ConfigStore,
        drivers: FieldbusRegistry,
        class: impl Into<String>,
        settings: &FieldbusSettings,
    ) -> Self {
        Self {
            lifecycle,
            bus,
            store,
            drivers,
            class: class.into(),
            sample_interval: settings.sample_interval(),
            connect_timeout: settings.connect_timeout(),
        }
    }

    /// One cycle. The session is closed exactly once whether or not the reads succeed.
    async fn poll_once(
        &self,
        driver: &dyn FieldbusDriver,
        link: &ConnectionRecord,
    ) -> Result<SampleSet, FieldbusError> {
        let mut session = driver
            .connect(&link.endpoint, link.port, self.connect_timeout)
            .await?;
        let map = self.store.equipment().machine_integration;
        let samples = read_all(session.as_mut(), &map).await;
        match session.close().await {
            Ok(()) => debug!("Session closed"),
            Err(e) => warn!(error = %e, "Closing field-bus session failed"),
        }
        samples
    }
}

#[async_trait]
impl Service for FieldbusService {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn run(&mut self) {
        if self.lifecycle.startup().await.is_err() {
            return;
        }

        let Some(link) = self.store.connectivity().machine_connection(&self.class).cloned() else {
            info!(class = %self.class, "No field-bus link configured; awaiting configuration");
            return;
        };
        if self.store.equipment().registers().is_empty() {
            info!(class = %self.class, "No registers mapped; awaiting configuration");
            return;
        }
        let driver = match self.drivers.get(&self.class) {
            Ok(driver) => driver,
            Err(e) => {
                warn!(error = %e, "Cannot poll field-bus link");
                return;
            }
        };

        self.lifecycle.set_state(ServiceState::Normal);
        info!(endpoint = %link.endpoint, port = link.port, interval = ?self.sample_interval, "Polling field-bus link");

        loop {
            tokio::select! {
                _ = self.lifecycle.stopped() => break,
                _ = tokio::time::sleep(self.sample_interval) => {}
            }

            let span = info_span!("poll", endpoint = %link.endpoint);
            match self.poll_once(driver.as_ref(), &link).instrument(span).await {
                Ok(samples) => {
                    let registers = samples.len();
                    let delivered = self.bus.publish(AgentMessage::OpsReport(samples));
                    debug!(registers, delivered, "Sample set published");
                }
                Err(e) => {
                    warn!(endpoint = %link.endpoint, error = %e, "Poll cycle failed; exiting for restart");
                    break;
                }
            }
        }
        self.lifecycle.set_state(ServiceState::NotRunning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::AgentTopic;
    use crate::mock::{ScriptedDriver, SessionScript};
    use crate::model::connectivity::class;
    use crate::model::{
        Connectivity, Equipment, MachineIntegration, RegisterClass, RegisterEntry, SampleValue,
    };
    use agent_framework::ServiceRegistry;
    use std::sync::Arc;

    fn tank() -> Equipment {
        Equipment {
            reference: "tank-1".into(),
            machine_integration: MachineIntegration {
                modbus: vec![RegisterEntry {
                    register_name: "TankFull".into(),
                    address: 0,
                    class: RegisterClass::State,
                    functions: vec![2],
                    ..Default::default()
                }],
            },
            ..Default::default()
        }
    }

    fn modbus_link() -> Connectivity {
        Connectivity {
            device_id: "0d80005e".into(),
            machine_integration: vec![ConnectionRecord {
                class: class::MODBUS_TCP.into(),
                endpoint: "10.0.1.30".into(),
                port: 502,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn service(store: &ConfigStore, bus: &AgentBus, driver: ScriptedDriver) -> FieldbusService {
        let mut drivers = FieldbusRegistry::new();
        drivers.register(class::MODBUS_TCP, Arc::new(driver));
        FieldbusService::new(
            Lifecycle::builder("ModbusTCPService").build(ServiceRegistry::new()),
            bus.clone(),
            store.clone(),
            drivers,
            class::MODBUS_TCP,
            &FieldbusSettings::default(),
        )
    }

    fn configured_store() -> ConfigStore {
        let store = ConfigStore::new();
        store.set_connectivity(modbus_link());
        store.set_equipment(tank());
        store
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_a_sample_set_each_cycle() {
        let store = configured_store();
        let bus = AgentBus::new();
        let mut ops = bus.join(AgentTopic::OpsReport);
        let driver = ScriptedDriver::new(SessionScript::default().discrete_input(0, true));
        let (connects, closes) = (driver.connect_counter(), driver.close_counter());
        let mut service = service(&store, &bus, driver);
        let lifecycle = service.lifecycle().clone();
        let started = tokio::time::Instant::now();
        let task = tokio::spawn(async move { service.run().await });

        let message = ops.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
        let AgentMessage::OpsReport(samples) = message else {
            panic!("expected an ops report");
        };
        assert_eq!(
            samples,
            SampleSet::from([("TankFull".to_string(), SampleValue::Bit(true))])
        );

        ops.recv().await.unwrap();
        assert_eq!(connects.get(), 2);
        assert_eq!(closes.get(), 2);

        lifecycle.request_stop();
        task.await.unwrap();
        assert_eq!(lifecycle.state(), ServiceState::NotRunning);
    }

    #[tokio::test(start_paused = true)]
    async fn read_failure_exits_with_session_closed_once() {
        let store = configured_store();
        let bus = AgentBus::new();
        let mut ops = bus.join(AgentTopic::OpsReport);
        let driver = ScriptedDriver::new(SessionScript::default().fail(2, 0));
        let (connects, closes) = (driver.connect_counter(), driver.close_counter());
        let mut service = service(&store, &bus, driver);

        service.run().await;

        assert_eq!(connects.get(), 1);
        assert_eq!(closes.get(), 1);
        assert!(ops.try_recv().is_none());
        assert_eq!(service.current_state(), ServiceState::NotRunning);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_exits() {
        let store = configured_store();
        let bus = AgentBus::new();
        let driver = ScriptedDriver::refusing();
        let (connects, closes) = (driver.connect_counter(), driver.close_counter());
        let mut service = service(&store, &bus, driver);

        service.run().await;

        assert_eq!(connects.get(), 1);
        assert_eq!(closes.get(), 0);
        assert_eq!(service.current_state(), ServiceState::NotRunning);
    }

    #[tokio::test(start_paused = true)]
    async fn uses_the_first_link_of_its_class() {
        let store = configured_store();
        let mut connectivity = modbus_link();
        connectivity.machine_integration.insert(
            0,
            ConnectionRecord {
                class: class::MODBUS_RTU.into(),
                endpoint: "/dev/tty00".into(),
                ..Default::default()
            },
        );
        store.set_connectivity(connectivity);
        let bus = AgentBus::new();
        let driver = ScriptedDriver::refusing();
        let endpoints = Arc::new(driver);
        let mut drivers = FieldbusRegistry::new();
        drivers.register(class::MODBUS_TCP, endpoints.clone());
        let mut service = FieldbusService::new(
            Lifecycle::builder("ModbusTCPService").build(ServiceRegistry::new()),
            bus,
            store,
            drivers,
            class::MODBUS_TCP,
            &FieldbusSettings::default(),
        );

        service.run().await;

        assert_eq!(endpoints.endpoints(), vec![("10.0.1.30".to_string(), 502)]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_configuration_exits_without_connecting() {
        let bus = AgentBus::new();

        let no_link = ConfigStore::new();
        no_link.set_equipment(tank());
        let driver = ScriptedDriver::new(SessionScript::default());
        let connects = driver.connect_counter();
        let started = tokio::time::Instant::now();
        service(&no_link, &bus, driver).run().await;
        assert_eq!(connects.get(), 0);
        assert!(started.elapsed() < Duration::from_secs(1));

        let no_registers = ConfigStore::new();
        no_registers.set_connectivity(modbus_link());
        let driver = ScriptedDriver::new(SessionScript::default());
        let connects = driver.connect_counter();
        let mut service = service(&no_registers, &bus, driver);
        service.run().await;
        assert_eq!(connects.get(), 0);
        assert_eq!(service.current_state(), ServiceState::NotRunning);
    }
}
