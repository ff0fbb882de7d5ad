//! # Agent Assembly
//!
//! Builds the supervision tree, wires every service to the shared bus and
//! configuration store, and starts the master supervisor in its own task.
//!
//! ```text
//! MasterSupervisor
//! ├── ConfigService
//! ├── IntegrationsService   (depends on ConfigService)
//! ├── StateService          (depends on IntegrationsService)
//! └── FieldbusSupervisor
//!     └── ModbusTCPService  (depends on ConfigService)
//! ```
//!
//! Drivers, sink providers, the watcher and the health probe are all replaceable
//! through [`EdgeSystemBuilder`], which is how the end-to-end tests run the whole tree
//! without a network.

use crate::config_store::{ConfigPaths, ConfigStore};
use crate::fieldbus::FieldbusRegistry;
use crate::health::{HealthProbe, SysinfoProbe};
use crate::integrations::IntegrationRegistry;
use crate::messages::AgentBus;
use crate::model::connectivity::class;
use crate::services::{names, ConfigService, FieldbusService, IntegrationsService, StateService};
use crate::settings::AgentSettings;
use crate::watcher::{ConfigWatcher, NotifyWatcher};
use agent_framework::{FrameworkError, Lifecycle, ServiceRegistry, Supervisor, SupervisorHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How long [`EdgeSystem::shutdown`] waits for the master supervisor beyond its own
/// shutdown timeout.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub struct EdgeSystemBuilder {
    settings: AgentSettings,
    integrations: IntegrationRegistry,
    drivers: FieldbusRegistry,
    watcher: Arc<dyn ConfigWatcher>,
    probe: Box<dyn HealthProbe>,
}

impl EdgeSystemBuilder {
    /// Replaces the sink providers (default: GenericMQTT and InitialState).
    pub fn with_integrations(mut self, integrations: IntegrationRegistry) -> Self {
        self.integrations = integrations;
        self
    }

    /// Replaces the field-bus drivers (default: Modbus TCP).
    pub fn with_fieldbus_drivers(mut self, drivers: FieldbusRegistry) -> Self {
        self.drivers = drivers;
        self
    }

    pub fn with_watcher(mut self, watcher: Arc<dyn ConfigWatcher>) -> Self {
        self.watcher = watcher;
        self
    }

    pub fn with_health_probe(mut self, probe: Box<dyn HealthProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Registers every service and spawns the master supervisor.
    ///
    /// Fails only if a service cannot be registered, which means the wiring itself is
    /// wrong (duplicate name or dependency cycle).
    pub fn start(self) -> Result<EdgeSystem, FrameworkError> {
        let Self {
            settings,
            integrations,
            drivers,
            watcher,
            probe,
        } = self;

        let registry = ServiceRegistry::new();
        let bus = AgentBus::with_capacity(settings.bus_capacity);
        let store = ConfigStore::new();
        let paths = ConfigPaths::from_settings(&settings);
        let delays = &settings.start_delays;
        let dependency_timeout = settings.dependency_timeout();

        // =====================================================================
        // Supervisors
        // =====================================================================
        let mut master = Supervisor::new(
            names::MASTER_SUPERVISOR,
            settings.supervisor_spec(),
            registry.clone(),
        );
        let fieldbus = Supervisor::new(
            names::FIELDBUS_SUPERVISOR,
            settings.supervisor_spec(),
            registry.clone(),
        );

        // =====================================================================
        // Configuration
        // =====================================================================
        let config = ConfigService::new(
            Lifecycle::builder(names::CONFIG)
                .start_delay(delays.config())
                .build(registry.clone()),
            store.clone(),
            bus.clone(),
            paths,
            watcher,
        );

        // =====================================================================
        // Integrations and device state
        // =====================================================================
        let integrations = IntegrationsService::new(
            Lifecycle::builder(names::INTEGRATIONS)
                .depends_on(names::CONFIG)
                .start_delay(delays.integrations())
                .dependency_timeout(dependency_timeout)
                .build(registry.clone()),
            bus.clone(),
            store.clone(),
            integrations,
            &settings.integrations,
        );
        let state = StateService::new(
            Lifecycle::builder(names::STATE)
                .depends_on(names::INTEGRATIONS)
                .start_delay(delays.state())
                .dependency_timeout(dependency_timeout)
                .build(registry.clone()),
            bus.clone(),
            probe,
            settings.state.report_interval(),
        );

        // =====================================================================
        // Field-bus polling
        // =====================================================================
        let modbus = FieldbusService::new(
            Lifecycle::builder(names::MODBUS_TCP)
                .depends_on(names::CONFIG)
                .start_delay(delays.modbus())
                .dependency_timeout(dependency_timeout)
                .build(registry.clone()),
            bus.clone(),
            store.clone(),
            drivers,
            class::MODBUS_TCP,
            &settings.fieldbus,
        );
        fieldbus.add(Box::new(modbus))?;

        master.add(Box::new(config))?;
        master.add(Box::new(integrations))?;
        master.add(Box::new(state))?;
        master.add(Box::new(fieldbus))?;

        let handle = master.handle();
        let task = tokio::spawn(async move { master.serve().await });
        info!(services = ?registry.names(), "Edge agent started");

        Ok(EdgeSystem {
            settings,
            bus,
            store,
            registry,
            master: handle,
            task,
        })
    }
}

/// A running agent.
pub struct EdgeSystem {
    settings: AgentSettings,
    bus: AgentBus,
    store: ConfigStore,
    registry: ServiceRegistry,
    master: SupervisorHandle,
    task: JoinHandle<()>,
}

impl EdgeSystem {
    pub fn builder(settings: AgentSettings) -> EdgeSystemBuilder {
        EdgeSystemBuilder {
            integrations: IntegrationRegistry::with_defaults(),
            drivers: FieldbusRegistry::with_defaults(&settings.fieldbus),
            watcher: Arc::new(NotifyWatcher::new()),
            probe: Box::new(SysinfoProbe::new()),
            settings,
        }
    }

    /// Starts the agent with the shipped drivers, providers, watcher and probe.
    pub fn start(settings: AgentSettings) -> Result<Self, FrameworkError> {
        Self::builder(settings).start()
    }

    pub fn bus(&self) -> &AgentBus {
        &self.bus
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// One status line per registered service, sorted by name.
    pub fn details(&self) -> Vec<String> {
        self.registry
            .names()
            .into_iter()
            .map(|name| {
                let dependencies = self.registry.dependencies(&name).unwrap_or_default();
                format!(
                    "Service: {} [Status: {}, Dependent Upon: ({})]",
                    name,
                    self.registry.state(&name),
                    dependencies.join(", ")
                )
            })
            .collect()
    }

    /// Stops the whole tree and waits for the master supervisor to finish draining.
    pub async fn shutdown(self) {
        info!("Shutting down edge agent");
        self.master.stop().await;

        let budget = self.settings.supervisor_spec().shutdown_timeout * 2 + SHUTDOWN_GRACE;
        match tokio::time::timeout(budget, self.task).await {
            Ok(Ok(())) => info!("Edge agent stopped"),
            Ok(Err(e)) => warn!(error = %e, "Master supervisor task failed"),
            Err(_) => warn!(timeout = ?budget, "Master supervisor did not finish in time"),
        }
    }
}
