//! # Agent Services
//!
//! The supervised services that make up the agent. Each owns a
//! [`Lifecycle`](agent_framework::Lifecycle) and talks to the others only through the
//! bus and the shared [`ConfigStore`](crate::config_store::ConfigStore).
//!
//! ```text
//! ConfigService ──► asset / equipment / connectivity changed
//! StateService  ──► state report ─┐
//! ModbusTcp     ──► ops report  ──┴─► IntegrationsService ──► sinks
//! ```

pub mod config;
pub mod fieldbus;
pub mod integrations;
pub mod state;

pub use config::ConfigService;
pub use fieldbus::FieldbusService;
pub use integrations::IntegrationsService;
pub use state::StateService;

/// Registered service names.
pub mod names {
    pub const MASTER_SUPERVISOR: &str = "MasterSupervisor";
    pub const CONFIG: &str = "ConfigService";
    pub const INTEGRATIONS: &str = "IntegrationsService";
    pub const STATE: &str = "StateService";
    pub const FIELDBUS_SUPERVISOR: &str = "FieldbusSupervisor";
    pub const MODBUS_TCP: &str = "ModbusTCPService";
}
