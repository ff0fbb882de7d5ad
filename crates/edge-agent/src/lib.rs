//! # Edge Agent
//!
//! A supervised agent for industrial equipment: it polls a machine's field-bus
//! registers, samples its own health, and fans both out to cloud and broker sinks
//! described in hot-reloaded configuration files.
//!
//! ## Data flow
//!
//! ```text
//!  asset.json ─┐
//!  equipment ──┼─► ConfigService ──► *Changed topics ──► IntegrationsService (rebuild)
//!  connections ┘        │
//!                       ▼ ConfigStore
//!  ModbusTCPService ── ops report ────┐
//!  StateService ────── state report ──┴─► IntegrationsService ──► GenericMQTT / InitialState
//! ```
//!
//! Services are built on [`agent_framework`]: each runs in its own task under a
//! supervisor and never calls another service directly.
//!
//! ## Modules
//!
//! - [`model`] and [`config_store`]: the three configuration documents and their
//!   shared, reloadable store.
//! - [`fieldbus`]: driver seam plus the Modbus TCP client.
//! - [`integrations`]: sink seam plus the GenericMQTT and InitialState clients.
//! - [`services`]: the supervised services.
//! - [`system`]: assembles and starts the tree.
//! - [`mock`]: scripted drivers and recording sinks for tests.

pub mod config_store;
pub mod error;
pub mod fieldbus;
pub mod health;
pub mod integrations;
pub mod messages;
pub mod mock;
pub mod model;
pub mod services;
pub mod settings;
pub mod system;
pub mod watcher;

pub use config_store::{ConfigPaths, ConfigStore};
pub use messages::{AgentBus, AgentMessage, AgentTopic};
pub use settings::AgentSettings;
pub use system::{EdgeSystem, EdgeSystemBuilder};
