//! # Agent Settings
//!
//! Process-level knobs, read once at start-up. Only the three configuration documents
//! are hot-reloaded; these are not.
//!
//! Sources, lowest precedence first:
//!
//! 1. built-in defaults ([`AgentSettings::default`]),
//! 2. an optional file named by `EDGE_AGENT_SETTINGS` (format inferred from extension),
//! 3. environment variables prefixed `EDGE_AGENT`, nested with `__`:
//!
//! ```bash
//! EDGE_AGENT__CONFIG_DIR=/srv/agent/conf
//! EDGE_AGENT__FIELDBUS__SAMPLE_INTERVAL_MS=1000
//! EDGE_AGENT__SUPERVISOR__FAILURE_THRESHOLD=5
//! ```

use crate::error::SettingsError;
use agent_framework::SupervisorSpec;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const SETTINGS_FILE_VAR: &str = "EDGE_AGENT_SETTINGS";
const ENV_PREFIX: &str = "EDGE_AGENT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub config_dir: PathBuf,
    pub asset_file: String,
    pub equipment_file: String,
    pub connectivity_file: String,
    pub dependency_timeout_ms: u64,
    pub bus_capacity: usize,
    pub fieldbus: FieldbusSettings,
    pub state: StateSettings,
    pub integrations: IntegrationSettings,
    pub start_delays: StartDelays,
    pub supervisor: SupervisorSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldbusSettings {
    pub sample_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub unit_id: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSettings {
    pub report_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationSettings {
    pub idle_interval_ms: u64,
    pub request_timeout_ms: u64,
}

/// Per-service start delays in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartDelays {
    pub config: u64,
    pub integrations: u64,
    pub state: u64,
    pub modbus: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub failure_threshold: f64,
    pub failure_decay_secs: u64,
    pub failure_backoff_secs: u64,
    pub shutdown_timeout_ms: u64,
}

fn default_config_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        PathBuf::from("/etc/opt/edge-agent")
    } else {
        PathBuf::from("conf")
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            asset_file: "asset.json".to_string(),
            equipment_file: "equipment.json".to_string(),
            connectivity_file: "connections.json".to_string(),
            dependency_timeout_ms: 10_000,
            bus_capacity: agent_framework::bus::DEFAULT_CAPACITY,
            fieldbus: FieldbusSettings::default(),
            state: StateSettings::default(),
            integrations: IntegrationSettings::default(),
            start_delays: StartDelays::default(),
            supervisor: SupervisorSettings::default(),
        }
    }
}

impl Default for FieldbusSettings {
    fn default() -> Self {
        Self {
            sample_interval_ms: 5_000,
            connect_timeout_ms: 5_000,
            unit_id: 1,
        }
    }
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            report_interval_ms: 60_000,
        }
    }
}

impl Default for IntegrationSettings {
    fn default() -> Self {
        Self {
            idle_interval_ms: 60_000,
            request_timeout_ms: 5_000,
        }
    }
}

impl Default for StartDelays {
    fn default() -> Self {
        Self {
            config: 500,
            integrations: 100,
            state: 1_000,
            modbus: 1_000,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3.0,
            failure_decay_secs: 30,
            failure_backoff_secs: 15,
            shutdown_timeout_ms: 1_000,
        }
    }
}

impl AgentSettings {
    /// Layers the settings file named by `EDGE_AGENT_SETTINGS` (if any) and
    /// `EDGE_AGENT__*` environment variables over the defaults.
    pub fn load() -> Result<Self, SettingsError> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(SETTINGS_FILE_VAR) {
            builder = builder.add_source(config::File::with_name(&path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn asset_path(&self) -> PathBuf {
        self.config_dir.join(&self.asset_file)
    }

    pub fn equipment_path(&self) -> PathBuf {
        self.config_dir.join(&self.equipment_file)
    }

    pub fn connectivity_path(&self) -> PathBuf {
        self.config_dir.join(&self.connectivity_file)
    }

    pub fn dependency_timeout(&self) -> Duration {
        Duration::from_millis(self.dependency_timeout_ms)
    }

    pub fn supervisor_spec(&self) -> SupervisorSpec {
        SupervisorSpec {
            failure_threshold: self.supervisor.failure_threshold,
            failure_decay: Duration::from_secs(self.supervisor.failure_decay_secs),
            failure_backoff: Duration::from_secs(self.supervisor.failure_backoff_secs),
            shutdown_timeout: Duration::from_millis(self.supervisor.shutdown_timeout_ms),
        }
    }
}

impl FieldbusSettings {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl StateSettings {
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

impl IntegrationSettings {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl StartDelays {
    pub fn config(&self) -> Duration {
        Duration::from_millis(self.config)
    }

    pub fn integrations(&self) -> Duration {
        Duration::from_millis(self.integrations)
    }

    pub fn state(&self) -> Duration {
        Duration::from_millis(self.state)
    }

    pub fn modbus(&self) -> Duration {
        Duration::from_millis(self.modbus)
    }
}
