//! Connectivity document: where data goes and which field-bus links to poll.

use serde::{Deserialize, Serialize};

/// Field-bus connection classes.
pub mod class {
    pub const MODBUS: &str = "modbus";
    pub const MODBUS_TCP: &str = "modbusTCP";
    pub const MODBUS_RTU: &str = "modbusRTU";
    pub const OPCUA: &str = "OPCUA";
}

/// Outbound integration providers.
pub mod provider {
    pub const INITIAL_STATE: &str = "InitialState";
    pub const GENERIC_MQTT: &str = "GenericMQTT";
}

/// One outbound sink or one field-bus link.
///
/// For field-bus links `class` selects the driver; for sinks `provider` does.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionRecord {
    pub provider: String,
    #[serde(rename = "type")]
    pub class: String,
    pub endpoint: String,
    pub port: u16,
    pub protocol: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub provider_key: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub baud_rate: u32,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Connectivity {
    pub device_id: String,
    /// Sinks for device health records.
    pub device_state: Vec<ConnectionRecord>,
    pub historian: Vec<ConnectionRecord>,
    /// Field-bus links.
    pub machine_integration: Vec<ConnectionRecord>,
    /// Sinks for telemetry sample sets.
    pub machine_operations_and_telemetry: Vec<ConnectionRecord>,
}

impl Connectivity {
    /// True until a document with a `deviceId` has been loaded.
    pub fn is_empty(&self) -> bool {
        self.device_id.is_empty()
    }

    /// First field-bus link of the given class.
    pub fn machine_connection(&self, class: &str) -> Option<&ConnectionRecord> {
        self.machine_integration
            .iter()
            .find(|record| record.class == class)
    }
}
