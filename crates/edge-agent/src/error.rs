//! # Agent Errors
//!
//! One enum per concern. None of these ever reach the user directly: configuration
//! errors are logged and the previous document kept, link errors end the owning
//! service's `run()` so supervision restarts it, and per-sink errors are logged and
//! skipped.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration path is empty")]
    EmptyPath,
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// The watch subsystem failed; the configuration service pauses and exits.
    #[error("watching {path} failed: {reason}")]
    Watch { path: PathBuf, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum FieldbusError {
    #[error("connecting to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },
    #[error("field-bus I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The device answered with a Modbus exception response.
    #[error("function {function:#04x} returned exception code {code:#04x}")]
    Exception { function: u8, code: u8 },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("field-bus not configured: {0}")]
    NotConfigured(String),
    #[error("no field-bus driver registered for class {0}")]
    UnknownDriver(String),
    #[error("reading {register} failed: {source}")]
    Read {
        register: String,
        #[source]
        source: Box<FieldbusError>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum IntegrationError {
    #[error("{0} is not connected")]
    NotConnected(String),
    #[error("{0} endpoint is not set")]
    MissingEndpoint(String),
    #[error("no integration registered for provider {0}")]
    UnknownProvider(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("MQTT request rejected: {0}")]
    MqttClient(#[from] rumqttc::ClientError),
    #[error("MQTT connection error: {0}")]
    MqttConnection(#[from] rumqttc::ConnectionError),
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, thiserror::Error)]
#[error("invalid agent settings: {0}")]
pub struct SettingsError(#[from] pub config::ConfigError);
