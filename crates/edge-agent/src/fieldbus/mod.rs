//! # Field-bus Drivers
//!
//! The narrow interface the polling engine needs from a field-bus protocol, a registry
//! that picks the driver by connection class, and the register-map read cycle.
//!
//! ## Sessions
//!
//! A driver only knows how to open a [`FieldbusSession`]. The engine opens a fresh
//! session every poll cycle, reads every mapped register, and closes it again, so no
//! connection is ever held idle between cycles.
//!
//! ## Value decoding
//!
//! | Function | Read                | Decoded as                        |
//! |----------|---------------------|-----------------------------------|
//! | 2        | discrete inputs     | `Bit`: low bit of the first byte  |
//! | 1        | coils               | `Bit`: low bit of the first byte  |
//! | 3        | holding registers   | `Register`: big-endian `i16`      |
//! | 4        | input registers     | `Register`: big-endian `i16`      |
//!
//! Registers are read in that order, one address per entry.

pub mod modbus_tcp;

use crate::error::FieldbusError;
use crate::model::connectivity::class;
use crate::model::{MachineIntegration, SampleSet, SampleValue};
use crate::settings::FieldbusSettings;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use modbus_tcp::ModbusTcpDriver;

/// Protocol function codes for the four read classes.
pub mod function {
    pub const READ_COILS: u8 = 1;
    pub const READ_DISCRETE_INPUTS: u8 = 2;
    pub const READ_HOLDING_REGISTERS: u8 = 3;
    pub const READ_INPUT_REGISTERS: u8 = 4;
}

/// Order in which a cycle visits the read classes.
pub const READ_ORDER: [u8; 4] = [
    function::READ_DISCRETE_INPUTS,
    function::READ_COILS,
    function::READ_HOLDING_REGISTERS,
    function::READ_INPUT_REGISTERS,
];

#[async_trait]
pub trait FieldbusDriver: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn FieldbusSession>, FieldbusError>;
}

/// An open protocol session. Bit reads return packed bytes, register reads return
/// two big-endian bytes per register.
#[async_trait]
pub trait FieldbusSession: Send {
    async fn read_discrete_inputs(&mut self, address: u16, count: u16) -> Result<Vec<u8>, FieldbusError>;
    async fn read_coils(&mut self, address: u16, count: u16) -> Result<Vec<u8>, FieldbusError>;
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u8>, FieldbusError>;
    async fn read_input_registers(&mut self, address: u16, count: u16) -> Result<Vec<u8>, FieldbusError>;
    async fn close(&mut self) -> Result<(), FieldbusError>;
}

/// Drivers keyed by connection class (`modbusTCP`, ...).
#[derive(Clone, Default)]
pub struct FieldbusRegistry {
    drivers: HashMap<String, Arc<dyn FieldbusDriver>>,
}

impl FieldbusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in driver.
    pub fn with_defaults(settings: &FieldbusSettings) -> Self {
        let mut registry = Self::new();
        registry.register(class::MODBUS_TCP, Arc::new(ModbusTcpDriver::new(settings.unit_id)));
        registry
    }

    pub fn register(&mut self, class: impl Into<String>, driver: Arc<dyn FieldbusDriver>) {
        self.drivers.insert(class.into(), driver);
    }

    pub fn get(&self, class: &str) -> Result<Arc<dyn FieldbusDriver>, FieldbusError> {
        self.drivers
            .get(class)
            .cloned()
            .ok_or_else(|| FieldbusError::UnknownDriver(class.to_string()))
    }
}

/// Reads every mapped register once. Any failure discards the whole sample set.
pub async fn read_all(
    session: &mut dyn FieldbusSession,
    map: &MachineIntegration,
) -> Result<SampleSet, FieldbusError> {
    let mut samples = SampleSet::new();
    for code in READ_ORDER {
        for entry in map.find_by_function(&[code]) {
            let value = read_one(session, code, entry.address)
                .await
                .map_err(|source| FieldbusError::Read {
                    register: entry.register_name.clone(),
                    source: Box::new(source),
                })?;
            samples.insert(entry.register_name.clone(), value);
        }
    }
    Ok(samples)
}

async fn read_one(
    session: &mut dyn FieldbusSession,
    code: u8,
    address: u16,
) -> Result<SampleValue, FieldbusError> {
    match code {
        function::READ_DISCRETE_INPUTS => decode_bit(&session.read_discrete_inputs(address, 1).await?),
        function::READ_COILS => decode_bit(&session.read_coils(address, 1).await?),
        function::READ_HOLDING_REGISTERS => {
            bytes_to_i16(&session.read_holding_registers(address, 1).await?).map(SampleValue::Register)
        }
        function::READ_INPUT_REGISTERS => {
            bytes_to_i16(&session.read_input_registers(address, 1).await?).map(SampleValue::Register)
        }
        other => Err(FieldbusError::MalformedResponse(format!(
            "unsupported read function {other}"
        ))),
    }
}

fn decode_bit(bytes: &[u8]) -> Result<SampleValue, FieldbusError> {
    bytes
        .first()
        .map(|byte| SampleValue::Bit(byte & 0x01 == 0x01))
        .ok_or_else(|| FieldbusError::MalformedResponse("empty bit response".into()))
}

fn register_bytes(bytes: &[u8]) -> Result<[u8; 2], FieldbusError> {
    match bytes {
        [hi, lo, ..] => Ok([*hi, *lo]),
        _ => Err(FieldbusError::MalformedResponse(format!(
            "register needs 2 bytes, got {}",
            bytes.len()
        ))),
    }
}

pub fn bytes_to_u16(bytes: &[u8]) -> Result<u16, FieldbusError> {
    register_bytes(bytes).map(u16::from_be_bytes)
}

pub fn bytes_to_i16(bytes: &[u8]) -> Result<i16, FieldbusError> {
    register_bytes(bytes).map(i16::from_be_bytes)
}

pub fn u16_to_bytes(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}

pub fn i16_to_bytes(value: i16) -> [u8; 2] {
    value.to_be_bytes()
}
