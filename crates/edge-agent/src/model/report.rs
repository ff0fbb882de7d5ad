//! Bus payloads produced by the agent: health records and field-bus sample sets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Device self-health at a point in time. Ratios are in `[0, 1]`, except the load
/// average which is per-core and may exceed 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    #[serde(rename = "timeStamp")]
    pub timestamp: DateTime<Utc>,
    pub memory_consumed: f64,
    pub disk_consumed: f64,
    pub load_average: f64,
}

/// One decoded register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    Bit(bool),
    Register(i16),
}

impl fmt::Display for SampleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleValue::Bit(bit) => write!(f, "{bit}"),
            SampleValue::Register(value) => write!(f, "{value}"),
        }
    }
}

/// Register name → value, collected in one poll cycle.
pub type SampleSet = BTreeMap<String, SampleValue>;
