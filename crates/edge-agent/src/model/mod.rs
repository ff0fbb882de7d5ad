//! # Domain Model
//!
//! The three configuration documents (asset identity, equipment register map,
//! connectivity) and the two bus payloads (health record, sample set).
//!
//! Every document field defaults, so a partial or empty document still parses; a
//! document that has never loaded is simply the zero value.

pub mod asset;
pub mod connectivity;
pub mod equipment;
pub mod report;

pub use asset::Asset;
pub use connectivity::{ConnectionRecord, Connectivity};
pub use equipment::{Equipment, MachineIntegration, RegisterClass, RegisterEntry};
pub use report::{HealthRecord, SampleSet, SampleValue};
