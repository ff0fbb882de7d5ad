//! # Bus Vocabulary
//!
//! The agent's closed set of topics and the one payload type each carries.
//!
//! | Topic                  | Producer         | Payload         |
//! |------------------------|------------------|-----------------|
//! | `AssetConfigUpdated`   | Config service   | [`ConfigChange`]|
//! | `EquipmentConfigUpdated` | Config service | [`ConfigChange`]|
//! | `ConnectivityConfigUpdate` | Config service | [`ConfigChange`]|
//! | `TopicStateReport`     | State service    | [`HealthRecord`]|
//! | `TopicOpsReport`       | Field-bus engine | [`SampleSet`]   |

use crate::model::{HealthRecord, SampleSet};
use agent_framework::bus::{EventBus, Message};
use std::fmt;
use std::path::PathBuf;

pub type AgentBus = EventBus<AgentMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentTopic {
    AssetChanged,
    EquipmentChanged,
    ConnectivityChanged,
    StateReport,
    OpsReport,
}

impl AgentTopic {
    pub const ALL: [AgentTopic; 5] = [
        AgentTopic::AssetChanged,
        AgentTopic::EquipmentChanged,
        AgentTopic::ConnectivityChanged,
        AgentTopic::StateReport,
        AgentTopic::OpsReport,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentTopic::AssetChanged => "AssetConfigUpdated",
            AgentTopic::EquipmentChanged => "EquipmentConfigUpdated",
            AgentTopic::ConnectivityChanged => "ConnectivityConfigUpdate",
            AgentTopic::StateReport => "TopicStateReport",
            AgentTopic::OpsReport => "TopicOpsReport",
        }
    }
}

impl fmt::Display for AgentTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of file-system change that triggered a reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChangeKind::Created => "CREATE",
            ChangeKind::Modified => "WRITE",
            ChangeKind::Removed => "REMOVE",
        };
        f.write_str(label)
    }
}

/// A change on disk to one configuration document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    AssetChanged(ConfigChange),
    EquipmentChanged(ConfigChange),
    ConnectivityChanged(ConfigChange),
    StateReport(HealthRecord),
    OpsReport(SampleSet),
}

impl Message for AgentMessage {
    type Topic = AgentTopic;

    fn topic(&self) -> AgentTopic {
        match self {
            AgentMessage::AssetChanged(_) => AgentTopic::AssetChanged,
            AgentMessage::EquipmentChanged(_) => AgentTopic::EquipmentChanged,
            AgentMessage::ConnectivityChanged(_) => AgentTopic::ConnectivityChanged,
            AgentMessage::StateReport(_) => AgentTopic::StateReport,
            AgentMessage::OpsReport(_) => AgentTopic::OpsReport,
        }
    }
}
