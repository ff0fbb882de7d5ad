//! Equipment document: what the machine is and how its registers are mapped.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Language code → text.
pub type LangMap = BTreeMap<String, String>;

/// Access class of a register. Several entries usually share one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterClass {
    State,
    Control,
    Telemetry,
    #[default]
    #[serde(other)]
    Other,
}

/// One named field-bus register.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterEntry {
    pub register_name: String,
    pub address: u16,
    pub class: RegisterClass,
    pub desc: LangMap,
    /// Protocol function codes this register responds to.
    pub functions: Vec<u8>,
}

impl RegisterEntry {
    /// Description in `lang`, falling back to English, then the register name.
    pub fn description(&self, lang: &str) -> &str {
        self.desc
            .get(lang)
            .or_else(|| self.desc.get("en"))
            .map(String::as_str)
            .unwrap_or(&self.register_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineIntegration {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub modbus: Vec<RegisterEntry>,
}

impl MachineIntegration {
    /// Entries answering any of `functions`, grouped by requested code in request order,
    /// then by declaration order. An entry matching two requested codes appears twice.
    pub fn find_by_function(&self, functions: &[u8]) -> Vec<&RegisterEntry> {
        functions
            .iter()
            .flat_map(|code| {
                self.modbus.iter().flat_map(move |entry| {
                    entry
                        .functions
                        .iter()
                        .filter(move |f| *f == code)
                        .map(move |_| entry)
                })
            })
            .collect()
    }

    pub fn find_by_class(&self, class: RegisterClass) -> Vec<&RegisterEntry> {
        self.modbus
            .iter()
            .filter(|entry| entry.class == class)
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorCode {
    pub code: String,
    pub desc: LangMap,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Maintenance {
    pub id: String,
    pub title: LangMap,
    pub desc: LangMap,
    pub interval: String,
    pub uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Equipment {
    #[serde(rename = "ref")]
    pub reference: String,
    pub uri: String,
    pub entity: String,
    pub models: Vec<String>,
    pub versions: Vec<String>,
    pub desc: LangMap,
    pub machine_integration: MachineIntegration,
    pub error_codes: Vec<ErrorCode>,
    pub maintenance: Vec<Maintenance>,
}

impl Equipment {
    /// True until a document with a `ref` has been loaded.
    pub fn is_empty(&self) -> bool {
        self.reference.is_empty()
    }

    pub fn registers(&self) -> &[RegisterEntry] {
        &self.machine_integration.modbus
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const EQUIPMENT_FIXTURE: &str = r#"{
      "ref": "http://machineconfig.example.com/test-equipment-a-1.json",
      "entity": "example.com",
      "uri": "http://example.com/productpage/testequipment",
      "desc": { "en": "Equipment used for testing", "jp": "テスト用の機器" },
      "models": ["A"],
      "versions": ["1"],
      "machineIntegration": {
        "modbus": [
          { "registerName": "TankFull", "functions": [2], "address": 0, "class": "state",
            "desc": { "en": "Tank full" } },
          { "registerName": "TankEmpty", "functions": [2], "address": 1, "class": "state",
            "desc": { "en": "Tank empty" } },
          { "registerName": "CommandPump", "functions": [1, 5], "address": 0, "class": "control",
            "desc": { "en": "Command pump" } },
          { "registerName": "SystemRun", "functions": [3, 6], "address": 0, "class": "control",
            "desc": { "en": "System run control" } },
          { "registerName": "LiquidTemp", "functions": [4], "address": 0, "class": "telemetry",
            "desc": { "en": "Liquid temp" } }
        ]
      },
      "errorCodes": [ { "code": "XXX", "desc": { "en": "Lorem ipsum" } } ],
      "maintenance": [
        { "id": "XXX", "interval": "30d", "title": { "en": "Clean filters" },
          "desc": { "en": "Lorem ipsum" }, "uri": "http://example.com/watch/XXX" }
      ]
    }"#;

    fn fixture() -> Equipment {
        serde_json::from_str(EQUIPMENT_FIXTURE).unwrap()
    }

    fn names(entries: &[&RegisterEntry]) -> Vec<String> {
        entries.iter().map(|e| e.register_name.clone()).collect()
    }

    #[test]
    fn loads_register_map_and_descriptions() {
        let equipment = fixture();
        assert_eq!(equipment.registers().len(), 5);
        assert_eq!(equipment.desc.len(), 2);
        assert_eq!(equipment.desc["jp"], "テスト用の機器");
        assert_eq!(equipment.maintenance[0].interval, "30d");
        assert!(!equipment.is_empty());
    }

    #[test]
    fn find_by_function_follows_request_order() {
        let integration = fixture().machine_integration;

        assert_eq!(
            names(&integration.find_by_function(&[2])),
            vec!["TankFull", "TankEmpty"]
        );
        assert_eq!(
            names(&integration.find_by_function(&[4, 6])),
            vec!["LiquidTemp", "SystemRun"]
        );
        assert_eq!(names(&integration.find_by_function(&[1])), vec!["CommandPump"]);
        assert_eq!(
            names(&integration.find_by_function(&[1, 5])),
            vec!["CommandPump", "CommandPump"]
        );
        assert!(integration.find_by_function(&[16]).is_empty());
    }

    #[test]
    fn find_by_class_keeps_declaration_order() {
        let integration = fixture().machine_integration;
        assert_eq!(
            names(&integration.find_by_class(RegisterClass::State)),
            vec!["TankFull", "TankEmpty"]
        );
        assert_eq!(integration.find_by_class(RegisterClass::Telemetry).len(), 1);
    }

    #[test]
    fn unknown_class_is_tolerated() {
        let entry: RegisterEntry =
            serde_json::from_str(r#"{"registerName": "X", "class": "alarm"}"#).unwrap();
        assert_eq!(entry.class, RegisterClass::Other);
        assert_eq!(entry.description("fr"), "X");
    }
}
