use serde::{Deserialize, Serialize};

/// Identity of the machine this agent is mounted on.
///
/// Also used as the tag block on every outbound message, so empty optional fields
/// are left out of the serialized form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Asset {
    pub machine_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub serial: String,
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub entity: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub location: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub line: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub work_center: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fields_are_omitted() {
        let asset: Asset =
            serde_json::from_str(r#"{"machineId": "press-7", "entity": "acme.com"}"#).unwrap();
        assert_eq!(asset.machine_id, "press-7");

        let json = serde_json::to_value(&asset).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"machineId": "press-7", "entity": "acme.com"})
        );
    }
}
