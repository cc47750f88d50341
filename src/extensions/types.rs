// Extension System Data Types
//
// Defines the structures exchanged with extension code: the descriptor and
// its declared configuration parameters, the source catalog, and the
// outbound request descriptors produced by destinations.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Extension metadata exported as `descriptor`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionDescriptor {
    pub id: String,
    #[serde(alias = "displayName", default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(alias = "configurationParameters", default)]
    pub configuration_parameters: Vec<ConfigParam>,
}

/// A configuration parameter declared by a descriptor or a stream instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigParam {
    pub id: String,
    #[serde(alias = "displayName", default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(alias = "defaultValue", default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub documentation: Option<String>,
}

impl ConfigParam {
    /// Fill the declared default into `values` when the key is absent
    pub fn apply_default(&self, values: &mut Map<String, Value>) {
        if values.contains_key(&self.id) {
            return;
        }
        if let Some(default) = &self.default_value {
            values.insert(self.id.clone(), default.clone());
        }
    }

    pub fn is_missing(&self, values: &Map<String, Value>) -> bool {
        self.required && values.get(&self.id).map_or(true, Value::is_null)
    }
}

/// What kind of extension an artifact implements
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionKind {
    Source,
    Destination,
}

/// How a source stream is synchronized
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SyncMode {
    #[serde(rename = "full_sync")]
    FullSync,
    #[serde(rename = "incremental")]
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::FullSync => "full_sync",
            SyncMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One element of the catalog returned by `sourceCatalog(config)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInstance {
    #[serde(rename = "type")]
    pub stream_type: String,
    #[serde(alias = "supportedModes", default)]
    pub supported_modes: Vec<SyncMode>,
    #[serde(default)]
    pub params: Vec<ConfigParam>,
}

/// Options handed to `streamReader` alongside the stream type
#[derive(Debug, Clone, Serialize)]
pub struct StreamOptions {
    pub mode: SyncMode,
    pub parameters: Map<String, Value>,
}

/// Context handed to a destination's transform function
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationContext {
    pub destination_id: String,
    pub destination_type: String,
    pub config: Value,
}

/// Outbound HTTP request descriptor produced by a destination
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DestinationMessage {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub body: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_instance_accepts_camel_case() {
        let instance: StreamInstance = serde_json::from_value(json!({
            "type": "issues",
            "supportedModes": ["full_sync", "incremental"],
            "params": [{ "id": "repo", "required": true }]
        }))
        .unwrap();

        assert_eq!(instance.stream_type, "issues");
        assert_eq!(instance.supported_modes, vec![SyncMode::FullSync, SyncMode::Incremental]);
        assert!(instance.params[0].required);
    }

    #[test]
    fn test_config_param_defaults() {
        let param = ConfigParam {
            id: "pageSize".to_string(),
            display_name: None,
            required: true,
            default_value: Some(json!(100)),
            documentation: None,
        };
        let mut values = Map::new();
        assert!(param.is_missing(&values));
        param.apply_default(&mut values);
        assert_eq!(values["pageSize"], json!(100));
        assert!(!param.is_missing(&values));
    }

    #[test]
    fn test_destination_context_serializes_camel_case() {
        let ctx = DestinationContext {
            destination_id: "d1".to_string(),
            destination_type: "webhook".to_string(),
            config: json!({}),
        };
        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value["destinationId"], "d1");
        assert_eq!(value["destinationType"], "webhook");
    }
}
