use crate::template::LimitValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Per-instance values substituted into a container template.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct InstanceContext {
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub instance_name: String,
    #[serde(default)]
    pub module_name: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub rcon_port: Option<u16>,
    #[serde(default)]
    pub rest_port: Option<u16>,
    #[serde(default)]
    pub rest_password: Option<String>,
    #[serde(default)]
    pub module_settings: BTreeMap<String, Value>,
    #[serde(default)]
    pub overrides: ResourceOverrides,
}

/// Instance-level resource limits; each one wins over the module default.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ResourceOverrides {
    #[serde(default)]
    pub cpu_limit: Option<LimitValue>,
    #[serde(default)]
    pub memory_limit: Option<LimitValue>,
}

/// Values known only at provisioning time.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ExtraContext {
    /// Runtime-version hint for images such as `eclipse-temurin:{java_version}-jre`.
    #[serde(default)]
    pub java_version: Option<String>,
}

impl ExtraContext {
    pub fn with_java_version(version: impl Into<String>) -> Self {
        Self {
            java_version: Some(version.into()),
        }
    }
}

/// Plain-text rendering of a setting value, as it appears after substitution.
pub(crate) fn setting_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
