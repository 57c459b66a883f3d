use crate::ManifestError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

/// A module's declarative container template.
///
/// Every field except `image` is optional. Unknown keys are ignored so module
/// authors can keep unrelated settings in the same table.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ContainerTemplate {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub restart: Option<String>,
    #[serde(default)]
    pub network_mode: Option<String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, Value>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub cpu_limit: Option<LimitValue>,
    #[serde(default)]
    pub memory_limit: Option<LimitValue>,
}

impl ContainerTemplate {
    /// Interpret a JSON object from a hook request. Non-objects and empty
    /// objects yield `None`.
    pub fn from_value(value: &Value) -> Result<Option<Self>, ManifestError> {
        match value {
            Value::Object(map) if !map.is_empty() => {
                Ok(Some(serde_json::from_value(value.clone())?))
            }
            _ => Ok(None),
        }
    }

    /// The image, if set and non-empty.
    pub fn image(&self) -> Option<&str> {
        non_empty(self.image.as_deref())
    }

    pub fn has_image(&self) -> bool {
        self.image().is_some()
    }

    /// Whether the image string references `placeholder` (e.g. `{java_version}`).
    pub fn image_mentions(&self, placeholder: &str) -> bool {
        self.image().is_some_and(|i| i.contains(placeholder))
    }
}

pub(crate) fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|v| !v.is_empty())
}

/// A resource limit as written by the module: `2`, `1.5`, or `"4g"`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum LimitValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for LimitValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "{n}"),
            Self::Float(x) if x.fract() == 0.0 && x.is_finite() => write!(f, "{x:.1}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModuleFile {
    #[serde(default)]
    container: Option<ContainerTemplate>,
    #[serde(default)]
    docker: Option<ContainerTemplate>,
}

/// Parse the `[container]` (preferred) or `[docker]` table of a module TOML file.
pub fn parse_template_str(input: &str) -> Result<ContainerTemplate, ManifestError> {
    let file: ModuleFile = toml::from_str(input)?;
    file.container
        .or(file.docker)
        .ok_or(ManifestError::MissingSection)
}

pub fn parse_template_file(path: impl AsRef<Path>) -> Result<ContainerTemplate, ManifestError> {
    let content = fs::read_to_string(path)?;
    parse_template_str(&content)
}
