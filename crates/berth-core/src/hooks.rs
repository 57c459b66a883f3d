//! Hook names, request shapes and response payloads.
//!
//! Requests arrive as loosely-typed JSON from the workload daemon. Every
//! field is optional at the serde level; operations that need a field report
//! `InvalidRequest` themselves. Responses always carry `handled` and
//! `success`.

use crate::orchestrator::Orchestrator;
use crate::CoreError;
use berth_schema::{
    container_name, ContainerName, ContainerTemplate, InstanceContext, LimitValue,
    ResourceOverrides,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Start,
    Stop,
    Cleanup,
    Status,
    ContainerStats,
    ShutdownAll,
    EnrichServerInfo,
    GetLogs,
    PreCreate,
    Provision,
    RegenerateCompose,
}

impl Hook {
    pub const ALL: [Self; 11] = [
        Self::Start,
        Self::Stop,
        Self::Cleanup,
        Self::Status,
        Self::ContainerStats,
        Self::ShutdownAll,
        Self::EnrichServerInfo,
        Self::GetLogs,
        Self::PreCreate,
        Self::Provision,
        Self::RegenerateCompose,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Cleanup => "cleanup",
            Self::Status => "status",
            Self::ContainerStats => "container_stats",
            Self::ShutdownAll => "shutdown_all",
            Self::EnrichServerInfo => "enrich_server_info",
            Self::GetLogs => "get_logs",
            Self::PreCreate => "pre_create",
            Self::Provision => "provision",
            Self::RegenerateCompose => "regenerate_compose",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Hook {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|h| h.as_str() == s)
            .ok_or_else(|| CoreError::InvalidRequest(format!("unknown hook: {s}")))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ExtensionData {
    #[serde(default)]
    pub docker_enabled: bool,
    #[serde(default)]
    pub docker_cpu_limit: Option<Value>,
    #[serde(default)]
    pub docker_memory_limit: Option<Value>,
}

/// The fields every per-instance hook understands.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct InstanceRequest {
    #[serde(default)]
    pub instance_dir: Option<PathBuf>,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub module_name: Option<String>,
    #[serde(default)]
    pub process_patterns: Vec<String>,
    #[serde(default)]
    pub extension_data: ExtensionData,
    /// Log lines requested by `get_logs`.
    #[serde(default)]
    pub lines: Option<usize>,
}

impl InstanceRequest {
    /// The instance directory, `None` when absent or empty.
    pub fn dir(&self) -> Option<&Path> {
        self.instance_dir
            .as_deref()
            .filter(|d| !d.as_os_str().is_empty())
    }

    pub fn require_dir(&self) -> Result<&Path, CoreError> {
        self.dir()
            .ok_or_else(|| CoreError::InvalidRequest("instance_dir not provided".to_owned()))
    }

    pub fn module(&self) -> Option<&str> {
        self.module
            .as_deref()
            .or(self.module_name.as_deref())
            .filter(|m| !m.is_empty())
    }

    /// Container name derived from module and id, falling back to the
    /// instance directory's name when either is missing.
    pub fn container_name(&self) -> Option<ContainerName> {
        match self.module() {
            Some(module) if !self.instance_id.is_empty() => {
                Some(container_name(module, &self.instance_id))
            }
            _ => self
                .dir()
                .and_then(Path::file_name)
                .map(|n| ContainerName::new(n.to_string_lossy())),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShutdownAllRequest {
    #[serde(default)]
    pub instances: Vec<InstanceRequest>,
}

/// Engine settings carried by `provision` and the `engine` commands.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    /// Download budget in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub wait_timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct InstallSpec {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub app_id: Option<Value>,
    #[serde(default)]
    pub anonymous: Option<bool>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub beta: Option<String>,
}

impl InstallSpec {
    pub fn app_id(&self) -> Option<String> {
        scalar_text(self.app_id.as_ref())
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ModuleInstall {
    #[serde(default)]
    pub install: InstallSpec,
    #[serde(default)]
    pub container: Option<Value>,
    #[serde(default)]
    pub docker: Option<Value>,
}

impl ModuleInstall {
    /// The `container` table, else the `docker` table.
    pub fn template(&self) -> Result<Option<ContainerTemplate>, CoreError> {
        first_template([self.container.as_ref(), self.docker.as_ref()])
    }
}

fn first_template<'a>(
    candidates: impl IntoIterator<Item = Option<&'a Value>>,
) -> Result<Option<ContainerTemplate>, CoreError> {
    for value in candidates.into_iter().flatten() {
        if let Some(template) = ContainerTemplate::from_value(value)? {
            return Ok(Some(template));
        }
    }
    Ok(None)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvisionRequest {
    #[serde(flatten)]
    pub target: InstanceRequest,
    #[serde(default)]
    pub module_install: ModuleInstall,
    #[serde(default)]
    pub docker_engine_config: EngineConfig,
    /// Instance data used for rendering: `instance`, else the request itself.
    #[serde(skip)]
    pub instance: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegenerateRequest {
    #[serde(flatten)]
    pub target: InstanceRequest,
    #[serde(default)]
    pub module_extensions: Map<String, Value>,
    #[serde(default)]
    pub module_config: Map<String, Value>,
    #[serde(default)]
    pub java_version: Option<Value>,
    #[serde(skip)]
    pub instance: Value,
}

impl RegenerateRequest {
    /// `module_extensions.docker`, else `module_config.container` or `.docker`.
    pub fn template(&self) -> Result<Option<ContainerTemplate>, CoreError> {
        first_template([
            self.module_extensions.get("docker"),
            self.module_config.get("container"),
            self.module_config.get("docker"),
        ])
    }

    pub fn java_version(&self) -> Option<String> {
        scalar_text(self.java_version.as_ref())
    }
}

fn instance_data(raw: &Value) -> Value {
    raw.get("instance")
        .filter(|v| v.is_object())
        .unwrap_or(raw)
        .clone()
}

fn parse<T: for<'de> Deserialize<'de>>(raw: &Value) -> Result<T, CoreError> {
    serde_json::from_value(raw.clone())
        .map_err(|e| CoreError::InvalidRequest(format!("malformed request: {e}")))
}

impl ProvisionRequest {
    pub fn from_value(raw: &Value) -> Result<Self, CoreError> {
        let mut req: Self = parse(raw)?;
        req.instance = instance_data(raw);
        Ok(req)
    }
}

impl RegenerateRequest {
    pub fn from_value(raw: &Value) -> Result<Self, CoreError> {
        let mut req: Self = parse(raw)?;
        req.instance = instance_data(raw);
        Ok(req)
    }
}

pub(crate) fn scalar_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text_field(data: &Value, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|k| data.get(*k).and_then(Value::as_str).filter(|s| !s.is_empty()))
        .unwrap_or_default()
        .to_owned()
}

fn port_field(data: &Value, key: &str) -> Option<u16> {
    match data.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn limit_field(ext: Option<&Value>, key: &str) -> Option<LimitValue> {
    let value = ext?.get(key)?;
    serde_json::from_value(value.clone()).ok()
}

/// Build the substitution context from instance data, accepting both the
/// long (`instance_id`, `instance_name`, `module_name`) and short (`id`,
/// `name`, `module`) spellings.
pub fn instance_context(data: &Value) -> InstanceContext {
    let ext = data.get("extension_data");
    InstanceContext {
        instance_id: text_field(data, &["instance_id", "id"]),
        instance_name: text_field(data, &["instance_name", "name"]),
        module_name: text_field(data, &["module_name", "module"]),
        port: port_field(data, "port"),
        rcon_port: port_field(data, "rcon_port"),
        rest_port: port_field(data, "rest_port"),
        rest_password: data
            .get("rest_password")
            .and_then(Value::as_str)
            .map(str::to_owned),
        module_settings: data
            .get("module_settings")
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default(),
        overrides: ResourceOverrides {
            cpu_limit: limit_field(ext, "docker_cpu_limit"),
            memory_limit: limit_field(ext, "docker_memory_limit"),
        },
    }
}

/// `{"handled": true, "success": true, ...body}`.
pub fn success_payload<T: Serialize>(body: &T) -> Value {
    let mut payload = json!({"handled": true, "success": true});
    if let (Some(out), Ok(Value::Object(fields))) =
        (payload.as_object_mut(), serde_json::to_value(body))
    {
        out.extend(fields);
    }
    payload
}

/// Failure payload with whatever diagnostics the error carries.
pub fn error_payload(err: &CoreError) -> Value {
    let mut payload = json!({
        "handled": true,
        "success": false,
        "error": err.to_string(),
    });
    if let Some(out) = payload.as_object_mut() {
        match err {
            CoreError::ContainerNotRunning { state, logs } => {
                out.insert("container_state".to_owned(), Value::from(state.as_str()));
                out.insert("initial_logs".to_owned(), Value::from(logs.as_str()));
            }
            other => {
                if let Some(tail) = other.log_tail() {
                    out.insert("dockerd_log_tail".to_owned(), Value::from(tail));
                }
                if other.needs_reboot() {
                    out.insert("needs_reboot".to_owned(), Value::Bool(true));
                }
            }
        }
    }
    payload
}

fn respond<T: Serialize>(result: Result<T, CoreError>) -> Value {
    match result {
        Ok(body) => success_payload(&body),
        Err(e) => {
            if e.is_engine_failure() {
                warn!("{e}");
            } else {
                debug!("{e}");
            }
            error_payload(&e)
        }
    }
}

/// Run `hook` against `request` and build its response payload.
pub fn dispatch(orchestrator: &Orchestrator, hook: Hook, request: &Value) -> Value {
    let instance = || parse::<InstanceRequest>(request);
    match hook {
        Hook::Start => respond(instance().and_then(|r| orchestrator.start(&r))),
        Hook::Stop => respond(instance().and_then(|r| orchestrator.stop(&r))),
        Hook::Cleanup => respond(instance().and_then(|r| orchestrator.cleanup(&r))),
        Hook::Status => respond(instance().and_then(|r| orchestrator.status(&r))),
        Hook::ContainerStats => {
            respond(instance().and_then(|r| orchestrator.container_stats(&r)))
        }
        Hook::ShutdownAll => respond(
            parse::<ShutdownAllRequest>(request).map(|r| orchestrator.shutdown_all(&r)),
        ),
        Hook::EnrichServerInfo => {
            respond(instance().map(|r| orchestrator.enrich_server_info(&r)))
        }
        Hook::GetLogs => respond(instance().and_then(|r| orchestrator.get_logs(&r))),
        Hook::PreCreate => orchestrator.pre_create(),
        Hook::Provision => respond(
            ProvisionRequest::from_value(request).and_then(|r| orchestrator.provision(&r)),
        ),
        Hook::RegenerateCompose => respond(
            RegenerateRequest::from_value(request)
                .and_then(|r| orchestrator.regenerate_compose(&r)),
        ),
    }
}
