use super::{read_stdin, GlobalOptions, EXIT_FAILURE, EXIT_SUCCESS};
use berth_core::{dispatch, CommandInstaller, EngineConfig, Hook, InstallerRegistry, Orchestrator};
use berth_runtime::{CommandRunner, SystemRunner};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

fn protocol_error(msg: &str) -> u8 {
    println!("{}", json!({ "error": msg }));
    EXIT_FAILURE
}

/// One hook call: a JSON object on stdin, one JSON object on stdout.
/// Protocol errors (unknown hook, malformed JSON) exit non-zero; operation
/// failures are reported in the payload.
pub fn run(global: &GlobalOptions, name: &str) -> Result<u8, String> {
    let hook = match name.parse::<Hook>() {
        Ok(hook) => hook,
        Err(e) => return Ok(protocol_error(&e.to_string())),
    };
    let input = read_stdin()?;
    let request: Value = match serde_json::from_str(&input) {
        Ok(v @ Value::Object(_)) => v,
        Ok(_) => return Ok(protocol_error("request must be a JSON object")),
        Err(e) => return Ok(protocol_error(&format!("invalid JSON request: {e}"))),
    };
    debug!("hook {hook}");
    println!("{}", handle(global, hook, &request));
    Ok(EXIT_SUCCESS)
}

pub fn handle(global: &GlobalOptions, hook: Hook, request: &Value) -> Value {
    let config = engine_config(request);
    let delegated = request
        .get("wsl2_mode")
        .or_else(|| request.get("delegated"))
        .and_then(Value::as_bool);
    let supervisor = global.supervisor(&config, delegated);
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
    let orchestrator = Orchestrator::new(supervisor, installer_registry(request, &runner));
    dispatch(&orchestrator, hook, request)
}

fn engine_config(request: &Value) -> EngineConfig {
    match request.get("docker_engine_config") {
        Some(raw) => serde_json::from_value(raw.clone()).unwrap_or_else(|e| {
            warn!("ignoring malformed docker_engine_config: {e}");
            EngineConfig::default()
        }),
        None => EngineConfig::default(),
    }
}

/// Installers named in the request's `installers` table, each an argv array
/// or a whitespace-separated command line.
pub fn installer_registry(request: &Value, runner: &Arc<dyn CommandRunner>) -> InstallerRegistry {
    let mut registry = InstallerRegistry::new();
    let Some(table) = request.get("installers").and_then(Value::as_object) else {
        return registry;
    };
    for (key, spec) in table {
        let argv: Vec<String> = match spec {
            Value::String(line) => line.split_whitespace().map(str::to_owned).collect(),
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect(),
            _ => Vec::new(),
        };
        if argv.is_empty() {
            warn!("installer '{key}' has no command, ignoring");
            continue;
        }
        registry.register(
            key.clone(),
            Arc::new(CommandInstaller::new(argv, Arc::clone(runner))),
        );
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn runner() -> Arc<dyn CommandRunner> {
        Arc::new(SystemRunner::new())
    }

    #[test]
    fn installers_from_request() {
        let request = json!({
            "installers": {
                "steamcmd": ["python3", "-m", "steamcmd_installer"],
                "minecraft": "node installers/minecraft.js",
                "broken": 42,
            }
        });
        let registry = installer_registry(&request, &runner());
        let keys: Vec<&str> = registry.keys().collect();
        assert_eq!(keys, vec!["minecraft", "steamcmd"]);
    }

    #[test]
    fn no_installers_table() {
        assert_eq!(installer_registry(&json!({}), &runner()).keys().count(), 0);
    }

    #[test]
    fn engine_config_from_request() {
        let config = engine_config(&json!({
            "docker_engine_config": {"base_dir": "/srv/engine", "wait_timeout": 30}
        }));
        assert_eq!(config.base_dir, Some(PathBuf::from("/srv/engine")));
        assert_eq!(config.wait_timeout, Some(30));
        assert_eq!(
            engine_config(&json!({"docker_engine_config": "nope"})),
            EngineConfig::default()
        );
    }

    #[test]
    fn pre_create_needs_no_engine() {
        let dir = tempfile::tempdir().unwrap();
        let global = GlobalOptions {
            install_dir: dir.path().to_path_buf(),
            delegated: Some(false),
            json: false,
        };
        let payload = handle(&global, Hook::PreCreate, &json!({}));
        assert_eq!(payload, json!({"handled": false, "success": true}));
    }
}
