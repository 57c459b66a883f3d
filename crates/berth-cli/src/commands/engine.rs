use super::{
    colorize_state, json_pretty, read_stdin, spin_fail, spin_ok, spinner, GlobalOptions,
    EXIT_ENGINE_ERROR, EXIT_SUCCESS,
};
use berth_core::{DaemonSupervisor, EngineConfig, EngineStatus, EnsureOptions, Readiness};
use clap::Subcommand;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::io::IsTerminal;
use std::time::Duration;

const START_WAIT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, Subcommand)]
pub enum EngineAction {
    /// Install the engine if needed, start it, and wait until it answers.
    Ensure,
    /// Start the daemon and wait for it.
    Start,
    /// Stop the managed daemon.
    Stop,
    /// Report what is installed and running.
    Status,
    /// Status plus engine and compose versions.
    Info,
}

/// Engine settings piped on stdin; nothing when stdin is a terminal.
fn stdin_config() -> Result<EngineConfig, String> {
    if std::io::stdin().is_terminal() {
        return Ok(EngineConfig::default());
    }
    parse_config(&read_stdin()?)
}

fn parse_config(input: &str) -> Result<EngineConfig, String> {
    if input.trim().is_empty() {
        return Ok(EngineConfig::default());
    }
    serde_json::from_str(input).map_err(|e| format!("invalid engine config: {e}"))
}

/// `base` with the fields of `extra` merged in.
fn merged(base: Value, extra: &impl Serialize) -> Value {
    let mut out = match base {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    if let Ok(Value::Object(fields)) = serde_json::to_value(extra) {
        out.extend(fields);
    }
    Value::Object(out)
}

fn success_of(payload: &Value) -> bool {
    payload
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub fn run(global: &GlobalOptions, action: EngineAction) -> Result<u8, String> {
    let config = stdin_config()?;
    let supervisor = global.supervisor(&config, None);

    let long_running = matches!(
        action,
        EngineAction::Ensure | EngineAction::Start | EngineAction::Stop
    );
    let pb = (long_running && !global.json)
        .then(|| spinner(&format!("engine {}...", action_name(action))));

    let (payload, status) = match action {
        EngineAction::Ensure => (ensure(&supervisor, &config), None),
        EngineAction::Start => (start(&supervisor, &config), None),
        EngineAction::Stop => (stop(&supervisor), None),
        EngineAction::Status => {
            let status = supervisor.status();
            (merged(json!({"success": true}), &status), Some(status))
        }
        EngineAction::Info => {
            let info = supervisor.info();
            (merged(json!({"success": true}), &info), Some(info.status))
        }
    };
    let ok = success_of(&payload);

    if global.json {
        println!("{}", json_pretty(&payload)?);
    } else {
        let summary = payload
            .get("message")
            .or_else(|| payload.get("reason"))
            .and_then(Value::as_str)
            .unwrap_or(if ok { "done" } else { "failed" })
            .to_owned();
        if let Some(pb) = &pb {
            if ok {
                spin_ok(pb, &summary);
            } else {
                spin_fail(pb, &summary);
            }
        }
        print_human(status.as_ref(), &payload);
    }

    Ok(if ok { EXIT_SUCCESS } else { EXIT_ENGINE_ERROR })
}

fn action_name(action: EngineAction) -> &'static str {
    match action {
        EngineAction::Ensure => "ensure",
        EngineAction::Start => "start",
        EngineAction::Stop => "stop",
        EngineAction::Status => "status",
        EngineAction::Info => "info",
    }
}

fn ensure(supervisor: &DaemonSupervisor, config: &EngineConfig) -> Value {
    let mut options = EnsureOptions::default();
    if let Some(secs) = config.wait_timeout {
        options.wait_timeout = Duration::from_secs(secs);
    }
    let wsl_mode = supervisor.mode().is_delegated();
    match supervisor.ensure(&options) {
        Ok(outcome) => {
            let base = json!({"success": true, "wsl_mode": wsl_mode});
            merged(merged(base, &supervisor.status()), &outcome)
        }
        Err(e) => {
            let mut payload = merged(
                json!({"success": false, "daemon_ready": false, "wsl_mode": wsl_mode}),
                &supervisor.status(),
            );
            if let Some(out) = payload.as_object_mut() {
                out.insert("message".to_owned(), Value::from(e.to_string()));
                if let Some(tail) = e.log_tail().filter(|t| !t.is_empty()) {
                    out.insert("dockerd_log_tail".to_owned(), Value::from(tail));
                }
                if e.needs_reboot() {
                    out.insert("needs_reboot".to_owned(), Value::Bool(true));
                }
            }
            payload
        }
    }
}

fn start(supervisor: &DaemonSupervisor, config: &EngineConfig) -> Value {
    let wsl_mode = supervisor.mode().is_delegated();
    match supervisor.start_daemon() {
        Ok(outcome) if outcome.is_up() => {
            let wait = Duration::from_secs(config.wait_timeout.unwrap_or(START_WAIT_SECS));
            let readiness = supervisor.wait_for_ready(wait);
            let ready = readiness == Readiness::Ready;
            let mut payload = merged(
                json!({"success": ready, "daemon_ready": ready, "wsl_mode": wsl_mode}),
                &outcome,
            );
            if let (Readiness::Fatal(line), Some(out)) = (readiness, payload.as_object_mut()) {
                out.insert(
                    "message".to_owned(),
                    Value::from(format!("dockerd start failed: {line}")),
                );
            }
            payload
        }
        Ok(outcome) => merged(
            json!({"success": false, "daemon_ready": false, "wsl_mode": wsl_mode}),
            &outcome,
        ),
        Err(e) => json!({
            "success": false,
            "daemon_ready": false,
            "wsl_mode": wsl_mode,
            "message": e.to_string(),
        }),
    }
}

fn stop(supervisor: &DaemonSupervisor) -> Value {
    match supervisor.stop_daemon() {
        Ok(outcome) => merged(json!({"success": outcome.stopped}), &outcome),
        Err(e) => json!({"success": false, "stopped": false, "message": e.to_string()}),
    }
}

fn engine_state(status: &EngineStatus) -> &'static str {
    if status.system_engine && !status.daemon_running {
        "external"
    } else if status.daemon_running {
        "running"
    } else if status.binaries_ready {
        "stopped"
    } else {
        "missing"
    }
}

fn print_human(status: Option<&EngineStatus>, payload: &Value) {
    match status {
        Some(status) => {
            println!("engine:      {}", colorize_state(engine_state(status)));
            println!(
                "mode:        {}",
                if status.delegated { "delegated" } else { "native" }
            );
            println!("install dir: {}", status.install_dir);
            println!(
                "binaries:    {}",
                colorize_state(if status.binaries_ready { "ready" } else { "missing" })
            );
            println!(
                "compose:     {}",
                colorize_state(if status.compose_ready { "ready" } else { "missing" })
            );
            if let Some(pid) = status.pid {
                println!("pid:         {pid}");
            }
            if let Some(v) = payload.get("docker_version").and_then(Value::as_str) {
                println!("version:     {v}");
            }
            if let Some(v) = payload.get("compose_version").and_then(Value::as_str) {
                println!("compose cli: {v}");
            }
        }
        None => {
            if let Some(tail) = payload.get("dockerd_log_tail").and_then(Value::as_str) {
                eprintln!("--- dockerd log ---\n{tail}");
            }
            if let Some(warnings) = payload.get("warnings").and_then(Value::as_array) {
                for w in warnings.iter().filter_map(Value::as_str) {
                    eprintln!("warning: {w}");
                }
            }
        }
    }
}
