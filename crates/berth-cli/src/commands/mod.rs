pub mod completions;
pub mod engine;
pub mod hook;
pub mod man_pages;
pub mod render;

pub use engine::EngineAction;

use berth_core::{DaemonSupervisor, EngineConfig};
use berth_runtime::{
    CommandRunner, EngineInstallation, ExecutionMode, HttpDownloader, SystemRunner,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_MANIFEST_ERROR: u8 = 2;
pub const EXIT_ENGINE_ERROR: u8 = 3;

/// Flags shared by every subcommand.
#[derive(Debug, Clone)]
pub struct GlobalOptions {
    pub install_dir: PathBuf,
    /// `None` lets the host decide.
    pub delegated: Option<bool>,
    pub json: bool,
}

impl GlobalOptions {
    /// A supervisor for the installation `config` points at, falling back to
    /// `--install-dir`. An explicit `delegated` from the request wins over the
    /// command-line flags.
    pub fn supervisor(&self, config: &EngineConfig, delegated: Option<bool>) -> DaemonSupervisor {
        let root = config
            .base_dir
            .clone()
            .unwrap_or_else(|| self.install_dir.clone());
        let mode = ExecutionMode::from_flag(delegated.or(self.delegated));
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
        let mut supervisor = DaemonSupervisor::new(EngineInstallation::new(root), mode, runner);
        if let Some(secs) = config.timeout {
            supervisor =
                supervisor.with_downloader(Arc::new(HttpDownloader::new(Duration::from_secs(secs))));
        }
        supervisor
    }
}

/// All of stdin, without the UTF-8 BOM some shells prepend.
pub fn read_stdin() -> Result<String, String> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| format!("failed to read stdin: {e}"))?;
    Ok(strip_bom(&input).to_owned())
}

pub fn strip_bom(input: &str) -> &str {
    input.strip_prefix('\u{feff}').unwrap_or(input)
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn finish(pb: &ProgressBar, msg: String) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(msg);
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✗ {msg}"));
}

pub fn colorize_state(state: &str) -> String {
    use console::Style;
    match state {
        "running" | "ready" => Style::new().green().bold().apply_to(state).to_string(),
        "stopped" => Style::new().yellow().apply_to(state).to_string(),
        "missing" | "failed" => Style::new().red().apply_to(state).to_string(),
        "external" => Style::new().cyan().apply_to(state).to_string(),
        other => other.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
        assert!(result.contains("\"value\""));
    }

    #[test]
    fn bom_is_stripped_once() {
        assert_eq!(strip_bom("\u{feff}{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_bom("{}"), "{}");
    }

    #[test]
    fn colorize_keeps_text() {
        for state in ["running", "ready", "stopped", "missing", "failed", "external"] {
            assert!(colorize_state(state).contains(state));
        }
        assert_eq!(colorize_state("unknown"), "unknown");
    }

    #[test]
    fn request_base_dir_overrides_install_dir() {
        let global = GlobalOptions {
            install_dir: PathBuf::from("/opt/berth-default"),
            delegated: Some(false),
            json: true,
        };
        let config = EngineConfig {
            base_dir: Some(PathBuf::from("/srv/engine")),
            ..EngineConfig::default()
        };
        let sup = global.supervisor(&config, None);
        assert_eq!(sup.install().root(), std::path::Path::new("/srv/engine"));
        assert!(!sup.mode().is_delegated());

        let sup = global.supervisor(&EngineConfig::default(), Some(true));
        assert_eq!(sup.install().root(), std::path::Path::new("/opt/berth-default"));
        assert!(sup.mode().is_delegated());
    }

    #[test]
    fn exit_codes_are_distinct() {
        assert_ne!(EXIT_SUCCESS, EXIT_FAILURE);
        assert_ne!(EXIT_FAILURE, EXIT_MANIFEST_ERROR);
        assert_ne!(EXIT_MANIFEST_ERROR, EXIT_ENGINE_ERROR);
    }

    #[test]
    fn spinner_finishes() {
        let pb = spinner("testing...");
        spin_ok(&pb, "done");
        let pb = spinner("testing...");
        spin_fail(&pb, "failed");
    }
}
