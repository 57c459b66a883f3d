//! Server asset installation during provisioning.
//!
//! Installing game-server files is not this crate's job: it is delegated to
//! an [`AssetInstaller`] looked up in an [`InstallerRegistry`]. SteamCMD
//! installs are keyed by [`STEAMCMD`]; module-specific downloaders are keyed
//! by module name.

use crate::CoreError;
use berth_runtime::{CommandRunner, CommandSpec, ProgressEvent, ProgressSink};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub const STEAMCMD: &str = "steamcmd";
const INSTALL_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum InstallRequest {
    /// Dedicated server files of a Steam app.
    SteamApp {
        app_id: String,
        install_dir: PathBuf,
        anonymous: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        platform: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        beta: Option<String>,
    },
    /// Latest release of a module's own server distribution.
    ModuleDownload { module: String, install_dir: PathBuf },
}

impl InstallRequest {
    /// Registry key of the installer that handles this request.
    pub fn installer_key(&self) -> &str {
        match self {
            Self::SteamApp { .. } => STEAMCMD,
            Self::ModuleDownload { module, .. } => module,
        }
    }

    pub fn install_dir(&self) -> &PathBuf {
        match self {
            Self::SteamApp { install_dir, .. } | Self::ModuleDownload { install_dir, .. } => {
                install_dir
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct InstallOutcome {
    /// Version that was installed, when the installer knows it.
    #[serde(default)]
    pub version: Option<String>,
    /// Runtime major version the installed server needs (e.g. Java `21`).
    #[serde(default, alias = "java_major_version")]
    pub runtime_version: Option<String>,
}

pub trait AssetInstaller: Send + Sync {
    fn install(
        &self,
        request: &InstallRequest,
        progress: &dyn ProgressSink,
    ) -> Result<InstallOutcome, CoreError>;
}

#[derive(Default)]
pub struct InstallerRegistry {
    installers: BTreeMap<String, Arc<dyn AssetInstaller>>,
}

impl InstallerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: impl Into<String>, installer: Arc<dyn AssetInstaller>) {
        self.installers.insert(key.into(), installer);
    }

    pub fn get(&self, key: &str) -> Option<&Arc<dyn AssetInstaller>> {
        self.installers.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.installers.keys().map(String::as_str)
    }

    /// Run the installer registered for `request`.
    pub fn install(
        &self,
        request: &InstallRequest,
        progress: &dyn ProgressSink,
    ) -> Result<InstallOutcome, CoreError> {
        let key = request.installer_key();
        let installer = self
            .get(key)
            .ok_or_else(|| CoreError::Install(format!("no installer registered for '{key}'")))?;
        info!("installing server files with '{key}'");
        installer.install(request, progress)
    }
}

/// Reply an external installer prints as its last JSON line.
#[derive(Debug, Deserialize)]
struct InstallerReply {
    #[serde(default = "default_true")]
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    version: Option<Value>,
    #[serde(default, alias = "java_major_version")]
    runtime_version: Option<Value>,
}

fn default_true() -> bool {
    true
}

fn scalar_text(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// An external program that receives the request as JSON on stdin and
/// answers with one JSON object on stdout. `PROGRESS:` lines it prints are
/// forwarded.
pub struct CommandInstaller {
    argv: Vec<String>,
    runner: Arc<dyn CommandRunner>,
    timeout_secs: u64,
}

impl CommandInstaller {
    pub fn new(argv: Vec<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            argv,
            runner,
            timeout_secs: INSTALL_TIMEOUT_SECS,
        }
    }

    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

impl AssetInstaller for CommandInstaller {
    fn install(
        &self,
        request: &InstallRequest,
        progress: &dyn ProgressSink,
    ) -> Result<InstallOutcome, CoreError> {
        if self.argv.is_empty() {
            return Err(CoreError::Install("installer command is empty".to_owned()));
        }
        let payload = serde_json::to_vec(request)?;
        let spec = CommandSpec::new(self.argv.clone())
            .stdin(payload)
            .timeout_secs(self.timeout_secs);
        debug!("installer: {}", spec.display());
        let out = self.runner.run(&spec)?;

        let mut reply = None;
        for line in out.stdout.lines().map(str::trim) {
            if let Some(event) = ProgressEvent::parse_line(line) {
                progress.emit(&event);
            } else if line.starts_with('{') {
                reply = serde_json::from_str::<InstallerReply>(line).ok().or(reply);
            }
        }

        let Some(reply) = reply else {
            return Err(CoreError::Install(if out.success() {
                format!("{} produced no result", self.argv[0])
            } else {
                out.diagnostic().to_owned()
            }));
        };
        if !out.success() || !reply.success {
            let detail = reply
                .error
                .or(reply.message)
                .unwrap_or_else(|| out.diagnostic().to_owned());
            return Err(CoreError::Install(detail));
        }
        Ok(InstallOutcome {
            version: scalar_text(reply.version),
            runtime_version: scalar_text(reply.runtime_version),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_runtime::mock::MockRunner;
    use berth_runtime::{CollectingProgress, CommandOutput};

    fn steam_request() -> InstallRequest {
        InstallRequest::SteamApp {
            app_id: "2394010".to_owned(),
            install_dir: PathBuf::from("/srv/i/abc/server"),
            anonymous: true,
            platform: Some("linux".to_owned()),
            beta: None,
        }
    }

    #[test]
    fn request_serializes_with_method_tag() {
        let json = serde_json::to_value(steam_request()).unwrap();
        assert_eq!(json["method"], "steam_app");
        assert_eq!(json["app_id"], "2394010");
        assert!(json.get("beta").is_none());
        assert_eq!(steam_request().installer_key(), STEAMCMD);

        let dl = InstallRequest::ModuleDownload {
            module: "minecraft".to_owned(),
            install_dir: PathBuf::from("/srv/i/x/server"),
        };
        assert_eq!(dl.installer_key(), "minecraft");
    }

    #[test]
    fn command_installer_reads_reply_and_forwards_progress() {
        let runner = Arc::new(MockRunner::new());
        runner.respond_ok(
            &["fake-installer"],
            "PROGRESS:{\"percent\":50,\"message\":\"half\"}\n\
             noise\n\
             {\"success\":true,\"version\":\"1.21.4\",\"java_major_version\":21}\n",
        );
        let installer = CommandInstaller::new(vec!["fake-installer".to_owned()], runner.clone());
        let progress = CollectingProgress::new();
        let outcome = installer.install(&steam_request(), &progress).unwrap();
        assert_eq!(outcome.version.as_deref(), Some("1.21.4"));
        assert_eq!(outcome.runtime_version.as_deref(), Some("21"));
        assert_eq!(progress.events().len(), 1);

        let spec = runner.find(&["fake-installer"]).unwrap();
        let sent: Value = serde_json::from_slice(spec.stdin.as_deref().unwrap()).unwrap();
        assert_eq!(sent["install_dir"], "/srv/i/abc/server");
    }

    #[test]
    fn command_installer_reports_failure() {
        let runner = Arc::new(MockRunner::new());
        runner.respond(
            &["fake-installer"],
            CommandOutput {
                status: Some(1),
                stdout: "{\"success\":false,\"error\":\"app not found\"}\n".to_owned(),
                stderr: String::new(),
            },
        );
        let installer = CommandInstaller::new(vec!["fake-installer".to_owned()], runner);
        let err = installer
            .install(&steam_request(), &CollectingProgress::new())
            .unwrap_err();
        assert_eq!(err.to_string(), "asset installation failed: app not found");
    }

    #[test]
    fn registry_rejects_unknown_keys() {
        let registry = InstallerRegistry::new();
        let err = registry
            .install(&steam_request(), &CollectingProgress::new())
            .unwrap_err();
        assert!(matches!(err, CoreError::Install(ref m) if m.contains("steamcmd")));
    }
}
