//! Per-instance compose operations behind the hook surface.
//!
//! Every instance owns a directory holding its rendered manifest; that
//! directory is the compose project boundary, so each compose call runs with
//! it as working directory.

use crate::containers::{
    parse_compose_ps, select_primary, top_matches, ContainerRecord, ContainerStats,
};
use crate::daemon::{DaemonSupervisor, EnsureOptions};
use crate::hooks::{
    instance_context, InstanceRequest, ProvisionRequest, RegenerateRequest, ShutdownAllRequest,
};
use crate::installer::{InstallOutcome, InstallRequest, InstallerRegistry, STEAMCMD};
use crate::CoreError;
use berth_runtime::layout::{DOCKER_BIN, IO_BRIDGE_BIN};
use berth_runtime::{CommandOutput, CommandSpec, ExecutionMode, ProgressEvent, RuntimeError};
use berth_schema::{
    manifest_path, render_manifest, write_manifest, ContainerName, ContainerTemplate,
    ExtraContext, ManifestError, RenderOptions, MANIFEST_FILE,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const START_WAIT: Duration = Duration::from_secs(60);
const PROVISION_WAIT: Duration = Duration::from_secs(120);
const DEFAULT_LOG_LINES: usize = 100;
const JAVA_VERSION_PLACEHOLDER: &str = "{java_version}";
const DEFAULT_JAVA_VERSION: &str = "21";
const ENGINE_STEP: &str = "docker_engine";
// consumers key the server-files step on this name whatever the install method
const SERVER_FILES_STEP: &str = "steamcmd";
const COMPOSE_STEP: &str = "compose";
const PROVISION_STEPS: [&str; 3] = [ENGINE_STEP, SERVER_FILES_STEP, COMPOSE_STEP];
const STATS_FORMAT: &str = "{{.MemUsage}}@@{{.MemPerc}}@@{{.CPUPerc}}";

/// How long `start` waits for a freshly created container to settle.
///
/// The primary container is probed after `initial`, then after twice that,
/// and so on, for at most `max_probes` probes. Probing stops early once the
/// container is running or has reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlePolicy {
    pub initial: Duration,
    pub max_probes: u32,
}

impl Default for SettlePolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max_probes: 4,
        }
    }
}

impl SettlePolicy {
    pub fn immediate() -> Self {
        Self {
            initial: Duration::ZERO,
            ..Self::default()
        }
    }
}

fn is_settled(state: &str) -> bool {
    matches!(state, "running" | "exited" | "dead")
}

/// How the caller should attach to a started instance's output.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LogFollower {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: String,
    pub description: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub interactive: bool,
    /// Prefix compose puts before each line, to be stripped by the reader.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strip_prefix: Option<String>,
}

impl LogFollower {
    fn from_argv(mut argv: Vec<String>, working_dir: &Path, description: &str) -> Self {
        let program = if argv.is_empty() {
            String::new()
        } else {
            argv.remove(0)
        };
        Self {
            program,
            args: argv,
            working_dir: working_dir.display().to_string(),
            description: description.to_owned(),
            interactive: false,
            strip_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub message: String,
    pub stdout: String,
    pub initial_logs: String,
    pub log_follower: LogFollower,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TeardownReport {
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InstanceStatus {
    pub running: bool,
    pub server_process_running: bool,
    pub container_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_process: Option<String>,
    /// `running`, `starting` (container up, server process not yet seen) or `stopped`.
    pub status: &'static str,
}

impl InstanceStatus {
    fn stopped(container_name: Option<String>) -> Self {
        Self {
            running: false,
            server_process_running: false,
            container_name,
            matched_process: None,
            status: "stopped",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatsReport {
    pub container_name: String,
    pub docker_memory_usage: String,
    pub docker_memory_percent: f64,
    pub docker_cpu_percent: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ShutdownResult {
    pub instance_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub results: Vec<ShutdownResult>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EnrichReport {
    pub handled: bool,
    pub extension_id: &'static str,
    pub docker_enabled: bool,
    pub docker_cpu_limit: Option<Value>,
    pub docker_memory_limit: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub docker_daemon_offline: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
}

impl EnrichReport {
    fn with_status(mut self, status: &'static str) -> Self {
        self.handled = true;
        self.status = Some(status);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogsReport {
    pub logs: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComposeReport {
    pub message: String,
    pub container_name: ContainerName,
    /// Whether the manifest on disk changed.
    pub changed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unresolved_placeholders: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_version: Option<String>,
}

/// Answers the per-instance hooks.
pub struct Orchestrator {
    supervisor: DaemonSupervisor,
    installers: InstallerRegistry,
    settle: SettlePolicy,
}

impl Orchestrator {
    pub fn new(supervisor: DaemonSupervisor, installers: InstallerRegistry) -> Self {
        Self {
            supervisor,
            installers,
            settle: SettlePolicy::default(),
        }
    }

    #[must_use]
    pub fn with_settle_policy(mut self, settle: SettlePolicy) -> Self {
        self.settle = settle;
        self
    }

    pub fn supervisor(&self) -> &DaemonSupervisor {
        &self.supervisor
    }

    fn mode(&self) -> &ExecutionMode {
        self.supervisor.mode()
    }

    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CoreError> {
        debug!("exec: {}", spec.display());
        Ok(self.supervisor.runner().run(spec)?)
    }

    fn compose_argv(&self, instance_dir: &Path, args: &[&str]) -> Vec<String> {
        let mut argv = self.mode().compose_cli(self.supervisor.install());
        argv.push("-f".to_owned());
        argv.push(self.mode().compose_file_arg(instance_dir, MANIFEST_FILE));
        argv.extend(args.iter().map(|a| (*a).to_owned()));
        argv
    }

    fn compose(&self, instance_dir: &Path, args: &[&str], timeout_secs: u64) -> CommandSpec {
        CommandSpec::new(self.compose_argv(instance_dir, args))
            .cwd(instance_dir)
            .timeout_secs(timeout_secs)
    }

    fn engine(&self, args: &[&str], timeout_secs: u64) -> CommandSpec {
        let mut argv = self.mode().engine_cli(self.supervisor.install());
        argv.extend(args.iter().map(|a| (*a).to_owned()));
        CommandSpec::new(argv).timeout_secs(timeout_secs)
    }

    fn require_manifest(instance_dir: &Path) -> Result<(), CoreError> {
        if manifest_path(instance_dir).exists() {
            Ok(())
        } else {
            Err(CoreError::ManifestMissing {
                dir: instance_dir.display().to_string(),
                file: MANIFEST_FILE,
            })
        }
    }

    /// Containers of the instance; a failed query reads as none.
    fn containers(&self, instance_dir: &Path, timeout_secs: u64) -> Vec<ContainerRecord> {
        let ps = self.compose(instance_dir, &["ps", "--format", "json", "-a"], timeout_secs);
        match self.run(&ps) {
            Ok(out) if out.success() => parse_compose_ps(&out.stdout),
            Ok(out) => {
                debug!("compose ps failed: {}", out.diagnostic());
                Vec::new()
            }
            Err(e) => {
                debug!("compose ps failed: {e}");
                Vec::new()
            }
        }
    }

    fn primary_state(&self, instance_dir: &Path) -> String {
        let records = self.containers(instance_dir, 15);
        select_primary(&records)
            .and_then(ContainerRecord::state)
            .unwrap_or("unknown")
            .to_owned()
    }

    /// Probe the primary container until it settles or the policy runs out.
    fn settled_state(&self, instance_dir: &Path) -> String {
        let mut delay = self.settle.initial;
        let mut state = "unknown".to_owned();
        for probe in 1..=self.settle.max_probes.max(1) {
            std::thread::sleep(delay);
            state = self.primary_state(instance_dir);
            debug!("settle probe {probe}: {state}");
            if is_settled(&state) {
                break;
            }
            delay *= 2;
        }
        state
    }

    fn io_bridge_follower(
        &self,
        container: &ContainerName,
        instance_dir: &Path,
    ) -> Option<LogFollower> {
        let install = self.supervisor.install();
        let argv = match self.mode() {
            ExecutionMode::Native => {
                let bridge = install.io_bridge_exe();
                if !bridge.exists() {
                    return None;
                }
                let docker = self
                    .mode()
                    .engine_cli(install)
                    .pop()
                    .unwrap_or_else(|| DOCKER_BIN.to_owned());
                vec![bridge.display().to_string(), container.to_string(), docker]
            }
            ExecutionMode::Delegated(d) => {
                let bridge = d.path(IO_BRIDGE_BIN);
                let present = self.supervisor.runner().probe(
                    &CommandSpec::new(self.mode().wrap(["test", "-x", bridge.as_str()]))
                        .timeout_secs(5),
                );
                if !present {
                    return None;
                }
                self.mode()
                    .wrap([bridge, container.to_string(), d.path(DOCKER_BIN)])
            }
        };
        let mut follower = LogFollower::from_argv(argv, instance_dir, "interactive console bridge");
        follower.interactive = true;
        Some(follower)
    }

    fn log_follower(&self, req: &InstanceRequest, instance_dir: &Path) -> LogFollower {
        if let Some(follower) = req
            .container_name()
            .and_then(|name| self.io_bridge_follower(&name, instance_dir))
        {
            return follower;
        }
        let argv = self.compose_argv(
            instance_dir,
            &["logs", "--follow", "--no-color", "--tail", "100"],
        );
        let mut follower = LogFollower::from_argv(argv, instance_dir, "compose log stream");
        follower.strip_prefix = Some(" | ".to_owned());
        follower
    }

    /// Bring the instance's containers up and confirm the primary one runs.
    pub fn start(&self, req: &InstanceRequest) -> Result<StartReport, CoreError> {
        let instance_dir = req.require_dir()?;
        self.supervisor.ensure_ready(START_WAIT)?;
        Self::require_manifest(instance_dir)?;

        info!("starting containers in {}", instance_dir.display());
        let up = self.run(&self.compose(instance_dir, &["up", "-d", "--force-recreate"], 300))?;
        if !up.success() {
            return Err(RuntimeError::CommandFailed {
                command: "compose up".to_owned(),
                detail: up.diagnostic().to_owned(),
            }
            .into());
        }

        let state = self.settled_state(instance_dir);
        let initial_logs = self
            .run(&self.compose(instance_dir, &["logs", "--tail", "30"], 10))
            .map(|out| out.stdout.trim().to_owned())
            .unwrap_or_default();

        if state != "running" {
            warn!("container in {} is {state} after start", instance_dir.display());
            return Err(CoreError::ContainerNotRunning {
                state,
                logs: initial_logs,
            });
        }

        Ok(StartReport {
            message: "containers started".to_owned(),
            stdout: up.stdout,
            initial_logs,
            log_follower: self.log_follower(req, instance_dir),
        })
    }

    /// Stop the containers without removing them.
    pub fn stop(&self, req: &InstanceRequest) -> Result<Message, CoreError> {
        let instance_dir = req.require_dir()?;
        let out = self.run(&self.compose(instance_dir, &["stop"], 120))?;
        if !out.success() {
            return Err(RuntimeError::CommandFailed {
                command: "compose stop".to_owned(),
                detail: out.diagnostic().to_owned(),
            }
            .into());
        }
        Ok(Message {
            message: "containers stopped".to_owned(),
        })
    }

    fn down(&self, instance_dir: &Path, timeout_secs: u64) -> Option<String> {
        match self.run(&self.compose(instance_dir, &["down"], timeout_secs)) {
            Ok(out) if out.success() => None,
            Ok(out) => Some(format!("compose down failed: {}", out.diagnostic())),
            Err(e) => Some(format!("compose down failed: {e}")),
        }
    }

    /// Remove the containers. Failures are reported, never fatal.
    pub fn cleanup(&self, req: &InstanceRequest) -> Result<TeardownReport, CoreError> {
        let instance_dir = req.require_dir()?;
        let warnings: Vec<String> = self.down(instance_dir, 120).into_iter().collect();
        for w in &warnings {
            warn!("{w}");
        }
        Ok(TeardownReport {
            message: "containers removed".to_owned(),
            warnings,
        })
    }

    fn process_check(&self, container: &str, patterns: &[String]) -> Option<String> {
        let out = self.run(&self.engine(&["top", container], 15)).ok()?;
        if !out.success() {
            return None;
        }
        top_matches(&out.stdout, patterns)
    }

    pub fn status(&self, req: &InstanceRequest) -> Result<InstanceStatus, CoreError> {
        let instance_dir = req.require_dir()?;
        let records = self.containers(instance_dir, 30);
        let primary = select_primary(&records);
        let name = primary.and_then(ContainerRecord::name).map(str::to_owned);
        if !primary.is_some_and(ContainerRecord::is_running) {
            return Ok(InstanceStatus::stopped(name));
        }

        let (server_running, matched) = match name.as_deref() {
            Some(container) if !req.process_patterns.is_empty() => {
                let matched = self.process_check(container, &req.process_patterns);
                (matched.is_some(), matched)
            }
            _ => (true, None),
        };
        Ok(InstanceStatus {
            running: true,
            server_process_running: server_running,
            container_name: name,
            matched_process: matched,
            status: if server_running { "running" } else { "starting" },
        })
    }

    pub fn container_stats(&self, req: &InstanceRequest) -> Result<StatsReport, CoreError> {
        let instance_dir = req.require_dir()?;
        let records = self.containers(instance_dir, 15);
        let name = select_primary(&records)
            .and_then(ContainerRecord::name)
            .ok_or_else(|| CoreError::NotFound("Container name not found".to_owned()))?
            .to_owned();

        let out = self.run(&self.engine(
            &["stats", "--no-stream", "--format", "{{json .}}", &name],
            15,
        ))?;
        if !out.success() {
            return Err(CoreError::NotFound(format!(
                "stats for {name} unavailable: {}",
                out.diagnostic()
            )));
        }
        let stats = ContainerStats::from_json(&out.stdout).ok_or_else(|| {
            CoreError::NotFound(format!("invalid stats output: {}", out.stdout.trim()))
        })?;
        Ok(StatsReport {
            container_name: name,
            docker_memory_usage: stats.memory_usage,
            docker_memory_percent: stats.memory_percent,
            docker_cpu_percent: stats.cpu_percent,
        })
    }

    /// `down` every container-backed instance. One failure never stops the rest.
    pub fn shutdown_all(&self, req: &ShutdownAllRequest) -> ShutdownReport {
        let mut results = Vec::new();
        for instance in &req.instances {
            if !instance.extension_data.docker_enabled {
                continue;
            }
            let Some(instance_dir) = instance.dir() else {
                continue;
            };
            if !manifest_path(instance_dir).exists() {
                continue;
            }
            let warning = self.down(instance_dir, 60);
            if let Some(w) = &warning {
                warn!("{}: {w}", instance.instance_id);
            }
            results.push(ShutdownResult {
                instance_id: instance.instance_id.clone(),
                success: warning.is_none(),
                warning,
            });
        }
        info!("shut down {} instance(s)", results.len());
        ShutdownReport { results }
    }

    /// Container state and resource usage for the server list.
    pub fn enrich_server_info(&self, req: &InstanceRequest) -> EnrichReport {
        let ext = &req.extension_data;
        let report = EnrichReport {
            handled: false,
            extension_id: "docker",
            docker_enabled: ext.docker_enabled,
            docker_cpu_limit: ext.docker_cpu_limit.clone(),
            docker_memory_limit: ext.docker_memory_limit.clone(),
            status: None,
            docker_daemon_offline: false,
            memory_usage: None,
            memory_percent: None,
            cpu_percent: None,
        };
        if !req.dir().is_some_and(|d| manifest_path(d).exists()) {
            return report;
        }

        // short probe so an offline engine does not stall the whole list
        let online = self
            .run(&self.engine(&["info", "--format", "{{.ServerVersion}}"], 3))
            .is_ok_and(|o| o.success());
        if !online {
            let mut report = report.with_status("stopped");
            report.docker_daemon_offline = true;
            return report;
        }

        let Ok(status) = self.status(req) else {
            return report.with_status("stopped");
        };
        if !status.running {
            return report.with_status("stopped");
        }
        let mut report = report.with_status(status.status);
        if let Some(name) = status.container_name.as_deref() {
            let stats = self
                .run(&self.engine(&["stats", name, "--no-stream", "--format", STATS_FORMAT], 15))
                .ok()
                .filter(CommandOutput::success)
                .and_then(|out| ContainerStats::from_delimited(&out.stdout));
            if let Some(stats) = stats {
                report.memory_usage = Some(stats.memory_usage);
                report.memory_percent = Some(stats.memory_percent);
                report.cpu_percent = Some(stats.cpu_percent);
            }
        }
        report
    }

    pub fn get_logs(&self, req: &InstanceRequest) -> Result<LogsReport, CoreError> {
        let instance_dir = req.require_dir()?;
        let lines = req.lines.unwrap_or(DEFAULT_LOG_LINES).to_string();
        let spec = self.compose(instance_dir, &["logs", "--tail", &lines], 30);
        let warning = match self.run(&spec) {
            Ok(out) if out.success() => {
                return Ok(LogsReport {
                    logs: out.stdout,
                    warnings: Vec::new(),
                });
            }
            Ok(out) => format!("compose logs failed: {}", out.diagnostic()),
            Err(e) => format!("compose logs failed: {e}"),
        };
        warn!("{warning}");
        Ok(LogsReport {
            logs: String::new(),
            warnings: vec![warning],
        })
    }

    /// Nothing to prepare before an instance exists.
    pub fn pre_create(&self) -> Value {
        json!({"handled": false, "success": true})
    }

    fn progress(&self, percent: u8, message: impl Into<String>, step: u32, label: &str) {
        self.supervisor
            .progress()
            .emit(&ProgressEvent::new(percent, message).at_step(step, 3, label));
    }

    fn install_assets(
        &self,
        req: &ProvisionRequest,
        server_dir: &Path,
    ) -> Result<InstallOutcome, CoreError> {
        let spec = &req.module_install.install;
        match spec.method.as_str() {
            STEAMCMD => {
                let Some(app_id) = spec.app_id() else {
                    warn!("steamcmd install without app_id, skipping");
                    return Ok(InstallOutcome::default());
                };
                self.progress(
                    40,
                    format!("Downloading server files (app {app_id})..."),
                    1,
                    SERVER_FILES_STEP,
                );
                let platform = if self.mode().is_delegated() {
                    Some("linux".to_owned())
                } else {
                    spec.platform.clone()
                };
                let request = InstallRequest::SteamApp {
                    app_id,
                    install_dir: server_dir.to_path_buf(),
                    anonymous: spec.anonymous.unwrap_or(true),
                    platform,
                    beta: spec.beta.clone(),
                };
                self.installers.install(&request, self.supervisor.progress())
            }
            "download" => {
                let module = req.target.module().ok_or_else(|| {
                    CoreError::InvalidRequest("download install needs a module name".to_owned())
                })?;
                self.progress(
                    35,
                    format!("Downloading server files ({module})..."),
                    1,
                    SERVER_FILES_STEP,
                );
                let request = InstallRequest::ModuleDownload {
                    module: module.to_owned(),
                    install_dir: server_dir.to_path_buf(),
                };
                let outcome = self.installers.install(&request, self.supervisor.progress())?;
                let done = match &outcome.version {
                    Some(v) => format!("Server v{v} installed"),
                    None => "Server installed".to_owned(),
                };
                self.progress(60, done, 1, SERVER_FILES_STEP);
                Ok(outcome)
            }
            "" => Ok(InstallOutcome::default()),
            other => Err(CoreError::InvalidRequest(format!(
                "unknown install method: {other}"
            ))),
        }
    }

    fn write_compose(
        &self,
        template: &ContainerTemplate,
        instance: &Value,
        extra: &ExtraContext,
        instance_dir: &Path,
    ) -> Result<ComposeReport, CoreError> {
        let ctx = instance_context(instance);
        let options = RenderOptions {
            force_host_network: self.mode().forces_host_network(),
        };
        let rendered = render_manifest(template, &ctx, extra, options)?;
        if !rendered.unresolved.is_empty() {
            warn!(
                "unresolved placeholders in manifest: {}",
                rendered.unresolved.join(", ")
            );
        }
        let changed = write_manifest(instance_dir, &rendered)?;
        info!(
            "manifest for {} {}",
            rendered.container_name,
            if changed { "written" } else { "unchanged" }
        );
        Ok(ComposeReport {
            message: format!("{MANIFEST_FILE} generated"),
            container_name: rendered.container_name,
            changed,
            unresolved_placeholders: rendered.unresolved,
            installed_version: None,
        })
    }

    /// Engine, then server files, then the manifest. Each step reports
    /// progress; a failed step ends the pipeline.
    pub fn provision(&self, req: &ProvisionRequest) -> Result<ComposeReport, CoreError> {
        let instance_dir = req.target.require_dir()?;

        self.supervisor.progress().emit(
            &ProgressEvent::new(0, "Checking container engine...")
                .at_step(0, 3, ENGINE_STEP)
                .with_steps(&PROVISION_STEPS),
        );
        let wait = req
            .docker_engine_config
            .wait_timeout
            .map_or(PROVISION_WAIT, Duration::from_secs);
        self.supervisor.ensure(&EnsureOptions { wait_timeout: wait })?;
        self.progress(33, "Container engine ready", 0, ENGINE_STEP);

        let server_dir = instance_dir.join("server");
        std::fs::create_dir_all(&server_dir)?;
        let installed = self.install_assets(req, &server_dir)?;
        self.progress(66, "Server files ready", 1, SERVER_FILES_STEP);

        self.progress(80, format!("Generating {MANIFEST_FILE}..."), 2, COMPOSE_STEP);
        let template = req
            .module_install
            .template()?
            .filter(ContainerTemplate::has_image)
            .ok_or(ManifestError::MissingImage)?;
        let java_version = installed.runtime_version.clone().or_else(|| {
            template
                .image_mentions(JAVA_VERSION_PLACEHOLDER)
                .then(|| DEFAULT_JAVA_VERSION.to_owned())
        });
        let extra = ExtraContext { java_version };
        let mut report = self.write_compose(&template, &req.instance, &extra, instance_dir)?;
        report.installed_version = installed.version;
        self.progress(100, format!("{MANIFEST_FILE} generated"), 2, COMPOSE_STEP);
        Ok(report)
    }

    /// Re-render the manifest after settings changed.
    pub fn regenerate_compose(&self, req: &RegenerateRequest) -> Result<ComposeReport, CoreError> {
        let instance_dir = req.target.require_dir()?;
        let template = req.template()?.ok_or_else(|| {
            CoreError::InvalidRequest(
                "no container template in module_extensions or module_config".to_owned(),
            )
        })?;
        if !template.has_image() {
            return Err(ManifestError::MissingImage.into());
        }
        let java_version = template.image_mentions(JAVA_VERSION_PLACEHOLDER).then(|| {
            req.java_version()
                .unwrap_or_else(|| DEFAULT_JAVA_VERSION.to_owned())
        });
        let mut report = self.write_compose(
            &template,
            &req.instance,
            &ExtraContext { java_version },
            instance_dir,
        )?;
        report.message = format!("{MANIFEST_FILE} regenerated");
        Ok(report)
    }
}
