use crate::concurrency::{shutdown_requested, DaemonLock};
use crate::lifecycle::{validate_transition, DaemonState};
use crate::CoreError;
use berth_runtime::layout::{tail_lines, COMPOSE_BIN, DOCKER_BIN};
use berth_runtime::{
    check_prereqs, ensure_companion_packages, format_missing, CommandOutput, CommandRunner,
    CommandSpec, Delegation, DetachedSpec, Downloader, ElevationRequest, Elevator,
    EngineInstallation, ExecutionMode, HttpDownloader, InstallationState, PlatformElevator,
    ProgressSink, Provisioner, RuntimeError, StderrProgress, StopSignal,
};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const FATAL_MARKERS: &[&str] = &["failed to start daemon", "needs to be started with root"];
const PRIVILEGE_MARKERS: &[&str] = &[
    "access is denied",
    "required service",
    "root privileges",
    "permission denied",
];
const FATAL_SCAN_LINES: usize = 15;
const LOG_TAIL_LINES: usize = 20;
const ENGINE_SOCKET: &str = "unix:///var/run/docker.sock";
const ALREADY_RUNNING: &str = "already_running";

/// The first fatal daemon line among the last lines of `log`.
pub fn fatal_line(log: &str) -> Option<String> {
    let lines: Vec<&str> = log.lines().collect();
    let start = lines.len().saturating_sub(FATAL_SCAN_LINES);
    lines[start..]
        .iter()
        .find(|line| {
            let lower = line.to_lowercase();
            FATAL_MARKERS.iter().any(|m| lower.contains(m))
        })
        .map(|line| line.trim().to_owned())
}

/// Whether a fatal line means the daemon lacked privileges rather than broke.
pub fn is_privilege_failure(line: &str) -> bool {
    let lower = line.to_lowercase();
    PRIVILEGE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Launcher written into the delegated root. It keeps dockerd in the
/// foreground so the session that runs it owns the daemon.
pub fn launcher_script(d: &Delegation) -> String {
    let root = &d.root;
    format!(
        "#!/bin/sh\n\
         export PATH=\"{root}:$PATH\"\n\
         if ! pgrep -x containerd > /dev/null 2>&1; then\n\
         \x20   {root}/containerd > /dev/null 2>&1 &\n\
         \x20   sleep 2\n\
         fi\n\
         exec {root}/dockerd \\\n\
         \x20 -H {ENGINE_SOCKET} \\\n\
         \x20 --data-root {data} \\\n\
         \x20 --userland-proxy-path {root}/docker-proxy \\\n\
         \x20 >> {log} 2>&1\n",
        data = d.data_root(),
        log = d.log_file(),
    )
}

/// Every wait the supervisor performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorTiming {
    /// Pause after spawning before the first liveness check.
    pub startup_grace: Duration,
    pub poll_interval: Duration,
    /// Scan the daemon log for fatal lines every n-th readiness poll.
    pub fatal_scan_every: u32,
    pub log_every: u32,
    pub elevation_attempts: u32,
    pub elevation_delay: Duration,
    pub stop_grace: Duration,
    pub stop_poll: Duration,
}

impl Default for SupervisorTiming {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(3),
            poll_interval: Duration::from_secs(3),
            fatal_scan_every: 3,
            log_every: 5,
            elevation_attempts: 10,
            elevation_delay: Duration::from_secs(1),
            stop_grace: Duration::from_secs(10),
            stop_poll: Duration::from_secs(1),
        }
    }
}

impl SupervisorTiming {
    /// Same cadence, no sleeping.
    pub fn immediate() -> Self {
        Self {
            startup_grace: Duration::ZERO,
            poll_interval: Duration::ZERO,
            elevation_delay: Duration::ZERO,
            stop_grace: Duration::ZERO,
            stop_poll: Duration::ZERO,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnsureOptions {
    pub wait_timeout: Duration,
}

impl Default for EnsureOptions {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnsureOutcome {
    #[serde(rename = "daemon_ready")]
    pub ready: bool,
    pub message: String,
    /// An engine this installation does not manage answered first.
    pub external: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<StartOutcome>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl EnsureOutcome {
    fn ready(message: &str, external: bool) -> Self {
        Self {
            ready: true,
            message: message.to_owned(),
            external,
            start: None,
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StartOutcome {
    pub started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub elevated: bool,
}

impl StartOutcome {
    fn spawned(pid: u32) -> Self {
        Self {
            started: true,
            pid: Some(pid),
            ..Self::default()
        }
    }

    fn already_running(pid: Option<u32>) -> Self {
        Self {
            started: false,
            reason: Some(ALREADY_RUNNING.to_owned()),
            pid,
            elevated: false,
        }
    }

    /// Started now or found running.
    pub fn is_up(&self) -> bool {
        self.started || self.reason.as_deref() == Some(ALREADY_RUNNING)
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StopOutcome {
    pub stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StopOutcome {
    fn stopped(pid: Option<u32>, reason: Option<&str>) -> Self {
        Self {
            stopped: true,
            reason: reason.map(str::to_owned),
            pid,
            error: None,
        }
    }

    fn failed(pid: u32, err: &RuntimeError) -> Self {
        Self {
            stopped: false,
            reason: None,
            pid: Some(pid),
            error: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// A fatal line showed up in the daemon log.
    Fatal(String),
    TimedOut,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EngineStatus {
    pub delegated: bool,
    pub binaries_ready: bool,
    pub compose_ready: bool,
    pub io_bridge_ready: bool,
    pub daemon_running: bool,
    pub system_engine: bool,
    pub install_dir: String,
    pub docker_exe: Option<String>,
    pub compose_exe: Option<String>,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EngineInfo {
    #[serde(flatten)]
    pub status: EngineStatus,
    pub docker_version: Option<String>,
    pub compose_version: Option<String>,
}

/// Installs, starts, waits for, and stops the engine daemon of one
/// installation.
pub struct DaemonSupervisor {
    install: EngineInstallation,
    mode: ExecutionMode,
    runner: Arc<dyn CommandRunner>,
    downloader: Arc<dyn Downloader>,
    elevator: Arc<dyn Elevator>,
    progress: Arc<dyn ProgressSink>,
    timing: SupervisorTiming,
    io_bridge_source: Option<PathBuf>,
    state: Mutex<DaemonState>,
}

fn existing(path: &Path) -> Option<String> {
    path.exists().then(|| path.display().to_string())
}

impl DaemonSupervisor {
    pub fn new(
        install: EngineInstallation,
        mode: ExecutionMode,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        // delegated binaries are only visible through the runner; ensure re-observes
        let initial = DaemonState::observe(mode.is_delegated() || install.binaries_present());
        Self {
            elevator: Arc::new(PlatformElevator::new(Arc::clone(&runner))),
            downloader: Arc::new(HttpDownloader::default()),
            progress: Arc::new(StderrProgress),
            timing: SupervisorTiming::default(),
            io_bridge_source: None,
            state: Mutex::new(initial),
            install,
            mode,
            runner,
        }
    }

    #[must_use]
    pub fn with_downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = downloader;
        self
    }

    #[must_use]
    pub fn with_elevator(mut self, elevator: Arc<dyn Elevator>) -> Self {
        self.elevator = elevator;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn with_timing(mut self, timing: SupervisorTiming) -> Self {
        self.timing = timing;
        self
    }

    #[must_use]
    pub fn with_io_bridge_source(mut self, path: Option<PathBuf>) -> Self {
        self.io_bridge_source = path;
        self
    }

    pub fn install(&self) -> &EngineInstallation {
        &self.install
    }

    pub fn mode(&self) -> &ExecutionMode {
        &self.mode
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub fn progress(&self) -> &dyn ProgressSink {
        self.progress.as_ref()
    }

    pub fn state(&self) -> DaemonState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn transition(&self, to: DaemonState) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        validate_transition(&state, &to)?;
        if *state != to {
            debug!("engine state {state} -> {to}");
        }
        *state = to;
        Ok(())
    }

    /// Record an observation that may not be a legal step from the current state.
    fn settle(&self, to: DaemonState) {
        if let Err(e) = self.transition(to) {
            debug!("engine state unchanged: {e}");
        }
    }

    fn fail(&self, reason: impl fmt::Display) {
        self.settle(DaemonState::Failed(reason.to_string()));
    }

    fn reset_state(&self, to: DaemonState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }

    fn provisioner(&self) -> Provisioner<'_> {
        Provisioner {
            install: &self.install,
            mode: &self.mode,
            runner: self.runner.as_ref(),
            downloader: self.downloader.as_ref(),
            progress: self.progress.as_ref(),
            io_bridge_source: self.io_bridge_source.as_deref(),
        }
    }

    pub fn installation_state(&self) -> InstallationState {
        self.provisioner().inspect()
    }

    fn delegated_sh(&self, script: &str, timeout_secs: u64) -> CommandSpec {
        CommandSpec::new(self.mode.wrap(["sh", "-c", script])).timeout_secs(timeout_secs)
    }

    /// Whether the engine this installation points at answers `info`.
    pub fn daemon_answers(&self) -> bool {
        let argv = match &self.mode {
            ExecutionMode::Native => {
                let mut argv = self.mode.engine_cli(&self.install);
                argv.push("info".to_owned());
                argv
            }
            ExecutionMode::Delegated(d) => self.mode.wrap([
                d.path(DOCKER_BIN),
                "-H".to_owned(),
                ENGINE_SOCKET.to_owned(),
                "info".to_owned(),
            ]),
        };
        self.runner.probe(&CommandSpec::new(argv).timeout_secs(15))
    }

    /// Whether any engine on the host PATH answers, managed or not.
    pub fn system_engine_answers(&self) -> bool {
        self.runner
            .probe(&CommandSpec::new([DOCKER_BIN, "info"]).timeout_secs(10))
    }

    /// Last `lines` lines of the daemon log.
    pub fn log_tail(&self, lines: usize) -> String {
        match &self.mode {
            ExecutionMode::Native => self.install.log_tail(lines),
            ExecutionMode::Delegated(d) => self
                .runner
                .run(
                    &CommandSpec::new(self.mode.wrap([
                        "tail".to_owned(),
                        format!("-{lines}"),
                        d.log_file(),
                    ]))
                    .timeout_secs(5),
                )
                .map(|out| tail_lines(&out.stdout, lines))
                .unwrap_or_default(),
        }
    }

    fn tracked_pid(&self) -> Option<u32> {
        match &self.mode {
            ExecutionMode::Native => self.install.tracked_pid().map(|t| t.pid),
            ExecutionMode::Delegated(d) => self
                .runner
                .run(
                    &CommandSpec::new(self.mode.wrap(["cat".to_owned(), d.pid_file()]))
                        .timeout_secs(5),
                )
                .ok()
                .filter(CommandOutput::success)
                .and_then(|out| out.stdout.trim().parse().ok()),
        }
    }

    /// Make an engine available: reuse one that already answers, otherwise
    /// install, start, and wait for the managed daemon.
    pub fn ensure(&self, options: &EnsureOptions) -> Result<EnsureOutcome, CoreError> {
        let _lock = DaemonLock::acquire(&self.install.lock_file(), "ensure")?;

        if self.system_engine_answers() {
            info!("a system container engine is already running");
            self.settle(DaemonState::Running);
            return Ok(EnsureOutcome::ready("System engine is already running", true));
        }

        let installed = self.provisioner().inspect();
        self.reset_state(DaemonState::observe(installed.binaries_ready));
        if installed.binaries_ready && self.daemon_answers() {
            self.transition(DaemonState::Running)?;
            return Ok(EnsureOutcome::ready("Managed engine is running", false));
        }

        let missing = check_prereqs(self.runner.as_ref(), &self.mode);
        if !missing.is_empty() {
            return Err(RuntimeError::PrerequisiteMissing(format_missing(&missing)).into());
        }
        let warnings = ensure_companion_packages(self.runner.as_ref(), &self.mode);

        if !installed.binaries_ready || !installed.compose_ready {
            self.transition(DaemonState::Installing)?;
            if let Err(e) = self.provisioner().ensure_available() {
                self.fail(&e);
                return Err(e.into());
            }
            self.transition(DaemonState::Stopped)?;
        }

        let start = self.start_locked()?;
        let mut outcome = match self.wait_for_ready(options.wait_timeout) {
            Readiness::Ready => EnsureOutcome::ready("Engine ready", false),
            Readiness::Fatal(line) => {
                return Err(CoreError::DaemonFatal {
                    line,
                    log_tail: self.log_tail(LOG_TAIL_LINES),
                });
            }
            Readiness::TimedOut => {
                return Err(CoreError::DaemonUnresponsive {
                    secs: options.wait_timeout.as_secs(),
                    log_tail: self.log_tail(LOG_TAIL_LINES),
                });
            }
        };
        outcome.start = Some(start);
        outcome.warnings = warnings;
        Ok(outcome)
    }

    /// Ensure an engine answers, waiting at most `wait` for a fresh start.
    pub fn ensure_ready(&self, wait: Duration) -> Result<(), CoreError> {
        if self.daemon_answers() {
            return Ok(());
        }
        self.ensure(&EnsureOptions { wait_timeout: wait }).map(|_| ())
    }

    pub fn start_daemon(&self) -> Result<StartOutcome, CoreError> {
        let _lock = DaemonLock::acquire(&self.install.lock_file(), "start")?;
        self.start_locked()
    }

    fn start_locked(&self) -> Result<StartOutcome, CoreError> {
        if self.daemon_answers() {
            info!("engine daemon is already running");
            self.settle(DaemonState::Running);
            return Ok(StartOutcome::already_running(self.tracked_pid()));
        }
        if self.state() == DaemonState::Running {
            // died since it was last seen
            self.reset_state(DaemonState::Stopped);
        }
        match &self.mode {
            ExecutionMode::Native => self.start_native(),
            ExecutionMode::Delegated(d) => self.start_delegated(d),
        }
    }

    fn start_native(&self) -> Result<StartOutcome, CoreError> {
        let dockerd = self.install.dockerd_exe();
        if !dockerd.exists() {
            return Err(
                RuntimeError::Provisioning(format!("{} not found", dockerd.display())).into(),
            );
        }
        let data_root = self.install.data_root();
        std::fs::create_dir_all(&data_root)?;
        self.transition(DaemonState::Starting)?;

        let spec = DetachedSpec::new([
            dockerd.display().to_string(),
            "--data-root".to_owned(),
            data_root.display().to_string(),
        ])
        .log_to(self.install.log_file());
        // lines from an earlier run would trip the fatal scan
        self.install.reset_log()?;
        info!("spawning {}", spec.argv.join(" "));
        let pid = match self.runner.spawn_detached(&spec) {
            Ok(pid) => pid,
            Err(e) => {
                self.fail(&e);
                return Err(e.into());
            }
        };
        self.install.write_pid(pid)?;
        info!("dockerd spawned (pid {pid})");

        std::thread::sleep(self.timing.startup_grace);
        if self.daemon_answers() {
            return Ok(StartOutcome::spawned(pid));
        }

        let tail = self.install.log_tail(LOG_TAIL_LINES);
        match fatal_line(&tail) {
            Some(line) if is_privilege_failure(&line) => {
                warn!("dockerd failed with a privilege error: {line}");
                self.start_elevated(&line)
            }
            Some(line) => {
                self.fail(&line);
                Err(CoreError::DaemonFatal {
                    line,
                    log_tail: tail,
                })
            }
            None => Ok(StartOutcome::spawned(pid)),
        }
    }

    fn start_elevated(&self, fatal: &str) -> Result<StartOutcome, CoreError> {
        // the unprivileged attempt is gone; only the elevated pid counts now
        self.install.clear_pids();
        let dockerd = self.install.dockerd_exe();
        let data_root = self.install.data_root();
        let log_file = self.install.log_file();
        let pid_file = self.install.elevated_pid_file();
        let script = self.install.elevation_script();
        let request = ElevationRequest {
            dockerd: &dockerd,
            data_root: &data_root,
            log_file: &log_file,
            pid_file: &pid_file,
            script: &script,
        };

        info!("retrying with elevated privileges");
        if let Err(e) = self.elevator.elevate(&request) {
            self.fail(fatal);
            return Err(match e {
                RuntimeError::Privilege(reason) => RuntimeError::Privilege(format!(
                    "dockerd requires elevated privileges ({fatal}): {reason}"
                )),
                other => other,
            }
            .into());
        }

        for attempt in 1..=self.timing.elevation_attempts {
            std::thread::sleep(self.timing.elevation_delay);
            if let Some(tracked) = self.install.tracked_pid() {
                if self.daemon_answers() {
                    info!("elevated dockerd running (pid {})", tracked.pid);
                    return Ok(StartOutcome {
                        started: true,
                        reason: None,
                        pid: Some(tracked.pid),
                        elevated: true,
                    });
                }
            }
            debug!("waiting for elevated dockerd (attempt {attempt})");
        }

        warn!("elevated dockerd did not start in time");
        self.fail("elevated daemon did not start");
        let waited = self.timing.elevation_delay * self.timing.elevation_attempts;
        Err(CoreError::DaemonUnresponsive {
            secs: waited.as_secs(),
            log_tail: self.install.log_tail(LOG_TAIL_LINES),
        })
    }

    fn start_delegated(&self, d: &Delegation) -> Result<StartOutcome, CoreError> {
        self.transition(DaemonState::Starting)?;

        // stale lines would trip the fatal scan
        let reset = self
            .runner
            .run(&self.delegated_sh(&format!("> {}", d.log_file()), 30))?;
        if !reset.success() {
            self.fail("log_reset_failed");
            return Err(RuntimeError::CommandFailed {
                command: format!("truncate {}", d.log_file()),
                detail: reset.diagnostic().to_owned(),
            }
            .into());
        }

        let launcher = d.launcher();
        let write = self.runner.run(
            &self
                .delegated_sh(&format!("cat > {launcher} && chmod +x {launcher}"), 10)
                .stdin(launcher_script(d)),
        )?;
        if !write.success() {
            self.fail("launcher_write_failed");
            return Err(RuntimeError::CommandFailed {
                command: format!("write {launcher}"),
                detail: write.diagnostic().to_owned(),
            }
            .into());
        }

        info!("starting delegated engine session");
        let pid = match self
            .runner
            .spawn_detached(&DetachedSpec::new(self.mode.wrap([launcher])))
        {
            Ok(pid) => pid,
            Err(e) => {
                self.fail(&e);
                return Err(e.into());
            }
        };
        if !self
            .runner
            .probe(&self.delegated_sh(&format!("echo {pid} > {}", d.pid_file()), 5))
        {
            warn!("could not record the session pid inside the delegated environment");
        }
        self.install.write_pid(pid)?;
        info!("delegated engine session started (wrapper pid {pid})");
        Ok(StartOutcome::spawned(pid))
    }

    /// Poll until the daemon answers, a fatal line appears in its log, or
    /// `timeout` passes. At least one poll is always made.
    pub fn wait_for_ready(&self, timeout: Duration) -> Readiness {
        info!("waiting up to {}s for the engine", timeout.as_secs());
        let deadline = Instant::now() + timeout;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if self.daemon_answers() {
                info!("engine ready (attempt {attempt})");
                self.settle(DaemonState::Running);
                return Readiness::Ready;
            }
            if attempt % self.timing.fatal_scan_every.max(1) == 0 {
                if let Some(line) = fatal_line(&self.log_tail(LOG_TAIL_LINES)) {
                    warn!("dockerd fatal: {line}");
                    self.fail(&line);
                    return Readiness::Fatal(line);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                self.fail("engine did not respond in time");
                return Readiness::TimedOut;
            }
            if shutdown_requested() {
                warn!("interrupted while waiting for the engine");
                self.fail("interrupted");
                return Readiness::TimedOut;
            }
            let remaining = deadline - now;
            if attempt % self.timing.log_every.max(1) == 0 {
                info!(
                    "still waiting for the engine ({}s remaining)",
                    remaining.as_secs()
                );
            }
            std::thread::sleep(self.timing.poll_interval.min(remaining));
        }
    }

    pub fn stop_daemon(&self) -> Result<StopOutcome, CoreError> {
        let _lock = DaemonLock::acquire(&self.install.lock_file(), "stop")?;
        let outcome = match &self.mode {
            ExecutionMode::Native => self.stop_native(),
            ExecutionMode::Delegated(d) => self.stop_delegated(d),
        };
        if outcome.stopped && self.state() != DaemonState::NotInstalled {
            self.settle(DaemonState::Stopped);
        }
        Ok(outcome)
    }

    fn stop_native(&self) -> StopOutcome {
        let Some(tracked) = self.install.tracked_pid() else {
            return StopOutcome {
                stopped: false,
                reason: Some("no_pid_file".to_owned()),
                ..StopOutcome::default()
            };
        };
        let pid = tracked.pid;
        if let Err(e) = self.runner.signal(pid, StopSignal::Terminate) {
            return StopOutcome::failed(pid, &e);
        }
        let deadline = Instant::now() + self.timing.stop_grace;
        while self.runner.is_alive(pid) {
            if Instant::now() >= deadline {
                warn!("dockerd (pid {pid}) still running after terminate, killing");
                if let Err(e) = self.runner.signal(pid, StopSignal::Kill) {
                    return StopOutcome::failed(pid, &e);
                }
                break;
            }
            std::thread::sleep(self.timing.stop_poll);
        }
        self.install.clear_pids();
        info!("dockerd (pid {pid}) stopped");
        StopOutcome::stopped(Some(pid), None)
    }

    fn stop_delegated(&self, d: &Delegation) -> StopOutcome {
        let kill_orphans = self.delegated_sh(
            "pkill -x dockerd 2>/dev/null; pkill -x containerd 2>/dev/null",
            10,
        );
        let remove_pid =
            CommandSpec::new(self.mode.wrap(["rm".to_owned(), "-f".to_owned(), d.pid_file()]))
                .timeout_secs(10);

        let Some(tracked) = self.install.tracked_pid() else {
            self.kill_orphans(&kill_orphans);
            let mut outcome = StopOutcome::stopped(None, Some("killed_via_pkill"));
            outcome.error = self.remove_delegated_pid(&remove_pid);
            return outcome;
        };
        // ending the wrapper tears down the whole delegated session
        if let Err(e) = self.runner.signal(tracked.pid, StopSignal::Kill) {
            return StopOutcome::failed(tracked.pid, &e);
        }
        self.install.clear_pids();
        let mut outcome = StopOutcome::stopped(Some(tracked.pid), None);
        outcome.error = self.remove_delegated_pid(&remove_pid);
        self.kill_orphans(&kill_orphans);
        info!("delegated engine session stopped (wrapper pid {})", tracked.pid);
        outcome
    }

    /// Best effort: the session is already gone when this runs.
    fn kill_orphans(&self, spec: &CommandSpec) {
        match self.runner.run(spec) {
            Ok(out) if out.success() => {}
            Ok(out) => warn!("pkill inside the delegated environment: {}", out.diagnostic()),
            Err(e) => warn!("pkill inside the delegated environment: {e}"),
        }
    }

    /// A stale pid file makes `status` report a session that is gone, so a
    /// failed removal is reported on the outcome.
    fn remove_delegated_pid(&self, spec: &CommandSpec) -> Option<String> {
        let detail = match self.runner.run(spec) {
            Ok(out) if out.success() => return None,
            Ok(out) => out.diagnostic().to_owned(),
            Err(e) => e.to_string(),
        };
        warn!("failed to remove the delegated pid file: {detail}");
        Some(format!("pid file not removed: {detail}"))
    }

    pub fn status(&self) -> EngineStatus {
        let installed = self.provisioner().inspect();
        let (install_dir, docker_exe, compose_exe) = match &self.mode {
            ExecutionMode::Native => (
                self.install.root().display().to_string(),
                existing(&self.install.docker_exe()),
                existing(&self.install.compose_exe()),
            ),
            ExecutionMode::Delegated(d) => (
                d.root.clone(),
                Some(d.path(DOCKER_BIN)),
                Some(d.path(COMPOSE_BIN)),
            ),
        };
        EngineStatus {
            delegated: self.mode.is_delegated(),
            binaries_ready: installed.binaries_ready,
            compose_ready: installed.compose_ready,
            io_bridge_ready: installed.io_bridge_ready,
            daemon_running: self.daemon_answers(),
            system_engine: self.system_engine_answers(),
            install_dir,
            docker_exe,
            compose_exe,
            pid: self.tracked_pid(),
        }
    }

    /// `status` plus version strings of the engine and compose CLIs.
    pub fn info(&self) -> EngineInfo {
        let (docker, compose) = match &self.mode {
            ExecutionMode::Native => {
                let mut docker = self.mode.engine_cli(&self.install);
                docker.push("--version".to_owned());
                let compose = existing(&self.install.compose_exe())
                    .map(|exe| vec![exe, "version".to_owned()]);
                (docker, compose)
            }
            ExecutionMode::Delegated(d) => (
                self.mode.wrap([d.path(DOCKER_BIN), "--version".to_owned()]),
                Some(self.mode.wrap([d.path(COMPOSE_BIN), "version".to_owned()])),
            ),
        };
        EngineInfo {
            status: self.status(),
            docker_version: self.version_of(docker),
            compose_version: compose.and_then(|argv| self.version_of(argv)),
        }
    }

    fn version_of(&self, argv: Vec<String>) -> Option<String> {
        self.runner
            .run(&CommandSpec::new(argv).timeout_secs(10))
            .ok()
            .filter(CommandOutput::success)
            .map(|out| out.stdout.trim().to_owned())
    }
}
