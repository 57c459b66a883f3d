//! Daemon supervisor behavior against a scripted host.

use berth_core::{
    CoreError, DaemonState, DaemonSupervisor, EnsureOptions, Readiness, SupervisorTiming,
};
use berth_runtime::mock::{MockElevator, MockRunner, StubDownloader};
use berth_runtime::{
    CommandOutput, Delegation, EngineInstallation, ExecutionMode, NullProgress, RuntimeError,
    StopSignal,
};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const LAUNCHER_WRITE: &str =
    "cat > /opt/berth/docker/start-dockerd.sh && chmod +x /opt/berth/docker/start-dockerd.sh";
const LOG_RESET: &str = "> /opt/berth/docker/dockerd.log";
const PID_REMOVE: [&str; 3] = ["rm", "-f", "/opt/berth/docker/dockerd.pid"];

struct Host {
    _dir: TempDir,
    install: EngineInstallation,
    runner: Arc<MockRunner>,
}

impl Host {
    /// A native installation with all binaries already on disk.
    fn installed() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let install = EngineInstallation::new(dir.path().join("engine"));
        install.ensure_dirs().unwrap();
        for exe in [
            install.docker_exe(),
            install.dockerd_exe(),
            install.compose_exe(),
        ] {
            fs::write(exe, b"#!/bin/sh\n").unwrap();
        }
        Self {
            _dir: dir,
            install,
            runner: Arc::new(MockRunner::new()),
        }
    }

    fn docker(&self) -> String {
        self.install.docker_exe().display().to_string()
    }

    /// The managed daemon answers `info` from `generation` on.
    fn daemon_answers_from(&self, generation: u32) {
        let docker = self.docker();
        self.runner.respond_from(
            generation,
            &[docker.as_str(), "info"],
            CommandOutput::ok("Server Version: 27.5.1"),
        );
    }

    fn supervisor(&self, mode: ExecutionMode) -> DaemonSupervisor {
        DaemonSupervisor::new(self.install.clone(), mode, self.runner.clone())
            .with_timing(SupervisorTiming::immediate())
            .with_progress(Arc::new(NullProgress))
            .with_downloader(Arc::new(StubDownloader::new()))
            .with_elevator(Arc::new(MockElevator::denying("consent refused")))
    }

    fn native(&self) -> DaemonSupervisor {
        self.supervisor(ExecutionMode::Native)
    }

    fn write_log(&self, text: &str) {
        fs::write(self.install.log_file(), text).unwrap();
    }

    /// What the spawned dockerd prints to its log.
    fn dockerd_prints(&self, text: &str) {
        self.runner.spawn_writes(text);
    }
}

fn delegated() -> ExecutionMode {
    ExecutionMode::Delegated(Delegation::default())
}

#[test]
fn system_engine_short_circuits() {
    let host = Host::installed();
    host.runner.respond_ok(&["docker", "info"], "Server Version: 26.1");
    let sup = host.native();

    let outcome = sup.ensure(&EnsureOptions::default()).unwrap();
    assert!(outcome.ready);
    assert!(outcome.external);
    assert!(host.runner.spawned().is_empty());
    assert_eq!(sup.state(), DaemonState::Running);
}

#[test]
fn running_managed_daemon_is_reused() {
    let host = Host::installed();
    host.daemon_answers_from(0);
    let sup = host.native();

    let outcome = sup.ensure(&EnsureOptions::default()).unwrap();
    assert!(outcome.ready);
    assert!(!outcome.external);
    assert!(outcome.start.is_none());
    assert!(host.runner.spawned().is_empty());
}

#[cfg_attr(not(target_os = "linux"), ignore)]
#[test]
fn ensure_spawns_and_waits_for_daemon() {
    let host = Host::installed();
    host.daemon_answers_from(1);
    let sup = host.native();
    assert_eq!(sup.state(), DaemonState::Stopped);

    let outcome = sup.ensure(&EnsureOptions::default()).unwrap();
    assert!(outcome.ready);
    let start = outcome.start.unwrap();
    assert!(start.started);
    assert_eq!(start.pid, Some(40_000));
    assert_eq!(sup.state(), DaemonState::Running);

    let spawned = host.runner.spawned();
    assert_eq!(spawned.len(), 1);
    assert_eq!(
        spawned[0].argv,
        vec![
            host.install.dockerd_exe().display().to_string(),
            "--data-root".to_owned(),
            host.install.data_root().display().to_string(),
        ]
    );
    assert_eq!(spawned[0].log_file.as_deref(), Some(host.install.log_file().as_path()));
    assert_eq!(
        fs::read_to_string(host.install.pid_file()).unwrap(),
        "40000"
    );
    assert!(host.install.data_root().is_dir());
}

#[cfg_attr(not(target_os = "linux"), ignore)]
#[test]
fn fatal_log_line_fails_start() {
    let host = Host::installed();
    host.dockerd_prints(
        "level=info msg=\"Starting up\"\n\
         failed to start daemon: error initializing graphdriver: driver not supported\n",
    );
    let sup = host.native();

    let err = sup.ensure(&EnsureOptions::default()).unwrap_err();
    match &err {
        CoreError::DaemonFatal { line, log_tail } => {
            assert!(line.contains("graphdriver"));
            assert!(log_tail.contains("Starting up"));
        }
        other => panic!("expected DaemonFatal, got {other:?}"),
    }
    assert!(err.is_engine_failure());
    assert!(matches!(sup.state(), DaemonState::Failed(_)));
}

#[cfg_attr(not(target_os = "linux"), ignore)]
#[test]
fn privilege_failure_retries_elevated() {
    let host = Host::installed();
    host.dockerd_prints("failed to start daemon: open //./pipe/docker_engine: Access is denied.\n");
    // generation 1 is the unprivileged spawn, 2 the elevated helper
    host.daemon_answers_from(2);
    let elevator = Arc::new(MockElevator::granting(5555, host.runner.clone()));
    let sup = host.native().with_elevator(elevator.clone());

    let outcome = sup.ensure(&EnsureOptions::default()).unwrap();
    let start = outcome.start.unwrap();
    assert!(start.elevated);
    assert_eq!(start.pid, Some(5555));
    assert_eq!(elevator.requests(), 1);
    assert!(!host.install.pid_file().exists());
    assert_eq!(
        host.install.tracked_pid().map(|t| (t.pid, t.elevated)),
        Some((5555, true))
    );
}

#[cfg_attr(not(target_os = "linux"), ignore)]
#[test]
fn refused_elevation_is_a_privilege_error() {
    let host = Host::installed();
    host.dockerd_prints("dockerd needs to be started with root privileges\n");
    let sup = host.native();

    let err = sup.start_daemon().unwrap_err();
    match err {
        CoreError::Runtime(RuntimeError::Privilege(msg)) => {
            assert!(msg.contains("elevated privileges"));
            assert!(msg.contains("consent refused"));
        }
        other => panic!("expected a privilege error, got {other:?}"),
    }
    assert!(matches!(sup.state(), DaemonState::Failed(_)));
}

#[cfg_attr(not(target_os = "linux"), ignore)]
#[test]
fn silent_daemon_times_out_with_log_tail() {
    let host = Host::installed();
    host.dockerd_prints("level=info msg=\"waiting for containerd\"\n");
    let sup = host.native();

    let err = sup
        .ensure(&EnsureOptions {
            wait_timeout: Duration::ZERO,
        })
        .unwrap_err();
    assert!(matches!(err, CoreError::DaemonUnresponsive { secs: 0, .. }));
    assert!(err.log_tail().unwrap().contains("waiting for containerd"));
}

#[cfg_attr(not(target_os = "linux"), ignore)]
#[test]
fn stale_log_from_previous_run_is_ignored() {
    let host = Host::installed();
    host.write_log("failed to start daemon: pid file found, ensure docker is not running\n");
    host.dockerd_prints("level=info msg=\"Starting up\"\n");
    let sup = host.native();

    let outcome = sup.start_daemon().unwrap();
    assert!(outcome.started);
    assert_eq!(outcome.pid, Some(40_000));
    assert_eq!(
        fs::read_to_string(host.install.log_file()).unwrap(),
        "level=info msg=\"Starting up\"\n"
    );

    host.daemon_answers_from(2);
    host.runner.advance();
    assert_eq!(sup.wait_for_ready(Duration::from_secs(5)), Readiness::Ready);
}

#[test]
fn wait_scans_log_every_third_poll() {
    let host = Host::installed();
    host.write_log("failed to start daemon: pid file found, ensure docker is not running\n");
    let sup = host.native();

    let readiness = sup.wait_for_ready(Duration::from_secs(30));
    assert_eq!(
        readiness,
        Readiness::Fatal(
            "failed to start daemon: pid file found, ensure docker is not running".to_owned()
        )
    );
    let docker = host.docker();
    assert_eq!(host.runner.count(&[docker.as_str(), "info"]), 3);
}

#[test]
fn start_when_already_running() {
    let host = Host::installed();
    host.daemon_answers_from(0);
    host.install.write_pid(1234).unwrap();
    let sup = host.native();

    let outcome = sup.start_daemon().unwrap();
    assert!(!outcome.started);
    assert!(outcome.is_up());
    assert_eq!(outcome.reason.as_deref(), Some("already_running"));
    assert_eq!(outcome.pid, Some(1234));
    assert!(host.runner.spawned().is_empty());
}

#[test]
fn stop_terminates_tracked_pid() {
    let host = Host::installed();
    host.install.write_pid(777).unwrap();
    host.runner.set_alive(777, true);
    let sup = host.native();

    let outcome = sup.stop_daemon().unwrap();
    assert!(outcome.stopped);
    assert_eq!(outcome.pid, Some(777));
    assert_eq!(host.runner.signals(), vec![(777, StopSignal::Terminate)]);
    assert!(host.install.tracked_pid().is_none());
    assert_eq!(sup.state(), DaemonState::Stopped);
}

#[test]
fn stop_without_pid_file() {
    let host = Host::installed();
    let outcome = host.native().stop_daemon().unwrap();
    assert!(!outcome.stopped);
    assert_eq!(outcome.reason.as_deref(), Some("no_pid_file"));
    assert!(host.runner.signals().is_empty());
}

#[test]
fn status_and_info_report_installation() {
    let host = Host::installed();
    let docker = host.docker();
    let compose = host.install.compose_exe().display().to_string();
    host.runner
        .respond_ok(&[docker.as_str(), "--version"], "Docker version 27.5.1, build 9c9e405\n");
    host.runner
        .respond_ok(&[compose.as_str(), "version"], "Docker Compose version v2.33.1\n");
    host.install.write_pid(4321).unwrap();

    let info = host.native().info();
    assert!(!info.status.delegated);
    assert!(info.status.binaries_ready);
    assert!(info.status.compose_ready);
    assert!(!info.status.io_bridge_ready);
    assert!(!info.status.daemon_running);
    assert!(!info.status.system_engine);
    assert_eq!(info.status.pid, Some(4321));
    assert_eq!(info.status.docker_exe.as_deref(), Some(docker.as_str()));
    assert_eq!(
        info.docker_version.as_deref(),
        Some("Docker version 27.5.1, build 9c9e405")
    );
    assert_eq!(
        info.compose_version.as_deref(),
        Some("Docker Compose version v2.33.1")
    );

    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["binaries_ready"], true);
    assert_eq!(json["docker_version"], "Docker version 27.5.1, build 9c9e405");
}

#[test]
fn missing_binaries_start_as_not_installed() {
    let dir = tempfile::tempdir().unwrap();
    let install = EngineInstallation::new(dir.path());
    let sup = DaemonSupervisor::new(install, ExecutionMode::Native, Arc::new(MockRunner::new()));
    assert_eq!(sup.state(), DaemonState::NotInstalled);
}

#[test]
fn native_provisioning_failure_marks_failed() {
    let dir = tempfile::tempdir().unwrap();
    let install = EngineInstallation::new(dir.path().join("engine"));
    let runner = Arc::new(MockRunner::new());
    let sup = DaemonSupervisor::new(install, ExecutionMode::Native, runner)
        .with_timing(SupervisorTiming::immediate())
        .with_progress(Arc::new(NullProgress))
        .with_downloader(Arc::new(StubDownloader::new()));

    if cfg!(target_os = "linux") {
        let err = sup.ensure(&EnsureOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Runtime(RuntimeError::Download { .. })
        ));
        assert!(matches!(sup.state(), DaemonState::Failed(_)));
    }
}

// delegated

fn delegated_host() -> Host {
    let host = Host::installed();
    host.runner.respond_ok(&["echo", "OK"], "OK");
    host.runner.respond_ok(&["which", "iptables"], "/usr/sbin/iptables");
    host.runner.respond_ok(&["test", "-x"], "");
    host.runner.respond_ok(&["sh", "-c", LOG_RESET], "");
    host.runner.respond_ok(&["sh", "-c", LAUNCHER_WRITE], "");
    host
}

#[test]
fn delegated_start_writes_launcher_and_spawns_session() {
    let host = delegated_host();
    host.runner.respond_from(
        1,
        &["/opt/berth/docker/docker", "-H", "unix:///var/run/docker.sock", "info"],
        CommandOutput::ok(""),
    );
    let sup = host.supervisor(delegated());

    let outcome = sup.ensure(&EnsureOptions::default()).unwrap();
    assert!(outcome.ready);
    assert!(outcome.warnings.is_empty());
    assert!(outcome.start.unwrap().started);

    let write = host.runner.find(&["sh", "-c", LAUNCHER_WRITE]).unwrap();
    let script = String::from_utf8(write.stdin.unwrap()).unwrap();
    assert!(script.contains("exec /opt/berth/docker/dockerd"));

    let spawned = host.runner.spawned();
    assert_eq!(
        spawned[0].argv,
        vec!["wsl", "-u", "root", "--", "/opt/berth/docker/start-dockerd.sh"]
    );
    assert_eq!(host.install.tracked_pid().map(|t| t.pid), Some(40_000));
}

#[test]
fn delegated_missing_subsystem_needs_reboot() {
    let host = Host::installed();
    let sup = host.supervisor(delegated());

    let err = sup.ensure(&EnsureOptions::default()).unwrap_err();
    assert!(err.needs_reboot());
    assert!(err.to_string().contains("WSL2"));
    assert!(host.runner.spawned().is_empty());
}

#[test]
fn delegated_companion_failure_is_a_warning() {
    let host = Host::installed();
    host.runner.respond_ok(&["echo", "OK"], "OK");
    host.runner.respond_ok(&["test", "-x"], "");
    host.runner.respond_ok(&["sh", "-c", LOG_RESET], "");
    host.runner.respond_ok(&["sh", "-c", LAUNCHER_WRITE], "");
    host.runner.respond_from(
        1,
        &["/opt/berth/docker/docker", "-H"],
        CommandOutput::ok(""),
    );
    let sup = host.supervisor(delegated());

    let outcome = sup.ensure(&EnsureOptions::default()).unwrap();
    assert!(outcome.ready);
    assert_eq!(outcome.warnings, vec!["iptables installation failed"]);
}

#[test]
fn delegated_launcher_write_failure() {
    let host = Host::installed();
    host.runner.respond_ok(&["sh", "-c", LOG_RESET], "");
    host.runner.respond_fail(&["sh", "-c", LAUNCHER_WRITE], "read-only file system");
    let sup = host.supervisor(delegated());

    let err = sup.start_daemon().unwrap_err();
    assert!(err.to_string().contains("read-only file system"));
    assert!(host.runner.spawned().is_empty());
}

#[test]
fn delegated_log_reset_failure_stops_start() {
    let host = Host::installed();
    host.runner
        .respond_fail(&["sh", "-c", LOG_RESET], "Permission denied");
    let sup = host.supervisor(delegated());

    let err = sup.start_daemon().unwrap_err();
    assert!(err.to_string().contains("Permission denied"));
    assert_eq!(host.runner.count(&["sh", "-c", LAUNCHER_WRITE]), 0);
    assert!(host.runner.spawned().is_empty());
    assert!(matches!(sup.state(), DaemonState::Failed(_)));
}

#[test]
fn delegated_stop_kills_wrapper_and_orphans() {
    let host = Host::installed();
    host.install.write_pid(40_100).unwrap();
    host.runner.set_alive(40_100, true);
    host.runner.respond_ok(&PID_REMOVE, "");
    let sup = host.supervisor(delegated());

    let outcome = sup.stop_daemon().unwrap();
    assert!(outcome.stopped);
    assert!(outcome.error.is_none());
    assert_eq!(outcome.pid, Some(40_100));
    assert_eq!(host.runner.signals(), vec![(40_100, StopSignal::Kill)]);
    assert_eq!(
        host.runner
            .count(&["rm", "-f", "/opt/berth/docker/dockerd.pid"]),
        1
    );
    assert!(host.install.tracked_pid().is_none());
}

#[test]
fn delegated_stop_reports_leftover_pid_file() {
    let host = Host::installed();
    host.install.write_pid(40_100).unwrap();
    host.runner.set_alive(40_100, true);
    host.runner.respond_fail(&PID_REMOVE, "Read-only file system");
    let sup = host.supervisor(delegated());

    let outcome = sup.stop_daemon().unwrap();
    assert!(outcome.stopped);
    assert!(outcome
        .error
        .as_deref()
        .is_some_and(|e| e.contains("Read-only file system")));
    assert!(host.install.tracked_pid().is_none());
}

#[test]
fn delegated_stop_without_pid_uses_pkill() {
    let host = Host::installed();
    host.runner.respond_ok(&PID_REMOVE, "");
    let outcome = host.supervisor(delegated()).stop_daemon().unwrap();
    assert!(outcome.stopped);
    assert!(outcome.error.is_none());
    assert_eq!(outcome.reason.as_deref(), Some("killed_via_pkill"));
    assert!(host.runner.signals().is_empty());
    let calls = host.runner.calls();
    assert!(calls
        .iter()
        .any(|argv| argv.last().is_some_and(|a| a.contains("pkill -x dockerd"))));
}

#[test]
fn delegated_status_reports_subsystem_paths() {
    let host = Host::installed();
    host.runner.respond_ok(&["test", "-x"], "");
    host.runner
        .respond_ok(&["cat", "/opt/berth/docker/dockerd.pid"], "812\n");
    let status = host.supervisor(delegated()).status();
    assert!(status.delegated);
    assert!(status.binaries_ready);
    assert_eq!(status.install_dir, "/opt/berth/docker");
    assert_eq!(status.docker_exe.as_deref(), Some("/opt/berth/docker/docker"));
    assert_eq!(status.pid, Some(812));
}
