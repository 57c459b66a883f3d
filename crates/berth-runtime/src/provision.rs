//! Engine and compose binary installation.
//!
//! `ensure_available` is idempotent: whatever is already installed is left
//! alone. A failed step is reported as `Provisioning`/`Download` and leaves
//! the partial install in place for the next attempt to overwrite.

use crate::download::{
    extract_engine_archive, make_executable, Downloader, COMPOSE_BINARY_URL, ENGINE_ARCHIVE_URL,
};
use crate::exec::{CommandRunner, CommandSpec};
use crate::layout::{EngineInstallation, COMPOSE_BIN, DOCKERD_BIN, IO_BRIDGE_BIN};
use crate::mode::{Delegation, ExecutionMode};
use crate::progress::ProgressSink;
use crate::RuntimeError;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable pointing at a prebuilt I/O bridge binary.
pub const IO_BRIDGE_ENV: &str = "BERTH_IO_BRIDGE";
const CLI_PLUGIN_DIR: &str = "/root/.docker/cli-plugins";

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct InstallationState {
    pub binaries_ready: bool,
    pub compose_ready: bool,
    pub io_bridge_ready: bool,
}

pub struct Provisioner<'a> {
    pub install: &'a EngineInstallation,
    pub mode: &'a ExecutionMode,
    pub runner: &'a dyn CommandRunner,
    pub downloader: &'a dyn Downloader,
    pub progress: &'a dyn ProgressSink,
    /// Explicit I/O bridge source, checked before the search path.
    pub io_bridge_source: Option<&'a Path>,
}

/// Candidate locations of a prebuilt I/O bridge binary, in search order.
pub fn io_bridge_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = explicit {
        out.push(p.to_path_buf());
    }
    if let Some(p) = std::env::var_os(IO_BRIDGE_ENV) {
        out.push(PathBuf::from(p));
    }
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        out.push(dir.join(IO_BRIDGE_BIN));
        out.push(dir.join("bin").join(IO_BRIDGE_BIN));
    }
    out
}

impl Provisioner<'_> {
    fn delegated(&self, args: &[&str]) -> CommandSpec {
        CommandSpec::new(self.mode.wrap(args.iter().copied()))
    }

    /// Run a setup command inside the delegated environment; a non-zero exit
    /// is a provisioning failure.
    fn delegated_step(&self, args: &[&str]) -> Result<(), RuntimeError> {
        let out = self.runner.run(&self.delegated(args).timeout_secs(30))?;
        if out.success() {
            return Ok(());
        }
        Err(RuntimeError::Provisioning(format!(
            "`{}` failed in delegated environment (exit {:?}): {}",
            args.join(" "),
            out.status,
            out.diagnostic()
        )))
    }

    fn delegated_test_x(&self, d: &Delegation, name: &str) -> bool {
        self.runner
            .probe(&self.delegated(&["test", "-x", &d.path(name)]).timeout_secs(10))
    }

    /// Report what is installed without changing anything.
    pub fn inspect(&self) -> InstallationState {
        match self.mode {
            ExecutionMode::Native => InstallationState {
                binaries_ready: self.install.binaries_present(),
                compose_ready: self.install.compose_present(),
                io_bridge_ready: self.install.io_bridge_exe().exists(),
            },
            ExecutionMode::Delegated(d) => InstallationState {
                binaries_ready: self.delegated_test_x(d, DOCKERD_BIN),
                compose_ready: self.delegated_test_x(d, COMPOSE_BIN),
                io_bridge_ready: self.delegated_test_x(d, IO_BRIDGE_BIN),
            },
        }
    }

    pub fn ensure_available(&self) -> Result<InstallationState, RuntimeError> {
        let mut state = self.inspect();
        if !state.binaries_ready {
            self.install_engine()?;
            state.binaries_ready = true;
        }
        if !state.compose_ready {
            self.install_compose()?;
            state.compose_ready = true;
        }
        if !state.io_bridge_ready {
            state.io_bridge_ready = match self.deploy_io_bridge() {
                Ok(deployed) => deployed,
                Err(e) => {
                    warn!("failed to deploy I/O bridge: {e}");
                    false
                }
            };
        }
        Ok(state)
    }

    fn install_engine(&self) -> Result<(), RuntimeError> {
        match self.mode {
            ExecutionMode::Native => self.install_engine_native(),
            ExecutionMode::Delegated(d) => self.install_engine_delegated(d),
        }
    }

    fn install_engine_native(&self) -> Result<(), RuntimeError> {
        self.install.ensure_dirs()?;
        let archive = self.install.archive_path();
        self.downloader
            .fetch(ENGINE_ARCHIVE_URL, &archive, "Docker Engine", self.progress)?;
        info!("extracting engine into {}", self.install.root().display());
        let extracted = extract_engine_archive(&archive, self.install.root());
        let _ = fs::remove_file(&archive);
        extracted?;
        for exe in [self.install.docker_exe(), self.install.dockerd_exe()] {
            if exe.exists() {
                make_executable(&exe)?;
            }
        }
        if !self.install.dockerd_exe().exists() {
            return Err(RuntimeError::Provisioning(format!(
                "{DOCKERD_BIN} not found after extraction in {}",
                self.install.root().display()
            )));
        }
        info!("engine ready at {}", self.install.root().display());
        Ok(())
    }

    fn install_engine_delegated(&self, d: &Delegation) -> Result<(), RuntimeError> {
        let staging = tempfile::tempdir()?;
        let archive = staging.path().join("berth-engine.tgz");
        self.downloader
            .fetch(ENGINE_ARCHIVE_URL, &archive, "Docker Engine", self.progress)?;
        let archive_in = self.mode.translate_path(&archive);

        self.delegated_step(&["mkdir", "-p", &d.root])?;
        self.delegated_step(&["mkdir", "-p", &d.data_root()])?;
        info!("extracting engine into delegated root {}", d.root);
        let out = self.runner.run(
            &self
                .delegated(&[
                    "tar",
                    "xzf",
                    &archive_in,
                    "-C",
                    &d.root,
                    "--strip-components=1",
                ])
                .timeout_secs(120),
        )?;
        if !out.success() {
            return Err(RuntimeError::Provisioning(format!(
                "failed to extract engine in delegated environment (exit {:?}): {}",
                out.status,
                out.diagnostic()
            )));
        }
        if !self.delegated_test_x(d, DOCKERD_BIN) {
            return Err(RuntimeError::Provisioning(format!(
                "{DOCKERD_BIN} not found in delegated environment after extraction"
            )));
        }
        info!("engine binaries installed in delegated environment");
        Ok(())
    }

    fn install_compose(&self) -> Result<(), RuntimeError> {
        match self.mode {
            ExecutionMode::Native => {
                self.install.ensure_dirs()?;
                let dest = self.install.compose_exe();
                self.downloader
                    .fetch(COMPOSE_BINARY_URL, &dest, "Docker Compose", self.progress)?;
                make_executable(&dest)?;
                info!("compose ready at {}", dest.display());
                Ok(())
            }
            ExecutionMode::Delegated(d) => self.install_compose_delegated(d),
        }
    }

    fn install_compose_delegated(&self, d: &Delegation) -> Result<(), RuntimeError> {
        let staging = tempfile::tempdir()?;
        let binary = staging.path().join(COMPOSE_BIN);
        self.downloader
            .fetch(COMPOSE_BINARY_URL, &binary, "Docker Compose", self.progress)?;
        let source = self.mode.translate_path(&binary);
        let dest = d.path(COMPOSE_BIN);

        let out = self.runner.run(&self.delegated(&["cp", &source, &dest]))?;
        if !out.success() {
            return Err(RuntimeError::Provisioning(format!(
                "failed to copy compose into delegated environment: {}",
                out.diagnostic()
            )));
        }
        self.delegated_step(&["chmod", "+x", &dest])?;
        // plugin symlink makes `docker compose` work as well
        self.delegated_step(&["mkdir", "-p", CLI_PLUGIN_DIR])?;
        self.delegated_step(&[
            "ln",
            "-sf",
            &dest,
            &format!("{CLI_PLUGIN_DIR}/{COMPOSE_BIN}"),
        ])?;
        info!("compose installed in delegated environment");
        Ok(())
    }

    /// Copy the I/O bridge next to the engine. Returns `false` when no
    /// prebuilt bridge exists; interactive console input is then unavailable.
    pub fn deploy_io_bridge(&self) -> Result<bool, RuntimeError> {
        let candidates = io_bridge_candidates(self.io_bridge_source);
        let Some(source) = candidates.iter().find(|c| c.is_file()) else {
            info!(
                "{IO_BRIDGE_BIN} not found (checked {} locations), interactive console bridging disabled",
                candidates.len()
            );
            return Ok(false);
        };

        match self.mode {
            ExecutionMode::Native => {
                self.install.ensure_dirs()?;
                let dest = self.install.io_bridge_exe();
                fs::copy(source, &dest)?;
                make_executable(&dest)?;
                info!("{IO_BRIDGE_BIN} deployed to {}", dest.display());
                Ok(true)
            }
            ExecutionMode::Delegated(d) => {
                let dest = d.path(IO_BRIDGE_BIN);
                let src = self.mode.translate_path(source);
                let out = self.runner.run(&self.delegated(&["cp", &src, &dest]))?;
                if !out.success() {
                    return Err(RuntimeError::Provisioning(format!(
                        "failed to copy {IO_BRIDGE_BIN}: {}",
                        out.diagnostic()
                    )));
                }
                self.delegated_step(&["chmod", "+x", &dest])?;
                info!("{IO_BRIDGE_BIN} deployed to {dest}");
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::tests::tgz;
    use crate::mock::{MockRunner, StubDownloader};
    use crate::progress::CollectingProgress;

    fn engine_payload() -> Vec<u8> {
        tgz(&[
            ("docker/docker", b"cli"),
            ("docker/dockerd", b"daemon"),
            ("docker/containerd", b"containerd"),
        ])
    }

    fn stub() -> StubDownloader {
        StubDownloader::new()
            .serve(ENGINE_ARCHIVE_URL, engine_payload())
            .serve(COMPOSE_BINARY_URL, b"compose".to_vec())
    }

    #[test]
    fn native_install_downloads_once() {
        let dir = tempfile::tempdir().unwrap();
        let install = EngineInstallation::new(dir.path().join("engine"));
        let runner = MockRunner::new();
        let downloader = stub();
        let progress = CollectingProgress::new();
        let missing_bridge = dir.path().join("no-such-bridge");
        let p = Provisioner {
            install: &install,
            mode: &ExecutionMode::Native,
            runner: &runner,
            downloader: &downloader,
            progress: &progress,
            io_bridge_source: Some(&missing_bridge),
        };

        assert_eq!(p.inspect(), InstallationState::default());
        let state = p.ensure_available().unwrap();
        assert!(state.binaries_ready);
        assert!(state.compose_ready);
        assert!(install.binaries_present());
        assert!(install.compose_present());
        assert!(!install.archive_path().exists());
        assert_eq!(downloader.fetched().len(), 2);
        assert!(!progress.events().is_empty());

        p.ensure_available().unwrap();
        assert_eq!(downloader.fetched().len(), 2);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn archive_without_dockerd_fails() {
        let dir = tempfile::tempdir().unwrap();
        let install = EngineInstallation::new(dir.path());
        let runner = MockRunner::new();
        let downloader = StubDownloader::new()
            .serve(ENGINE_ARCHIVE_URL, tgz(&[("docker/docker", b"cli")]));
        let p = Provisioner {
            install: &install,
            mode: &ExecutionMode::Native,
            runner: &runner,
            downloader: &downloader,
            progress: &crate::progress::NullProgress,
            io_bridge_source: None,
        };
        let err = p.ensure_available().unwrap_err();
        assert!(matches!(err, RuntimeError::Provisioning(_)));
    }

    #[test]
    fn download_failure_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let install = EngineInstallation::new(dir.path());
        let runner = MockRunner::new();
        let downloader = StubDownloader::new();
        let p = Provisioner {
            install: &install,
            mode: &ExecutionMode::Native,
            runner: &runner,
            downloader: &downloader,
            progress: &crate::progress::NullProgress,
            io_bridge_source: None,
        };
        assert!(matches!(
            p.ensure_available().unwrap_err(),
            RuntimeError::Download { .. }
        ));
    }

    #[test]
    fn native_bridge_is_copied() {
        let dir = tempfile::tempdir().unwrap();
        let install = EngineInstallation::new(dir.path().join("engine"));
        let bridge = dir.path().join("berth-io-build");
        fs::write(&bridge, b"bridge").unwrap();
        let runner = MockRunner::new();
        let downloader = stub();
        let p = Provisioner {
            install: &install,
            mode: &ExecutionMode::Native,
            runner: &runner,
            downloader: &downloader,
            progress: &crate::progress::NullProgress,
            io_bridge_source: Some(&bridge),
        };
        let state = p.ensure_available().unwrap();
        assert!(state.io_bridge_ready);
        assert_eq!(fs::read(install.io_bridge_exe()).unwrap(), b"bridge");
    }

    #[test]
    fn delegated_install_runs_inside_subsystem() {
        let dir = tempfile::tempdir().unwrap();
        let install = EngineInstallation::new(dir.path());
        let runner = MockRunner::new();
        runner.respond_fail(&["test", "-x"], "");
        runner.respond_ok(&["mkdir"], "");
        runner.respond_ok(&["tar", "xzf"], "");
        runner.respond_ok(&["cp"], "");
        runner.respond_ok(&["chmod"], "");
        runner.respond_ok(&["ln"], "");
        // after extraction dockerd exists
        runner.respond_from(
            1,
            &["test", "-x", "/opt/berth/docker/dockerd"],
            crate::exec::CommandOutput::ok(""),
        );
        let downloader = stub();
        let missing_bridge = dir.path().join("none");
        let mode = ExecutionMode::Delegated(Delegation::default());

        struct AdvanceAfterTar<'a>(&'a MockRunner);
        impl CommandRunner for AdvanceAfterTar<'_> {
            fn run(&self, spec: &CommandSpec) -> Result<crate::exec::CommandOutput, RuntimeError> {
                let out = self.0.run(spec);
                if spec.argv.iter().any(|a| a == "tar") {
                    self.0.advance();
                }
                out
            }
            fn spawn_detached(&self, spec: &crate::exec::DetachedSpec) -> Result<u32, RuntimeError> {
                self.0.spawn_detached(spec)
            }
            fn signal(&self, pid: u32, s: crate::exec::StopSignal) -> Result<bool, RuntimeError> {
                self.0.signal(pid, s)
            }
            fn is_alive(&self, pid: u32) -> bool {
                self.0.is_alive(pid)
            }
        }
        let wrapped = AdvanceAfterTar(&runner);

        let p = Provisioner {
            install: &install,
            mode: &mode,
            runner: &wrapped,
            downloader: &downloader,
            progress: &crate::progress::NullProgress,
            io_bridge_source: Some(&missing_bridge),
        };
        let state = p.ensure_available().unwrap();
        assert!(state.binaries_ready && state.compose_ready);

        let tar = runner.find(&["tar", "xzf"]).unwrap();
        assert_eq!(&tar.argv[..4], &["wsl", "-u", "root", "--"]);
        assert!(tar.argv.contains(&"--strip-components=1".to_owned()));
        assert!(runner
            .find(&["ln", "-sf", "/opt/berth/docker/docker-compose"])
            .is_some());
        assert!(!install.binaries_present());
    }

    #[test]
    fn delegated_extract_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let install = EngineInstallation::new(dir.path());
        let runner = MockRunner::new();
        runner.respond_ok(&["mkdir"], "");
        runner.respond_fail(&["tar", "xzf"], "gzip: stdin: not in gzip format");
        let downloader = stub();
        let mode = ExecutionMode::Delegated(Delegation::default());
        let p = Provisioner {
            install: &install,
            mode: &mode,
            runner: &runner,
            downloader: &downloader,
            progress: &crate::progress::NullProgress,
            io_bridge_source: None,
        };
        let err = p.ensure_available().unwrap_err();
        assert!(err.to_string().contains("not in gzip format"));
    }

    #[test]
    fn delegated_chmod_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let install = EngineInstallation::new(dir.path());
        let runner = MockRunner::new();
        // engine present, compose missing
        runner.respond_ok(&["test", "-x", "/opt/berth/docker/dockerd"], "");
        runner.respond_ok(&["cp"], "");
        runner.respond_fail(&["chmod"], "chmod: Operation not permitted");
        runner.respond_ok(&["mkdir"], "");
        runner.respond_ok(&["ln"], "");
        let downloader = stub();
        let mode = ExecutionMode::Delegated(Delegation::default());
        let p = Provisioner {
            install: &install,
            mode: &mode,
            runner: &runner,
            downloader: &downloader,
            progress: &crate::progress::NullProgress,
            io_bridge_source: None,
        };
        let err = p.ensure_available().unwrap_err();
        assert!(matches!(err, RuntimeError::Provisioning(_)));
        let msg = err.to_string();
        assert!(msg.contains("chmod +x /opt/berth/docker/docker-compose"), "{msg}");
        assert!(msg.contains("Operation not permitted"), "{msg}");
        assert_eq!(runner.count(&["ln", "-sf"]), 0);
    }
}
