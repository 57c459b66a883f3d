//! Engine supervision and per-instance orchestration for Berth.
//!
//! This crate ties the host plumbing of `berth-runtime` and the manifest
//! renderer of `berth-schema` into two services: the `DaemonSupervisor`,
//! which installs, starts, waits for, and stops the container engine, and the
//! `Orchestrator`, which answers the per-instance hooks (start, stop, status,
//! stats, logs, provisioning) against an instance's compose manifest. It also
//! provides the daemon lifecycle state machine, the engine lock, lenient
//! parsing of compose output, and the asset installer capability.

pub mod concurrency;
pub mod containers;
pub mod daemon;
pub mod hooks;
pub mod installer;
pub mod lifecycle;
pub mod orchestrator;

pub use concurrency::{install_signal_handler, shutdown_requested, DaemonLock, LockHolder};
pub use containers::{
    parse_compose_ps, parse_percent, select_primary, top_matches, ContainerRecord, ContainerStats,
};
pub use daemon::{
    DaemonSupervisor, EngineInfo, EngineStatus, EnsureOptions, EnsureOutcome, Readiness,
    StartOutcome, StopOutcome, SupervisorTiming,
};
pub use hooks::{
    dispatch, error_payload, instance_context, success_payload, EngineConfig, Hook,
    InstanceRequest, ProvisionRequest, RegenerateRequest, ShutdownAllRequest,
};
pub use installer::{
    AssetInstaller, CommandInstaller, InstallOutcome, InstallRequest, InstallerRegistry, STEAMCMD,
};
pub use lifecycle::{validate_transition, DaemonState};
pub use orchestrator::{
    ComposeReport, EnrichReport, InstanceStatus, LogFollower, Orchestrator, SettlePolicy,
    StatsReport,
};

use berth_runtime::{RuntimeError, REBOOT_NOTICE};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("manifest error: {0}")]
    Manifest(#[from] berth_schema::ManifestError),
    #[error("{0}")]
    Runtime(#[from] RuntimeError),
    #[error("container engine started but did not respond within {secs}s")]
    DaemonUnresponsive { secs: u64, log_tail: String },
    #[error("container engine failed to start: {line}")]
    DaemonFatal { line: String, log_tail: String },
    #[error("no {file} found in {dir}")]
    ManifestMissing { dir: String, file: &'static str },
    #[error("container started but is not running (state: {state}); check logs for details")]
    ContainerNotRunning { state: String, logs: String },
    #[error("{0}")]
    NotFound(String),
    #[error("asset installation failed: {0}")]
    Install(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("engine lock error: {0}")]
    Lock(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Daemon log lines attached to engine start failures.
    pub fn log_tail(&self) -> Option<&str> {
        match self {
            Self::DaemonUnresponsive { log_tail, .. } | Self::DaemonFatal { log_tail, .. } => {
                Some(log_tail)
            }
            _ => None,
        }
    }

    /// Missing prerequisites whose installation needs a host reboot.
    pub fn needs_reboot(&self) -> bool {
        matches!(self, Self::Runtime(RuntimeError::PrerequisiteMissing(m)) if m.contains(REBOOT_NOTICE))
    }

    /// Whether the failure came from the engine rather than the request or manifest.
    pub fn is_engine_failure(&self) -> bool {
        matches!(
            self,
            Self::Runtime(_)
                | Self::DaemonUnresponsive { .. }
                | Self::DaemonFatal { .. }
                | Self::Lock(_)
        )
    }
}
