//! Host-facing plumbing for the Berth engine supervisor.
//!
//! This crate owns everything that touches the host directly: the
//! `ExecutionMode` router (native vs. delegated through a Linux subsystem),
//! the `CommandRunner` seam with its real and scripted implementations,
//! on-disk `EngineInstallation` layout, archive download and extraction, the
//! `Provisioner` that installs engine and compose binaries, prerequisite
//! checks, privilege elevation, and the `PROGRESS:` side channel.

pub mod download;
pub mod elevate;
pub mod exec;
pub mod layout;
pub mod mock;
pub mod mode;
pub mod prereq;
pub mod progress;
pub mod provision;

pub use download::{extract_engine_archive, Downloader, HttpDownloader};
pub use elevate::{ElevationRequest, Elevator, PlatformElevator};
pub use exec::{CommandOutput, CommandRunner, CommandSpec, DetachedSpec, StopSignal, SystemRunner};
pub use layout::EngineInstallation;
pub use mode::{Delegation, ExecutionMode};
pub use prereq::{
    check_prereqs, ensure_companion_packages, format_missing, MissingPrereq, REBOOT_NOTICE,
};
pub use progress::{CollectingProgress, NullProgress, ProgressEvent, ProgressSink, StderrProgress};
pub use provision::{InstallationState, Provisioner};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command not found: {0}")]
    CommandNotFound(String),
    #[error("command '{command}' failed: {detail}")]
    CommandFailed { command: String, detail: String },
    #[error("command '{command}' timed out after {secs}s")]
    Timeout { command: String, secs: u64 },
    #[error("download of {url} failed: {detail}")]
    Download { url: String, detail: String },
    #[error("provisioning failed: {0}")]
    Provisioning(String),
    #[error("{0}")]
    PrerequisiteMissing(String),
    #[error("privilege error: {0}")]
    Privilege(String),
}
