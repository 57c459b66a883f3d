//! Native vs. delegated command routing.
//!
//! Game-server images need a Linux kernel. On hosts without one every engine
//! command is routed through a fixed prefix into a Linux subsystem running as
//! root, and host paths are rewritten into that subsystem's path space.

use crate::layout::{EngineInstallation, DOCKER_BIN};
use std::path::Path;

pub const DELEGATED_ROOT: &str = "/opt/berth/docker";

/// Where and how delegated commands run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delegation {
    pub prefix: Vec<String>,
    /// Install root inside the delegated environment.
    pub root: String,
}

impl Default for Delegation {
    fn default() -> Self {
        Self {
            prefix: ["wsl", "-u", "root", "--"].map(str::to_owned).to_vec(),
            root: DELEGATED_ROOT.to_owned(),
        }
    }
}

impl Delegation {
    pub fn path(&self, name: &str) -> String {
        format!("{}/{name}", self.root)
    }

    pub fn data_root(&self) -> String {
        self.path("data")
    }

    pub fn log_file(&self) -> String {
        self.path("dockerd.log")
    }

    pub fn pid_file(&self) -> String {
        self.path("dockerd.pid")
    }

    pub fn launcher(&self) -> String {
        self.path("start-dockerd.sh")
    }

    /// The program that hosts the delegation prefix (e.g. `wsl`).
    pub fn program(&self) -> &str {
        self.prefix.first().map_or("wsl", String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    Native,
    Delegated(Delegation),
}

impl ExecutionMode {
    /// Delegated on Windows hosts, native everywhere else.
    pub fn detect() -> Self {
        if cfg!(windows) {
            Self::Delegated(Delegation::default())
        } else {
            Self::Native
        }
    }

    /// An explicit caller choice wins over host detection.
    pub fn from_flag(delegated: Option<bool>) -> Self {
        match delegated {
            Some(true) => Self::Delegated(Delegation::default()),
            Some(false) => Self::Native,
            None => Self::detect(),
        }
    }

    pub fn is_delegated(&self) -> bool {
        matches!(self, Self::Delegated(_))
    }

    pub fn delegation(&self) -> Option<&Delegation> {
        match self {
            Self::Native => None,
            Self::Delegated(d) => Some(d),
        }
    }

    /// Prefix `argv` with the delegation invocation, if any.
    pub fn wrap<I, S>(&self, argv: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out = match self {
            Self::Native => Vec::new(),
            Self::Delegated(d) => d.prefix.clone(),
        };
        out.extend(argv.into_iter().map(Into::into));
        out
    }

    /// Engine CLI invocation: the installed binary when present, else `docker` on PATH.
    pub fn engine_cli(&self, install: &EngineInstallation) -> Vec<String> {
        match self {
            Self::Native => {
                let exe = install.docker_exe();
                if exe.exists() {
                    vec![exe.display().to_string()]
                } else {
                    vec![DOCKER_BIN.to_owned()]
                }
            }
            Self::Delegated(d) => self.wrap([d.path(DOCKER_BIN)]),
        }
    }

    /// Compose CLI invocation: the standalone compose binary when installed
    /// natively, otherwise the `docker compose` plugin form.
    pub fn compose_cli(&self, install: &EngineInstallation) -> Vec<String> {
        match self {
            Self::Native => {
                let exe = install.compose_exe();
                if exe.exists() {
                    vec![exe.display().to_string()]
                } else {
                    vec![DOCKER_BIN.to_owned(), "compose".to_owned()]
                }
            }
            Self::Delegated(d) => self.wrap([d.path(DOCKER_BIN), "compose".to_owned()]),
        }
    }

    /// Compose `-f` argument for an instance. Delegated commands run with the
    /// instance directory as cwd, so the bare file name resolves there.
    pub fn compose_file_arg(&self, instance_dir: &Path, file: &str) -> String {
        match self {
            Self::Native => instance_dir.join(file).display().to_string(),
            Self::Delegated(_) => file.to_owned(),
        }
    }

    pub fn translate_path(&self, path: &Path) -> String {
        let raw = path.display().to_string();
        match self {
            Self::Native => raw,
            Self::Delegated(_) => to_delegated_path(&raw),
        }
    }

    /// Delegated bridge networking cannot reliably forward UDP game traffic.
    pub fn forces_host_network(&self) -> bool {
        self.is_delegated()
    }
}

/// `C:\games\x` becomes `/mnt/c/games/x`; anything without a drive letter
/// only has its separators normalized.
pub fn to_delegated_path(raw: &str) -> String {
    let s = raw.replace('\\', "/");
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(drive), Some(':')) if drive.is_ascii_alphabetic() => {
            format!("/mnt/{}{}", drive.to_ascii_lowercase(), &s[2..])
        }
        _ => s,
    }
}
