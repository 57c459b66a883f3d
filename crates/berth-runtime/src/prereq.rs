use crate::exec::{CommandRunner, CommandSpec};
use crate::mode::ExecutionMode;
use std::fmt;
use tracing::{info, warn};

/// Appended to the prerequisite report when an install needs a reboot.
pub const REBOOT_NOTICE: &str = "A reboot is required after installation.";

/// A missing prerequisite with actionable install instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
    /// Installing it requires a host reboot.
    pub needs_reboot: bool,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

/// Check what the selected mode needs before an engine can be installed.
/// An empty list means everything is in place.
pub fn check_prereqs(runner: &dyn CommandRunner, mode: &ExecutionMode) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();
    match mode {
        ExecutionMode::Native => {
            if !cfg!(target_os = "linux") {
                missing.push(MissingPrereq {
                    name: "Linux kernel",
                    purpose: "running Linux container images natively",
                    install_hint: "use delegated mode (--delegated) on this host",
                    needs_reboot: false,
                });
            }
        }
        ExecutionMode::Delegated(d) => {
            let reachable =
                runner.probe(&CommandSpec::new([d.program(), "echo", "OK"]).timeout_secs(15));
            if !reachable {
                missing.push(MissingPrereq {
                    name: "WSL2",
                    purpose: "Linux environment hosting the container engine",
                    install_hint: "run `wsl --install` from an administrator PowerShell",
                    needs_reboot: true,
                });
            }
        }
    }
    missing
}

/// Install companion packages the daemon needs inside the delegated
/// environment. Failures are logged and returned as warnings, never fatal.
pub fn ensure_companion_packages(runner: &dyn CommandRunner, mode: &ExecutionMode) -> Vec<String> {
    let mut warnings = Vec::new();
    if !mode.is_delegated() {
        return warnings;
    }
    if runner.probe(&CommandSpec::new(mode.wrap(["which", "iptables"])).timeout_secs(5)) {
        return warnings;
    }
    info!("iptables not found in the delegated environment, installing");
    let installed = runner.probe(
        &CommandSpec::new(mode.wrap([
            "sh",
            "-c",
            "apt-get update -qq && apt-get install -y -qq iptables 2>&1 | tail -3",
        ]))
        .timeout_secs(120),
    );
    if installed {
        info!("iptables installed");
    } else {
        warn!("iptables installation may have failed; bridge networking can be unavailable");
        warnings.push("iptables installation failed".to_owned());
    }
    warnings
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    if missing.iter().any(|m| m.needs_reboot) {
        msg.push('\n');
        msg.push_str(REBOOT_NOTICE);
    }
    msg
}
