use crate::exec::{CommandRunner, CommandSpec};
use crate::RuntimeError;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Everything needed to relaunch the daemon with elevated rights.
#[derive(Debug, Clone, Copy)]
pub struct ElevationRequest<'a> {
    pub dockerd: &'a Path,
    pub data_root: &'a Path,
    pub log_file: &'a Path,
    /// Where the elevated helper records the daemon pid.
    pub pid_file: &'a Path,
    pub script: &'a Path,
}

/// One-shot privilege elevation. `elevate` returns once consent was granted
/// and the helper launched; the caller then polls for the daemon.
pub trait Elevator: Send + Sync {
    fn elevate(&self, request: &ElevationRequest<'_>) -> Result<(), RuntimeError>;
}

/// Windows consent prompt via `Start-Process -Verb RunAs`; unsupported elsewhere.
pub struct PlatformElevator {
    runner: Arc<dyn CommandRunner>,
}

impl PlatformElevator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

/// Batch helper that starts dockerd and records its pid.
pub fn helper_script(request: &ElevationRequest<'_>) -> String {
    format!(
        "@echo off\r\n\
         start \"\" /b \"{dockerd}\" --data-root \"{data}\" >> \"{log}\" 2>&1\r\n\
         for /f \"tokens=2\" %%a in ('tasklist /fi \"imagename eq dockerd.exe\" /fo list ^| findstr \"PID:\"') do (\r\n\
         \x20 echo %%a> \"{pid}\"\r\n\
         )\r\n",
        dockerd = request.dockerd.display(),
        data = request.data_root.display(),
        log = request.log_file.display(),
        pid = request.pid_file.display(),
    )
}

fn powershell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

impl Elevator for PlatformElevator {
    fn elevate(&self, request: &ElevationRequest<'_>) -> Result<(), RuntimeError> {
        if !cfg!(windows) {
            return Err(RuntimeError::Privilege(
                "the daemon needs elevated privileges and this platform has no consent prompt; \
                 start it as root or grant the current user access to the engine"
                    .to_owned(),
            ));
        }

        std::fs::write(request.script, helper_script(request))?;
        let working_dir = request.script.parent().unwrap_or(Path::new("."));
        let command = format!(
            "Start-Process -FilePath {} -Verb RunAs -WindowStyle Hidden -WorkingDirectory {}",
            powershell_quote(&request.script.display().to_string()),
            powershell_quote(&working_dir.display().to_string()),
        );
        info!("requesting elevation for dockerd");
        let out = self.runner.run(
            &CommandSpec::new([
                "powershell".to_owned(),
                "-NoProfile".to_owned(),
                "-NonInteractive".to_owned(),
                "-Command".to_owned(),
                command,
            ])
            .timeout_secs(120),
        )?;
        if out.success() {
            Ok(())
        } else {
            Err(RuntimeError::Privilege(format!(
                "elevation was denied: {}",
                out.diagnostic()
            )))
        }
    }
}
