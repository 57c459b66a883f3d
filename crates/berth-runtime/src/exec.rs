//! Subprocess execution with enforced timeouts.
//!
//! Every engine and compose interaction goes through [`CommandRunner`] so the
//! supervisor and orchestrator can be driven by [`MockRunner`](crate::mock::MockRunner)
//! in tests.

use crate::RuntimeError;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const WAIT_POLL: Duration = Duration::from_millis(20);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;
#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// A foreground command whose output is captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            cwd: None,
            stdin: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    #[must_use]
    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    #[must_use]
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// A background process that outlives the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedSpec {
    pub argv: Vec<String>,
    /// stdout and stderr are appended here; discarded when `None`.
    pub log_file: Option<PathBuf>,
}

impl DetachedSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            log_file: None,
        }
    }

    #[must_use]
    pub fn log_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stderr when it says anything, stdout otherwise.
    pub fn diagnostic(&self) -> &str {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim()
        } else {
            err
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM; `taskkill` without `/F` on Windows.
    Terminate,
    /// SIGKILL; `taskkill /F` on Windows.
    Kill,
}

pub trait CommandRunner: Send + Sync {
    /// Run to completion or until `spec.timeout`, whichever comes first.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RuntimeError>;

    /// Start a process in its own process group and return its pid.
    fn spawn_detached(&self, spec: &DetachedSpec) -> Result<u32, RuntimeError>;

    /// Deliver `signal`. Returns `false` if the process was already gone.
    fn signal(&self, pid: u32, signal: StopSignal) -> Result<bool, RuntimeError>;

    fn is_alive(&self, pid: u32) -> bool;

    /// `run` collapsed to "did it exit 0".
    fn probe(&self, spec: &CommandSpec) -> bool {
        self.run(spec).is_ok_and(|o| o.success())
    }
}

/// Runs real processes on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

fn build_command(argv: &[String]) -> Result<Command, RuntimeError> {
    let (program, args) = argv.split_first().ok_or_else(|| RuntimeError::CommandFailed {
        command: String::new(),
        detail: "empty command line".to_owned(),
    })?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

fn spawn_error(program: &str, e: std::io::Error) -> RuntimeError {
    if e.kind() == std::io::ErrorKind::NotFound {
        RuntimeError::CommandNotFound(program.to_owned())
    } else {
        RuntimeError::Io(e)
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut p) = pipe {
            let _ = p.read_to_end(&mut buf);
        }
        buf
    })
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RuntimeError> {
        let mut cmd = build_command(&spec.argv)?;
        if let Some(ref dir) = spec.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        debug!("exec: {}", spec.display());
        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_error(&spec.argv[0], e))?;

        if let (Some(data), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            std::thread::spawn(move || {
                let _ = stdin.write_all(&data);
            });
        }
        let out = drain(child.stdout.take());
        let err = drain(child.stderr.take());

        let deadline = Instant::now() + spec.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RuntimeError::Timeout {
                    command: spec.display(),
                    secs: spec.timeout.as_secs(),
                });
            }
            std::thread::sleep(WAIT_POLL);
        };

        Ok(CommandOutput {
            status: status.code(),
            stdout: String::from_utf8_lossy(&out.join().unwrap_or_default()).into_owned(),
            stderr: String::from_utf8_lossy(&err.join().unwrap_or_default()).into_owned(),
        })
    }

    fn spawn_detached(&self, spec: &DetachedSpec) -> Result<u32, RuntimeError> {
        let mut cmd = build_command(&spec.argv)?;
        cmd.stdin(Stdio::null());
        match spec.log_file {
            Some(ref path) => {
                let log = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                cmd.stdout(log.try_clone()?).stderr(log);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP);
        }

        debug!("spawn detached: {}", spec.argv.join(" "));
        let child = cmd
            .spawn()
            .map_err(|e| spawn_error(&spec.argv[0], e))?;
        Ok(child.id())
    }

    #[cfg(unix)]
    fn signal(&self, pid: u32, signal: StopSignal) -> Result<bool, RuntimeError> {
        let pid_i32 = i32::try_from(pid).map_err(|_| RuntimeError::CommandFailed {
            command: format!("kill {pid}"),
            detail: "pid exceeds i32 range".to_owned(),
        })?;
        let signo = match signal {
            StopSignal::Terminate => libc::SIGTERM,
            StopSignal::Kill => libc::SIGKILL,
        };
        // SAFETY: kill() with a valid pid and signal is safe; pid validated via i32::try_from above.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(pid_i32, signo) };
        if ret == 0 {
            return Ok(true);
        }
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() == Some(libc::ESRCH) {
            debug!("pid {pid} already exited");
            Ok(false)
        } else {
            Err(RuntimeError::CommandFailed {
                command: format!("kill {pid}"),
                detail: errno.to_string(),
            })
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, pid: u32, signal: StopSignal) -> Result<bool, RuntimeError> {
        let mut argv = vec!["taskkill".to_owned()];
        if signal == StopSignal::Kill {
            argv.push("/F".to_owned());
        }
        argv.extend(["/PID".to_owned(), pid.to_string()]);
        let out = self.run(&CommandSpec::new(argv).timeout_secs(10))?;
        Ok(out.success())
    }

    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid_i32) = i32::try_from(pid) else {
            return false;
        };
        // an exited child of ours stays a zombie, and kill(0) succeeds on zombies
        let mut status: libc::c_int = 0;
        // SAFETY: WNOHANG never blocks; a pid that is not our child yields ECHILD.
        #[allow(unsafe_code)]
        let reaped = unsafe { libc::waitpid(pid_i32, &mut status, libc::WNOHANG) };
        if reaped == pid_i32 {
            debug!("reaped exited child {pid}");
            return false;
        }
        // SAFETY: signal 0 performs only the existence and permission check.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(pid_i32, 0) };
        ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    fn is_alive(&self, pid: u32) -> bool {
        let spec = CommandSpec::new([
            "tasklist".to_owned(),
            "/FI".to_owned(),
            format!("PID eq {pid}"),
            "/NH".to_owned(),
        ])
        .timeout_secs(10);
        self.run(&spec)
            .is_ok_and(|o| o.stdout.contains(&pid.to_string()))
    }
}
