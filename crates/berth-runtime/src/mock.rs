//! Scripted stand-ins for the host: a command runner that answers from rules,
//! a downloader that serves in-memory payloads, and an elevator that records
//! requests. Used by the test suites of every crate in the workspace.

use crate::download::Downloader;
use crate::elevate::{ElevationRequest, Elevator};
use crate::exec::{CommandOutput, CommandRunner, CommandSpec, DetachedSpec, StopSignal};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::RuntimeError;
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const FIRST_FAKE_PID: u32 = 40_000;

#[derive(Debug, Clone)]
enum Reply {
    Output(CommandOutput),
    Timeout,
}

#[derive(Debug, Clone)]
struct Rule {
    needle: Vec<String>,
    from_generation: u32,
    reply: Reply,
}

#[derive(Debug, Default)]
struct MockState {
    rules: Vec<Rule>,
    calls: Vec<CommandSpec>,
    spawned: Vec<DetachedSpec>,
    signals: Vec<(u32, StopSignal)>,
    alive: HashSet<u32>,
    spawn_output: Option<String>,
    generation: u32,
    next_pid: u32,
}

/// A [`CommandRunner`] that answers from registered rules.
///
/// A rule matches when its needle appears as a contiguous run of arguments in
/// the command line. Rules belong to a *generation*: the runner starts at
/// generation 0 and advances on every detached spawn (and on
/// [`advance`](Self::advance)), so a test can script "the daemon does not
/// answer until it has been started". Among matching rules the one from the
/// latest active generation wins, then the most recently registered.
/// Unmatched commands fail with exit code 127.
#[derive(Debug, Default)]
pub struct MockRunner {
    state: Mutex<MockState>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn push(&self, needle: &[&str], from_generation: u32, reply: Reply) -> &Self {
        self.lock().rules.push(Rule {
            needle: needle.iter().map(|s| (*s).to_owned()).collect(),
            from_generation,
            reply,
        });
        self
    }

    pub fn respond(&self, needle: &[&str], output: CommandOutput) -> &Self {
        self.push(needle, 0, Reply::Output(output))
    }

    pub fn respond_ok(&self, needle: &[&str], stdout: &str) -> &Self {
        self.respond(needle, CommandOutput::ok(stdout))
    }

    pub fn respond_fail(&self, needle: &[&str], stderr: &str) -> &Self {
        self.respond(needle, CommandOutput::failed(1, stderr))
    }

    /// Register a reply that only applies once `generation` is reached.
    pub fn respond_from(&self, generation: u32, needle: &[&str], output: CommandOutput) -> &Self {
        self.push(needle, generation, Reply::Output(output))
    }

    pub fn respond_timeout(&self, needle: &[&str]) -> &Self {
        self.push(needle, 0, Reply::Timeout)
    }

    /// Move to the next generation.
    pub fn advance(&self) -> u32 {
        let mut s = self.lock();
        s.generation += 1;
        s.generation
    }

    pub fn generation(&self) -> u32 {
        self.lock().generation
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.lock().calls.iter().map(|c| c.argv.clone()).collect()
    }

    pub fn specs(&self) -> Vec<CommandSpec> {
        self.lock().calls.clone()
    }

    pub fn count(&self, needle: &[&str]) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| contains_run(&c.argv, needle))
            .count()
    }

    /// The first recorded call matching `needle`.
    pub fn find(&self, needle: &[&str]) -> Option<CommandSpec> {
        self.lock()
            .calls
            .iter()
            .find(|c| contains_run(&c.argv, needle))
            .cloned()
    }

    pub fn spawned(&self) -> Vec<DetachedSpec> {
        self.lock().spawned.clone()
    }

    pub fn signals(&self) -> Vec<(u32, StopSignal)> {
        self.lock().signals.clone()
    }

    /// Text every later detached spawn writes to its log file, standing in
    /// for what the process prints once started.
    pub fn spawn_writes(&self, text: &str) -> &Self {
        self.lock().spawn_output = Some(text.to_owned());
        self
    }

    pub fn set_alive(&self, pid: u32, alive: bool) {
        let mut s = self.lock();
        if alive {
            s.alive.insert(pid);
        } else {
            s.alive.remove(&pid);
        }
    }
}

fn contains_run(argv: &[String], needle: &[&str]) -> bool {
    needle.is_empty()
        || argv
            .windows(needle.len())
            .any(|w| w.iter().zip(needle).all(|(a, b)| a == b))
}

impl CommandRunner for MockRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RuntimeError> {
        let mut s = self.lock();
        s.calls.push(spec.clone());
        let generation = s.generation;
        let reply = s
            .rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.from_generation <= generation)
            .filter(|(_, r)| {
                let needle: Vec<&str> = r.needle.iter().map(String::as_str).collect();
                contains_run(&spec.argv, &needle)
            })
            .max_by_key(|(i, r)| (r.from_generation, *i))
            .map(|(_, r)| r.reply.clone());
        match reply {
            Some(Reply::Output(out)) => Ok(out),
            Some(Reply::Timeout) => Err(RuntimeError::Timeout {
                command: spec.display(),
                secs: spec.timeout.as_secs(),
            }),
            None => Ok(CommandOutput::failed(127, "no scripted response")),
        }
    }

    fn spawn_detached(&self, spec: &DetachedSpec) -> Result<u32, RuntimeError> {
        let mut s = self.lock();
        if let (Some(text), Some(path)) = (&s.spawn_output, &spec.log_file) {
            let mut log = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            log.write_all(text.as_bytes())?;
        }
        s.spawned.push(spec.clone());
        let pid = FIRST_FAKE_PID + s.next_pid;
        s.next_pid += 1;
        s.alive.insert(pid);
        s.generation += 1;
        Ok(pid)
    }

    fn signal(&self, pid: u32, signal: StopSignal) -> Result<bool, RuntimeError> {
        let mut s = self.lock();
        s.signals.push((pid, signal));
        Ok(s.alive.remove(&pid))
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.lock().alive.contains(&pid)
    }
}

/// Serves fixed payloads by URL.
#[derive(Debug, Default)]
pub struct StubDownloader {
    payloads: Mutex<BTreeMap<String, Vec<u8>>>,
    fetched: Mutex<Vec<String>>,
}

impl StubDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn serve(self, url: &str, data: impl Into<Vec<u8>>) -> Self {
        if let Ok(mut p) = self.payloads.lock() {
            p.insert(url.to_owned(), data.into());
        }
        self
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

impl Downloader for StubDownloader {
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        label: &str,
        progress: &dyn ProgressSink,
    ) -> Result<u64, RuntimeError> {
        if let Ok(mut f) = self.fetched.lock() {
            f.push(url.to_owned());
        }
        let data = self
            .payloads
            .lock()
            .ok()
            .and_then(|p| p.get(url).cloned())
            .ok_or_else(|| RuntimeError::Download {
                url: url.to_owned(),
                detail: "HTTP 404".to_owned(),
            })?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, &data)?;
        progress.emit(&ProgressEvent::new(100, format!("{label}: done")));
        Ok(data.len() as u64)
    }
}

/// Records elevation requests. On success it writes `pid` to the elevated pid
/// file and advances the attached runner, so rules registered for the next
/// generation describe the elevated daemon.
pub struct MockElevator {
    runner: Option<Arc<MockRunner>>,
    outcome: Result<u32, String>,
    requests: Mutex<u32>,
}

impl MockElevator {
    pub fn granting(pid: u32, runner: Arc<MockRunner>) -> Self {
        Self {
            runner: Some(runner),
            outcome: Ok(pid),
            requests: Mutex::new(0),
        }
    }

    pub fn denying(reason: &str) -> Self {
        Self {
            runner: None,
            outcome: Err(reason.to_owned()),
            requests: Mutex::new(0),
        }
    }

    pub fn requests(&self) -> u32 {
        self.requests.lock().map(|r| *r).unwrap_or_default()
    }
}

impl Elevator for MockElevator {
    fn elevate(&self, request: &ElevationRequest<'_>) -> Result<(), RuntimeError> {
        if let Ok(mut r) = self.requests.lock() {
            *r += 1;
        }
        match &self.outcome {
            Ok(pid) => {
                std::fs::write(request.pid_file, pid.to_string())?;
                if let Some(runner) = &self.runner {
                    runner.set_alive(*pid, true);
                    runner.advance();
                }
                Ok(())
            }
            Err(reason) => Err(RuntimeError::Privilege(reason.clone())),
        }
    }
}
