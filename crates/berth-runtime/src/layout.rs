use std::fs;
use std::path::{Path, PathBuf};

pub const DOCKER_BIN: &str = "docker";
pub const DOCKERD_BIN: &str = "dockerd";
pub const COMPOSE_BIN: &str = "docker-compose";
pub const IO_BRIDGE_BIN: &str = "berth-io";

/// On-disk layout of a portable engine installation.
///
/// In delegated mode the binaries live inside the Linux subsystem (see
/// [`Delegation`](crate::Delegation)); the host-side root then only holds the
/// pid files, lock, and staging area.
#[derive(Debug, Clone)]
pub struct EngineInstallation {
    root: PathBuf,
}

/// A pid recorded by a previous start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedPid {
    pub pid: u32,
    pub elevated: bool,
}

impl EngineInstallation {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `%APPDATA%\berth\docker` on Windows, `~/.config/berth/docker` elsewhere.
    pub fn default_root() -> PathBuf {
        if cfg!(windows) {
            if let Some(appdata) = std::env::var_os("APPDATA") {
                return PathBuf::from(appdata).join("berth").join("docker");
            }
        }
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home)
                .join(".config")
                .join("berth")
                .join("docker"),
            None => PathBuf::from("docker"),
        }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn docker_exe(&self) -> PathBuf {
        self.root.join(DOCKER_BIN)
    }

    #[inline]
    pub fn dockerd_exe(&self) -> PathBuf {
        self.root.join(DOCKERD_BIN)
    }

    #[inline]
    pub fn compose_exe(&self) -> PathBuf {
        self.root.join(COMPOSE_BIN)
    }

    #[inline]
    pub fn io_bridge_exe(&self) -> PathBuf {
        self.root.join(IO_BRIDGE_BIN)
    }

    #[inline]
    pub fn data_root(&self) -> PathBuf {
        self.root.join("data")
    }

    #[inline]
    pub fn log_file(&self) -> PathBuf {
        self.root.join("dockerd.log")
    }

    #[inline]
    pub fn pid_file(&self) -> PathBuf {
        self.root.join("dockerd.pid")
    }

    #[inline]
    pub fn elevated_pid_file(&self) -> PathBuf {
        self.root.join("dockerd-elevated.pid")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join("engine.lock")
    }

    #[inline]
    pub fn archive_path(&self) -> PathBuf {
        self.root.join("docker.tgz")
    }

    #[inline]
    pub fn elevation_script(&self) -> PathBuf {
        self.root.join("elevated-start.bat")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.root)
    }

    pub fn binaries_present(&self) -> bool {
        self.docker_exe().exists() && self.dockerd_exe().exists()
    }

    pub fn compose_present(&self) -> bool {
        self.compose_exe().exists()
    }

    /// The normal pid file wins over the elevated one.
    pub fn tracked_pid(&self) -> Option<TrackedPid> {
        if let Some(pid) = read_pid_file(&self.pid_file()) {
            return Some(TrackedPid {
                pid,
                elevated: false,
            });
        }
        read_pid_file(&self.elevated_pid_file()).map(|pid| TrackedPid {
            pid,
            elevated: true,
        })
    }

    pub fn write_pid(&self, pid: u32) -> std::io::Result<()> {
        self.ensure_dirs()?;
        fs::write(self.pid_file(), pid.to_string())
    }

    pub fn clear_pids(&self) {
        let _ = fs::remove_file(self.pid_file());
        let _ = fs::remove_file(self.elevated_pid_file());
    }

    /// Last `lines` lines of the daemon log; empty when there is no log.
    pub fn log_tail(&self, lines: usize) -> String {
        fs::read(self.log_file())
            .map(|bytes| tail_lines(&String::from_utf8_lossy(&bytes), lines))
            .unwrap_or_default()
    }

    /// Empty the daemon log so only the next run's output is scanned.
    pub fn reset_log(&self) -> std::io::Result<()> {
        self.ensure_dirs()?;
        fs::File::create(self.log_file()).map(drop)
    }
}

fn read_pid_file(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

pub fn tail_lines(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_live_under_root() {
        let install = EngineInstallation::new("/opt/x");
        assert_eq!(install.dockerd_exe(), PathBuf::from("/opt/x/dockerd"));
        assert_eq!(install.compose_exe(), PathBuf::from("/opt/x/docker-compose"));
        assert_eq!(install.io_bridge_exe(), PathBuf::from("/opt/x/berth-io"));
        assert_eq!(install.data_root(), PathBuf::from("/opt/x/data"));
        assert_eq!(install.lock_file(), PathBuf::from("/opt/x/engine.lock"));
    }

    #[test]
    fn pid_roundtrip_and_elevated_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let install = EngineInstallation::new(dir.path());
        assert!(install.tracked_pid().is_none());

        fs::write(install.elevated_pid_file(), "77\n").unwrap();
        assert_eq!(
            install.tracked_pid(),
            Some(TrackedPid {
                pid: 77,
                elevated: true
            })
        );

        install.write_pid(4242).unwrap();
        assert_eq!(install.tracked_pid().map(|t| t.pid), Some(4242));

        install.clear_pids();
        assert!(install.tracked_pid().is_none());
    }

    #[test]
    fn garbage_pid_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let install = EngineInstallation::new(dir.path());
        fs::write(install.pid_file(), "not-a-pid").unwrap();
        assert!(install.tracked_pid().is_none());
    }

    #[test]
    fn log_tail_keeps_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let install = EngineInstallation::new(dir.path());
        assert_eq!(install.log_tail(5), "");
        let text: String = (0..30).map(|i| format!("line {i}\n")).collect();
        fs::write(install.log_file(), text).unwrap();
        let tail = install.log_tail(3);
        assert_eq!(tail, "line 27\nline 28\nline 29");
    }

    #[test]
    fn reset_log_empties_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let install = EngineInstallation::new(dir.path().join("engine"));
        install.reset_log().unwrap();
        assert_eq!(fs::read_to_string(install.log_file()).unwrap(), "");
        fs::write(install.log_file(), "failed to start daemon: old\n").unwrap();
        install.reset_log().unwrap();
        assert_eq!(install.log_tail(15), "");
    }

    #[test]
    fn binaries_present_needs_both() {
        let dir = tempfile::tempdir().unwrap();
        let install = EngineInstallation::new(dir.path());
        fs::write(install.docker_exe(), b"").unwrap();
        assert!(!install.binaries_present());
        fs::write(install.dockerd_exe(), b"").unwrap();
        assert!(install.binaries_present());
    }
}
