use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Who holds the engine lock, as recorded in the lock file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub pid: u32,
    pub operation: String,
}

impl LockHolder {
    fn parse(text: &str) -> Option<Self> {
        let (pid, operation) = text.trim().split_once(' ')?;
        Some(Self {
            pid: pid.parse().ok()?,
            operation: operation.to_owned(),
        })
    }
}

/// Exclusive advisory lock on the engine installation.
///
/// Held for the duration of `ensure`, `start_daemon` and `stop_daemon` so two
/// processes never race to spawn or reap the same daemon. The holder writes
/// its pid and operation into the file so a waiting process can say what it
/// is waiting for.
pub struct DaemonLock {
    lock_file: File,
}

impl DaemonLock {
    /// Block until the lock is free, then record this process as the holder.
    pub fn acquire(lock_path: &Path, operation: &str) -> Result<Self, CoreError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;

        if file.try_lock_exclusive().is_err() {
            match Self::holder(lock_path) {
                Some(h) => info!(
                    "waiting for engine lock held by pid {} ({})",
                    h.pid, h.operation
                ),
                None => info!("waiting for engine lock at {}", lock_path.display()),
            }
            file.lock_exclusive().map_err(|e| {
                let held_by = Self::holder(lock_path)
                    .map(|h| format!(" held by pid {} ({})", h.pid, h.operation))
                    .unwrap_or_default();
                CoreError::Lock(format!("{}{held_by}: {e}", lock_path.display()))
            })?;
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{} {operation}", std::process::id())?;
        debug!("engine lock acquired for {operation}");
        Ok(Self { lock_file: file })
    }

    /// The recorded holder; stale once the lock is released.
    pub fn holder(lock_path: &Path) -> Option<LockHolder> {
        LockHolder::parse(&std::fs::read_to_string(lock_path).ok()?)
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let _ = self.lock_file.set_len(0);
        let _ = self.lock_file.unlock();
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// First Ctrl-C stops wait loops at their next poll; a second one exits.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(1);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, finishing current operation...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
