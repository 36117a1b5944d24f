//! PID file of a running broker.
//!
//! `saftbusd start` records its PID here; `stop` and `status` use it to find
//! the broker. A file naming a process that no longer exists is stale and
//! is removed when noticed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("Failed to write PID file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("PID {0} does not fit pid_t")]
    PidOutOfRange(u32),

    #[error("Failed to signal process {pid}: {source}")]
    Signal { pid: u32, source: io::Error },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The recorded PID, if the file exists and holds one.
    pub fn read(&self) -> Option<u32> {
        fs::read_to_string(&self.path).ok()?.trim().parse().ok()
    }

    /// Records the current process, creating parent directories as needed.
    pub fn write_current(&self) -> Result<(), PidFileError> {
        let write = || -> io::Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&self.path, std::process::id().to_string())
        };
        write().map_err(|source| PidFileError::Write {
            path: self.path.clone(),
            source,
        })
    }

    pub fn remove(&self) {
        let _ = fs::remove_file(&self.path);
    }

    /// PID of the broker if it is still alive. Removes a stale file.
    pub fn running(&self) -> Option<u32> {
        let pid = self.read()?;
        if is_process_running(pid) {
            return Some(pid);
        }
        debug!(pid, path = %self.path.display(), "Removing stale PID file");
        self.remove();
        None
    }
}

pub fn is_process_running(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Sends SIGTERM to `pid`.
pub fn terminate(pid: u32) -> Result<(), PidFileError> {
    let raw = libc::pid_t::try_from(pid).map_err(|_| PidFileError::PidOutOfRange(pid))?;
    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(raw, libc::SIGTERM) } != 0 {
        return Err(PidFileError::Signal {
            pid,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Polls until `pid` has exited. Returns false if it outlived `timeout`.
pub fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();
    while is_process_running(pid) {
        if start.elapsed() >= timeout {
            return false;
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
    true
}
