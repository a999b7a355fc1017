//! Single-instance enforcement through a pid file.

use crate::daemon::DaemonError;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug)]
pub enum Acquire {
    Acquired(PidGuard),
    /// Another daemon is alive with this pid
    AlreadyRunning(i32),
}

/// Owns the pid file and the socket file while the daemon runs; both are
/// removed when the guard drops.
#[derive(Debug)]
pub struct PidGuard {
    pid_path: PathBuf,
    socket_path: PathBuf,
}

impl PidGuard {
    pub fn acquire(pid_path: &Path, socket_path: &Path) -> Result<Acquire, DaemonError> {
        if let Some(pid) = read_running_pid(pid_path) {
            info!(pid, "refusing to start: existing daemon alive");
            return Ok(Acquire::AlreadyRunning(pid));
        }

        let pid = std::process::id();
        fs::write(pid_path, format!("{pid}\n")).map_err(|source| DaemonError::PidWrite {
            path: pid_path.to_path_buf(),
            source,
        })?;
        info!(pid, file = %pid_path.display(), "pid file written");

        Ok(Acquire::Acquired(Self {
            pid_path: pid_path.to_path_buf(),
            socket_path: socket_path.to_path_buf(),
        }))
    }
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        for path in [&self.socket_path, &self.pid_path] {
            match fs::remove_file(path) {
                Err(error) if error.kind() != io::ErrorKind::NotFound => {
                    warn!(file = %path.display(), %error, "failed to remove file");
                }
                _ => {}
            }
        }
    }
}

/// The pid recorded in `pid_path`, if that process is still alive.
pub fn read_running_pid(pid_path: &Path) -> Option<i32> {
    let content = fs::read_to_string(pid_path).ok()?;
    let pid = content.trim().parse::<i32>().ok()?;
    is_process_alive(pid).then_some(pid)
}

/// Signal-zero probe. A permission error means the process exists but
/// belongs to someone else, which still counts as alive.
pub fn is_process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    signal_reaches(kill(Pid::from_raw(pid), None))
}

fn signal_reaches(result: nix::Result<()>) -> bool {
    matches!(result, Ok(()) | Err(Errno::EPERM))
}
