use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

/// Best-effort termination of every process owned by a uid.
pub trait ProcessTerminator: Send + Sync {
    fn kill_all(&self, uid: u32) -> Result<usize, TerminateError>;
}

#[derive(Debug)]
pub enum TerminateError {
    RootRefused,
    Scan(io::Error),
}

impl std::fmt::Display for TerminateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RootRefused => write!(f, "will not kill processes for uid 0"),
            Self::Scan(e) => write!(f, "scan processes: {e}"),
        }
    }
}

impl std::error::Error for TerminateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Scan(e) => Some(e),
            Self::RootRefused => None,
        }
    }
}

const SWEEPS: usize = 2;

#[derive(Debug, Clone)]
pub struct ProcfsTerminator {
    proc_root: PathBuf,
}

impl ProcfsTerminator {
    pub fn new(proc_root: PathBuf) -> Self {
        Self { proc_root }
    }
}

impl ProcessTerminator for ProcfsTerminator {
    /// Sends SIGKILL to each matching pid, scanning twice to catch processes
    /// forked during the first sweep. Returns how many signals were delivered.
    fn kill_all(&self, uid: u32) -> Result<usize, TerminateError> {
        if uid == 0 {
            return Err(TerminateError::RootRefused);
        }

        let mut killed = 0;
        for sweep in 0..SWEEPS {
            let pids = find_user_processes(&self.proc_root, uid).map_err(TerminateError::Scan)?;
            debug!(uid, sweep, found = pids.len(), "scanned processes");
            for pid in pids {
                match send_kill(pid) {
                    Ok(()) => killed += 1,
                    Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {}
                    Err(e) => warn!(uid, pid, error = %e, "failed to kill process"),
                }
            }
        }
        Ok(killed)
    }
}

/// Pids under `proc_root` whose real uid is `uid`. Entries that disappear
/// mid-scan are skipped.
pub fn find_user_processes(proc_root: &Path, uid: u32) -> io::Result<Vec<i32>> {
    let mut pids = Vec::new();
    for entry in fs::read_dir(proc_root)? {
        let Ok(entry) = entry else {
            continue;
        };
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };
        let Ok(status) = fs::read_to_string(entry.path().join("status")) else {
            continue;
        };
        if status_uid(&status) == Some(uid) {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    Ok(pids)
}

/// First (real) uid of the `Uid:` line.
fn status_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
}

#[cfg(unix)]
fn send_kill(pid: i32) -> io::Result<()> {
    if pid <= 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid pid"));
    }
    let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_kill(_pid: i32) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "kill is not supported"))
}
