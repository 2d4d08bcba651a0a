//! Background-mode plumbing: double-fork daemonization, descriptor
//! closing, the open-file-descriptor ulimit raise, and PID file
//! bookkeeping used by the already-running check.

use std::{fs, io, path::Path};

use nix::{
    sys::resource::{setrlimit, Resource},
    unistd::{fork, setsid, ForkResult},
};
use tracing::{info, warn};

/// M60-class HA systems with a full shelf of JBODs can expose well over a
/// thousand block devices; the default `RLIMIT_NOFILE` of 1024 is not
/// enough headroom to open all of them plus everything else fenced has
/// open, so we raise it before enumeration.
const NOFILE_LIMIT: u64 = 4096;

pub fn raise_nofile_limit() -> nix::Result<()> {
    setrlimit(Resource::RLIMIT_NOFILE, NOFILE_LIMIT, NOFILE_LIMIT)
}

/// Double-fork into the background, detaching from the calling terminal.
/// Returns without returning in either parent: both `sys::exit(0)` before
/// this function's caller sees control again. Only the final,
/// session-leader-orphaned grandchild returns `Ok(())`.
pub fn daemonize() -> nix::Result<()> {
    match unsafe { fork()? } {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid()?;

    match unsafe { fork()? } {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    for fd in 0..3 {
        let _ = nix::unistd::close(fd);
    }

    Ok(())
}

/// Writes our pid to `path`, overwriting any previous contents. Failures
/// are logged, not fatal: a stale or missing pid file only degrades the
/// already-running check, it does not affect fencing itself.
pub fn write_pid_file(path: &Path) {
    let pid = std::process::id();
    if let Err(e) = fs::write(path, pid.to_string()) {
        warn!(error = %e, path = %path.display(), "failed to write pid file");
    } else {
        info!(pid, path = %path.display(), "wrote pid file");
    }
}

/// Checks whether the process recorded in `path` is a live, *different*
/// fenced instance. Any error reading the file or probing the process is
/// treated as "not running" (matching the original's broad
/// `contextlib.suppress(Exception)` behavior around its equivalent RPC
/// call).
pub trait RunningCheck {
    fn already_running(&self) -> bool;
}

pub struct PidFileCheck {
    path: std::path::PathBuf,
}

impl PidFileCheck {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RunningCheck for PidFileCheck {
    fn already_running(&self) -> bool {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return false,
        };
        let pid: i32 = match contents.trim().parse() {
            Ok(pid) => pid,
            Err(_) => return false,
        };
        if pid == std::process::id() as i32 {
            return false;
        }
        Path::new(&format!("/proc/{pid}")).exists()
    }
}

/// Writes the epoch timestamp used by the alerting side to time-correlate
/// an unclean reboot with the fencing daemon that triggered it.
pub fn write_alert_sentinel(path: &Path) -> io::Result<()> {
    use std::io::Write;
    let mut f = fs::File::create(path)?;
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    write!(f, "{}", now.as_secs_f64())?;
    f.flush()?;
    f.sync_all()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn own_pid_is_never_already_running() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("fenced-test-pidfile-{}", std::process::id()));
        write_pid_file(&path);
        let check = PidFileCheck::new(&path);
        assert!(!check.already_running());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_pid_file_is_not_already_running() {
        let check = PidFileCheck::new("/nonexistent/fenced.pid.does.not.exist");
        assert!(!check.already_running());
    }
}
