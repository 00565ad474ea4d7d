//! Blocking wait for child termination and exit-status normalization.

use std::fmt;

use nix::errno::Errno;
use nix::unistd::Pid;

use crate::error::{PtyError, Result};

/// Added to the signal number for signal-terminated children, as shells do.
pub const SIGNAL_EXIT_BASE: i32 = 128;

/// How a child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal termination with the given exit code
    Exited(i32),
    /// Killed by the given signal number
    Signaled(i32),
    /// A raw wait status that is neither of the above
    Other(i32),
}

impl ExitStatus {
    /// Decode a raw status as filled in by waitpid(2).
    pub fn from_raw(status: i32) -> Self {
        if libc::WIFEXITED(status) {
            ExitStatus::Exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            ExitStatus::Signaled(libc::WTERMSIG(status))
        } else {
            ExitStatus::Other(status)
        }
    }

    /// The portable exit code: the exit code, `128 + signal`, or the raw status.
    pub fn code(&self) -> i32 {
        match *self {
            ExitStatus::Exited(code) => code,
            ExitStatus::Signaled(signal) => SIGNAL_EXIT_BASE + signal,
            ExitStatus::Other(raw) => raw,
        }
    }

    pub fn success(&self) -> bool {
        self.code() == 0
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit code {}", code),
            ExitStatus::Signaled(signal) => write!(f, "signal {}", signal),
            ExitStatus::Other(raw) => write!(f, "wait status {:#x}", raw),
        }
    }
}

/// Block until `pid` terminates.
///
/// Interrupted waits are retried. A child that no longer exists (already
/// reaped elsewhere) counts as a successful exit.
pub fn wait_for_exit(pid: Pid) -> Result<ExitStatus> {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: waitpid only writes the status integer we hand it
        let rc = unsafe { libc::waitpid(pid.as_raw(), &mut status, 0) };
        if rc != -1 {
            return Ok(ExitStatus::from_raw(status));
        }
        match Errno::last() {
            Errno::EINTR => continue,
            Errno::ECHILD => {
                log::debug!("child {} already reaped", pid);
                return Ok(ExitStatus::Exited(0));
            }
            errno => return Err(PtyError::Wait(errno)),
        }
    }
}

/// Reap `pid` if it has already terminated, without blocking.
pub fn try_wait(pid: Pid) -> Result<Option<ExitStatus>> {
    let mut status: libc::c_int = 0;
    // SAFETY: waitpid only writes the status integer we hand it
    let rc = unsafe { libc::waitpid(pid.as_raw(), &mut status, libc::WNOHANG) };
    match rc {
        0 => Ok(None),
        -1 => match Errno::last() {
            Errno::ECHILD => Ok(Some(ExitStatus::Exited(0))),
            errno => Err(PtyError::Wait(errno)),
        },
        _ => Ok(Some(ExitStatus::from_raw(status))),
    }
}
