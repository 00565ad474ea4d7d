//! Child process launch
//!
//! A [`ChildBuilder`] collects the command line and terminal options, a
//! [`LaunchRequest`] holds everything resolved and allocated ahead of fork,
//! and [`ChildProcess`] is the running child with its PTY masters.
//!
//! Everything the child needs after fork is prepared as C strings and
//! pointer arrays beforehand, so the child branch only makes raw syscalls.

use std::ffi::{CStr, CString, OsStr, OsString};
use std::os::fd::{OwnedFd, RawFd};
use std::os::raw::{c_char, c_int};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::{self, ForkResult, Pid, SysconfVar};

use crate::error::{PtyError, Result};
use crate::pty::{self, Pty};
use crate::resolve;
use crate::size::WindowSize;
use crate::wait::{self, ExitStatus};

/// Exit code of a child whose exec failed.
pub const EXIT_EXEC_FAILED: i32 = 127;

/// Exit code of a child that failed before reaching exec.
pub const EXIT_SETUP_FAILED: i32 = 1;

const FALLBACK_OPEN_MAX: c_int = 1024;

/// Polls for a hung-up child on drop, `REAP_INTERVAL` apart, before it
/// is killed.
const REAP_ATTEMPTS: u32 = 10;
const REAP_INTERVAL: Duration = Duration::from_millis(10);

/// Builder for launching a program on a fresh PTY
#[derive(Debug, Clone)]
pub struct ChildBuilder {
    program: OsString,
    args: Vec<OsString>,
    env: Option<Vec<(OsString, OsString)>>,
    cwd: PathBuf,
    size: Option<WindowSize>,
    console_mode: bool,
    separate_stderr: bool,
    preserve_output: bool,
}

impl ChildBuilder {
    /// Launch `program`, a bare name looked up on `PATH` or a path
    /// starting with `/` or `.`. The resolved path becomes argv[0].
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        ChildBuilder {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            env: None,
            cwd: PathBuf::from("."),
            size: None,
            console_mode: false,
            separate_stderr: false,
            preserve_output: true,
        }
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Set an environment variable for the child.
    ///
    /// Until the first call the child inherits the launcher's environment
    /// unchanged; the first call snapshots it and applies the override.
    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, value: V) -> Self {
        let key = key.as_ref().to_os_string();
        let vars = self
            .env
            .get_or_insert_with(|| std::env::vars_os().collect());
        vars.retain(|(k, _)| *k != key);
        vars.push((key, value.as_ref().to_os_string()));
        self
    }

    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cwd = dir.as_ref().to_path_buf();
        self
    }

    /// Apply an initial window size to the terminal before the child starts.
    pub fn size(mut self, size: WindowSize) -> Self {
        self.size = Some(size);
        self
    }

    /// Console mode keeps the child in the launcher's session, in a
    /// process group of its own, with echo disabled and no controlling
    /// terminal. Otherwise the child leads a new session on the PTY.
    pub fn console_mode(mut self, console_mode: bool) -> Self {
        self.console_mode = console_mode;
        self
    }

    /// In console mode, give stderr a terminal of its own.
    pub fn separate_stderr(mut self, separate: bool) -> Self {
        self.separate_stderr = separate;
        self
    }

    /// Hold the slave open until the child is reaped so its final output
    /// stays readable on the master.
    pub fn preserve_output(mut self, preserve: bool) -> Self {
        self.preserve_output = preserve;
        self
    }

    /// Resolve the program and allocate the terminals.
    ///
    /// Resolution happens first: a missing program fails before any PTY
    /// exists.
    pub fn build(self) -> Result<LaunchRequest> {
        let envp = match self.env {
            Some(vars) => vars
                .into_iter()
                .map(|(k, v)| {
                    let mut entry = k.into_vec();
                    entry.push(b'=');
                    entry.extend_from_slice(v.as_bytes());
                    c_string(entry)
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        let resolved = resolve::resolve_in_env(&self.program, &envp)?;
        let path = c_string(resolved.clone().into_os_string().into_vec())?;

        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(path.clone());
        for arg in self.args {
            argv.push(c_string(arg.into_vec())?);
        }

        let primary = Pty::open()?;
        if let Some(size) = self.size {
            primary.set_window_size(size)?;
        }
        let secondary = if self.console_mode && self.separate_stderr {
            Some(Pty::open()?)
        } else {
            None
        };

        Ok(LaunchRequest {
            path,
            resolved,
            argv,
            envp,
            cwd: c_string(self.cwd.into_os_string().into_vec())?,
            primary,
            secondary,
            console_mode: self.console_mode,
            preserve_output: self.preserve_output,
        })
    }

    /// `build` followed by [`LaunchRequest::spawn`].
    pub fn spawn(self) -> Result<ChildProcess> {
        self.build()?.spawn()
    }
}

fn c_string(bytes: Vec<u8>) -> Result<CString> {
    CString::new(bytes).map_err(|e| {
        PtyError::InvalidArgument(format!(
            "interior NUL byte in {:?}",
            String::from_utf8_lossy(&e.into_vec())
        ))
    })
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

fn open_max() -> c_int {
    match unistd::sysconf(SysconfVar::OPEN_MAX) {
        Ok(Some(n)) if n > 0 => n.min(c_int::MAX as libc::c_long) as c_int,
        _ => FALLBACK_OPEN_MAX,
    }
}

/// A fully prepared launch: resolved program, C-string vectors and PTYs.
#[derive(Debug)]
pub struct LaunchRequest {
    resolved: PathBuf,
    path: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    cwd: CString,
    primary: Pty,
    secondary: Option<Pty>,
    console_mode: bool,
    preserve_output: bool,
}

impl LaunchRequest {
    pub fn resolved_path(&self) -> &Path {
        &self.resolved
    }

    pub fn argv(&self) -> &[CString] {
        &self.argv
    }

    pub fn pty(&self) -> &Pty {
        &self.primary
    }

    pub fn error_pty(&self) -> Option<&Pty> {
        self.secondary.as_ref()
    }

    pub fn console_mode(&self) -> bool {
        self.console_mode
    }

    /// Fork and exec the program on the prepared terminals.
    pub fn spawn(self) -> Result<ChildProcess> {
        let mut held_slaves = Vec::new();
        if self.preserve_output {
            held_slaves.push(self.primary.hold_slave()?);
            if let Some(ref secondary) = self.secondary {
                held_slaves.push(secondary.hold_slave()?);
            }
        }

        let argv = null_terminated(&self.argv);
        let envp = null_terminated(&self.envp);
        let limit = open_max();

        // SAFETY: the child branch only makes async-signal-safe calls and
        // never returns
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Child) => unsafe { self.exec_child(&argv, &envp, limit) },
            Ok(ForkResult::Parent { child }) => {
                if self.console_mode {
                    self.primary.disable_echo();
                }
                log::info!(
                    "launched {} as pid {} on {}",
                    self.resolved.display(),
                    child,
                    self.primary.slave_path()
                );
                Ok(ChildProcess {
                    pid: child,
                    primary: self.primary,
                    secondary: self.secondary,
                    held_slaves,
                    status: None,
                })
            }
            Err(e) => Err(PtyError::Fork(e)),
        }
    }

    /// Runs in the forked child. Raw syscalls only.
    unsafe fn exec_child(
        &self,
        argv: &[*const c_char],
        envp: &[*const c_char],
        limit: c_int,
    ) -> ! {
        if libc::chdir(self.cwd.as_ptr()) != 0 {
            setup_failed(c"chdir");
        }

        if !self.console_mode && libc::setsid() == -1 {
            setup_failed(c"setsid");
        }

        let primary = pty::open_slave_raw(self.primary.slave_cpath(), true);
        if primary < 0 {
            setup_failed(c"open pty slave");
        }

        let secondary: Option<RawFd> = match self.secondary {
            Some(ref pty) if self.console_mode => {
                let fd = pty::open_slave_raw(pty.slave_cpath(), false);
                if fd < 0 {
                    setup_failed(c"open error pty slave");
                }
                Some(fd)
            }
            _ => None,
        };

        libc::close(self.primary.master_fd());
        if let Some(ref pty) = self.secondary {
            libc::close(pty.master_fd());
        }

        if self.console_mode {
            pty::disable_echo_raw(primary);
            if libc::setpgid(0, 0) == -1 {
                setup_failed(c"setpgid");
            }
        }

        let stderr_fd = secondary.unwrap_or(primary);
        if libc::dup2(primary, libc::STDIN_FILENO) == -1
            || libc::dup2(primary, libc::STDOUT_FILENO) == -1
            || libc::dup2(stderr_fd, libc::STDERR_FILENO) == -1
        {
            setup_failed(c"dup2");
        }

        if primary > 2 {
            libc::close(primary);
        }
        if let Some(fd) = secondary {
            if fd > 2 {
                libc::close(fd);
            }
        }

        close_descriptors_from(3, limit);

        for sig in [libc::SIGPIPE, libc::SIGINT, libc::SIGQUIT] {
            libc::signal(sig, libc::SIG_DFL);
        }

        if self.envp.is_empty() {
            libc::execv(self.path.as_ptr(), argv.as_ptr());
        } else {
            libc::execve(self.path.as_ptr(), argv.as_ptr(), envp.as_ptr());
        }
        libc::perror(c"execve".as_ptr());
        libc::_exit(EXIT_EXEC_FAILED)
    }
}

unsafe fn setup_failed(step: &CStr) -> ! {
    libc::perror(step.as_ptr());
    libc::_exit(EXIT_SETUP_FAILED)
}

unsafe fn close_descriptors_from(first: c_int, limit: c_int) {
    #[cfg(target_os = "linux")]
    {
        let rc = libc::syscall(
            libc::SYS_close_range,
            first as libc::c_uint,
            libc::c_uint::MAX,
            0 as libc::c_uint,
        );
        if rc == 0 {
            return;
        }
    }
    for fd in first..limit {
        libc::close(fd);
    }
}

/// A launched child and the masters of its terminals
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    primary: Pty,
    secondary: Option<Pty>,
    held_slaves: Vec<OwnedFd>,
    status: Option<ExitStatus>,
}

impl ChildProcess {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Terminal carrying stdin and stdout (and stderr unless separated).
    pub fn pty(&self) -> &Pty {
        &self.primary
    }

    /// Terminal carrying stderr in console mode with separate stderr.
    pub fn error_pty(&self) -> Option<&Pty> {
        self.secondary.as_ref()
    }

    /// Block until the child exits.
    ///
    /// Releases the held slave descriptors afterwards so readers on the
    /// masters see end of stream once the remaining output is consumed.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = wait::wait_for_exit(self.pid)?;
        self.reaped(status);
        Ok(status)
    }

    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let status = wait::try_wait(self.pid)?;
        if let Some(status) = status {
            self.reaped(status);
        }
        Ok(status)
    }

    fn reaped(&mut self, status: ExitStatus) {
        log::info!("child {} exited with {}", self.pid, status);
        self.held_slaves.clear();
        self.status = Some(status);
    }

    /// Change the terminal geometry and notify the child with SIGWINCH.
    pub fn resize(&self, size: WindowSize) -> Result<()> {
        self.primary.set_window_size(size)?;
        self.signal(Signal::SIGWINCH)
    }

    pub fn signal(&self, sig: Signal) -> Result<()> {
        signal::kill(self.pid, sig).map_err(PtyError::Signal)
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.status.is_some() {
            return;
        }
        let _ = self.signal(Signal::SIGHUP);
        for _ in 0..REAP_ATTEMPTS {
            match self.try_wait() {
                Ok(None) => thread::sleep(REAP_INTERVAL),
                Ok(Some(_)) | Err(_) => return,
            }
        }
        log::warn!("child {} ignored SIGHUP, killing it", self.pid);
        if self.signal(Signal::SIGKILL).is_ok() {
            let _ = self.wait();
        }
    }
}
