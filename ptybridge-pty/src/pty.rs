//! PTY (Pseudo-Terminal) allocation.
//!
//! The master side is opened with the POSIX sequence:
//! - posix_openpt() to open the multiplexing device
//! - grantpt() to set permissions on the slave
//! - unlockpt() to unlock the slave
//! - ptsname() to get the slave device path
//!
//! Slave helpers here are also called between fork and exec, so they take
//! preformatted C strings and never allocate.

use std::ffi::{CStr, CString};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Mutex;

use nix::errno::Errno;
use nix::fcntl::{self, FcntlArg, OFlag};
use nix::pty::{grantpt, posix_openpt, ptsname, unlockpt};
use nix::sys::termios::{self, LocalFlags, SetArg};

use crate::error::{PtyError, Result};
use crate::size::{self, WindowSize};

/// Longest slave device path we accept.
pub const MAX_SLAVE_PATH: usize = 100;

// ptsname() returns a pointer into static storage.
static PTSNAME_LOCK: Mutex<()> = Mutex::new(());

/// A pseudo-terminal master together with the path of its slave.
#[derive(Debug)]
pub struct Pty {
    master: OwnedFd,
    slave_path: String,
    slave_cpath: CString,
}

impl Pty {
    /// Allocate a new master/slave pair.
    ///
    /// On any failure the master is closed before the error is returned.
    pub fn open() -> Result<Self> {
        let master =
            posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(PtyError::OpenMaster)?;

        grantpt(&master).map_err(PtyError::GrantPty)?;
        unlockpt(&master).map_err(PtyError::UnlockPty)?;

        let slave_path = {
            let _guard = PTSNAME_LOCK.lock().unwrap_or_else(|e| e.into_inner());
            // SAFETY: the static buffer behind ptsname is only read while the lock is held
            unsafe { ptsname(&master) }.map_err(PtyError::GetSlaveName)?
        };
        if slave_path.len() > MAX_SLAVE_PATH {
            return Err(PtyError::GetSlaveName(Errno::ENAMETOOLONG));
        }
        let slave_cpath =
            CString::new(slave_path.as_str()).map_err(|_| PtyError::GetSlaveName(Errno::EINVAL))?;

        // SAFETY: into_raw_fd releases ownership, which OwnedFd takes over
        let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };

        log::debug!("allocated pty master fd {} slave {}", master.as_raw_fd(), slave_path);

        Ok(Pty {
            master,
            slave_path,
            slave_cpath,
        })
    }

    /// Path of the slave device, e.g. `/dev/pts/3`.
    pub fn slave_path(&self) -> &str {
        &self.slave_path
    }

    pub(crate) fn slave_cpath(&self) -> &CStr {
        &self.slave_cpath
    }

    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Duplicate the master descriptor into an independently owned file.
    pub fn try_clone_master(&self) -> io::Result<File> {
        Ok(File::from(self.master.try_clone()?))
    }

    pub fn set_window_size(&self, size: WindowSize) -> Result<()> {
        size::set_window_size(self.master.as_fd(), size).map_err(PtyError::SetWindowSize)
    }

    pub fn get_window_size(&self) -> Result<WindowSize> {
        size::get_window_size(self.master.as_fd()).map_err(PtyError::GetWindowSize)
    }

    /// Turn off local echo on the master side. Best effort.
    pub fn disable_echo(&self) {
        disable_echo(self.master.as_fd());
    }

    /// Open the slave for read/write, optionally as controlling terminal.
    pub fn open_slave(&self, acquire_controlling_terminal: bool) -> Result<OwnedFd> {
        open_slave(&self.slave_cpath, acquire_controlling_terminal).map_err(|source| {
            PtyError::OpenSlave {
                path: self.slave_path.clone(),
                source,
            }
        })
    }

    /// Open the slave read-only without acquiring it as controlling terminal.
    ///
    /// While this descriptor is open the slave never reports hangup, so
    /// output written by a child right before it exits stays readable on
    /// the master until the descriptor is dropped.
    pub fn hold_slave(&self) -> Result<OwnedFd> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOCTTY)
            .open(&self.slave_path)
            .map_err(|e| PtyError::OpenSlave {
                path: self.slave_path.clone(),
                source: Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)),
            })?;
        Ok(OwnedFd::from(file))
    }
}

impl AsRawFd for Pty {
    fn as_raw_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }
}

impl AsFd for Pty {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }
}

/// Clear the echo-related local flags on a terminal. Failures are ignored.
pub fn disable_echo<Fd: AsFd>(fd: Fd) {
    let fd = fd.as_fd();
    let Ok(mut attrs) = termios::tcgetattr(fd) else {
        return;
    };
    attrs
        .local_flags
        .remove(LocalFlags::ECHO | LocalFlags::ECHOE | LocalFlags::ECHOK | LocalFlags::ECHONL);
    let _ = termios::tcsetattr(fd, SetArg::TCSANOW, &attrs);
}

/// Open a slave device read/write.
///
/// With `acquire_controlling_terminal` the slave is also passed to
/// TIOCSCTTY. That only succeeds for a session leader without a terminal;
/// the failure is expected in console mode and is ignored.
pub fn open_slave(path: &CStr, acquire_controlling_terminal: bool) -> nix::Result<OwnedFd> {
    let fd = open_slave_raw(path, acquire_controlling_terminal);
    if fd < 0 {
        return Err(Errno::last());
    }
    // SAFETY: open just returned this descriptor and nothing else owns it
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Allocation-free `open_slave` for the forked child. Returns -1 with errno set on failure.
pub(crate) fn open_slave_raw(path: &CStr, acquire_controlling_terminal: bool) -> RawFd {
    // SAFETY: path is NUL-terminated and outlives the call
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
    if fd >= 0 && acquire_controlling_terminal {
        // SAFETY: TIOCSCTTY takes an integer argument and touches no memory
        unsafe {
            libc::ioctl(fd, libc::TIOCSCTTY as _, 0);
        }
    }
    fd
}

/// Allocation-free `disable_echo` for the forked child.
pub(crate) fn disable_echo_raw(fd: RawFd) {
    // SAFETY: termios is plain old data and tcgetattr fills it completely
    unsafe {
        let mut attrs: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut attrs) != 0 {
            return;
        }
        attrs.c_lflag &= !(libc::ECHO | libc::ECHOE | libc::ECHOK | libc::ECHONL);
        libc::tcsetattr(fd, libc::TCSANOW, &attrs);
    }
}

/// Whether `fd` refers to an open descriptor of this process.
pub fn is_valid_fd(fd: RawFd) -> bool {
    fd >= 0 && fcntl::fcntl(fd, FcntlArg::F_GETFD).is_ok()
}
