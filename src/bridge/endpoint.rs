//! Byte-stream endpoints the bridge workers read from and write to.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::termios::{self, LocalFlags, SpecialCharacterIndices};
use nix::unistd::pipe2;

/// A readable and writable byte stream.
///
/// `read` returning `Ok(0)` means end of stream. After `close` reads
/// return end of stream and writes fail with `BrokenPipe`.
pub trait Endpoint: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn close(&mut self);

    /// Write the whole buffer, retrying short and interrupted writes.
    fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl<E: Endpoint + ?Sized> Endpoint for Box<E> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// An endpoint over an owned descriptor: pipe, socket, file or terminal.
#[derive(Debug)]
pub struct FdEndpoint {
    name: String,
    file: Option<File>,
}

impl FdEndpoint {
    pub fn new(name: impl Into<String>, fd: impl Into<OwnedFd>) -> Self {
        FdEndpoint {
            name: name.into(),
            file: Some(File::from(fd.into())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }
}

impl Endpoint for FdEndpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(file) = self.file.as_mut() else {
            return Ok(0);
        };
        loop {
            match file.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                result => return result,
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            tracing::trace!(endpoint = %self.name, "closed");
        }
    }
}

/// Writes external input to a PTY master.
///
/// Closing it ends the child's input: when the terminal is in canonical
/// mode the EOF character is sent first, twice if a partial line is
/// pending, since the child's side holds other copies of the terminal
/// and never sees the master close.
#[derive(Debug)]
pub struct TerminalInput {
    master: Option<File>,
    at_line_start: bool,
}

impl TerminalInput {
    pub fn new(master: File) -> Self {
        TerminalInput {
            master: Some(master),
            at_line_start: true,
        }
    }

    fn send_eof(&self, master: &mut File) {
        let attrs = match termios::tcgetattr(&*master) {
            Ok(attrs) => attrs,
            Err(e) => {
                tracing::debug!(error = %e, "terminal attributes unavailable, no EOF sent");
                return;
            }
        };
        if !attrs.local_flags.contains(LocalFlags::ICANON) {
            return;
        }
        let eof = attrs.control_chars[SpecialCharacterIndices::VEOF as usize];
        let result = if self.at_line_start {
            master.write_all(&[eof])
        } else {
            master.write_all(&[eof, eof])
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "failed to send EOF to terminal");
        }
    }
}

impl Endpoint for TerminalInput {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let master = self.master.as_mut().ok_or(io::ErrorKind::BrokenPipe)?;
        let n = master.write(buf)?;
        if let Some(&last) = buf[..n].last() {
            self.at_line_start = last == b'\n';
        }
        Ok(n)
    }

    fn close(&mut self) {
        if let Some(mut master) = self.master.take() {
            self.send_eof(&mut master);
        }
    }
}

/// Wakes a [`CancelableReader`] blocked on its terminal.
#[derive(Debug)]
pub struct StopHandle {
    stop_tx: Option<OwnedFd>,
    abort: Arc<AtomicBool>,
}

impl StopHandle {
    /// Ask the reader to stop. Data already pending on the terminal is
    /// still returned first.
    pub fn stop(&mut self) {
        self.stop_tx = None;
    }

    /// Stop the reader at its next poll, discarding pending data.
    pub fn abort(&mut self) {
        self.abort.store(true, Ordering::Release);
        self.stop_tx = None;
    }
}

/// Reads a PTY master while also watching a stop pipe.
///
/// A plain blocking read on a master cannot be interrupted from another
/// thread, so each read first polls both descriptors with no timeout.
/// Terminal data wins over a pending stop, but not over an abort. EIO from the master means every
/// slave descriptor is closed and is reported as end of stream.
#[derive(Debug)]
pub struct CancelableReader {
    master: Option<File>,
    stop_rx: OwnedFd,
    abort: Arc<AtomicBool>,
}

impl CancelableReader {
    pub fn new(master: File) -> io::Result<(Self, StopHandle)> {
        let (stop_rx, stop_tx) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
        let abort = Arc::new(AtomicBool::new(false));
        Ok((
            CancelableReader {
                master: Some(master),
                stop_rx,
                abort: Arc::clone(&abort),
            },
            StopHandle {
                stop_tx: Some(stop_tx),
                abort,
            },
        ))
    }

    fn wait_readable(&self, master: &File) -> io::Result<(bool, bool)> {
        let mut fds = [
            PollFd::new(master.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.stop_rx.as_fd(), PollFlags::POLLIN),
        ];
        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let ready = |fd: &PollFd<'_>| fd.revents().map_or(false, |r| !r.is_empty());
        Ok((ready(&fds[0]), ready(&fds[1])))
    }
}

impl Endpoint for CancelableReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let Some(master) = self.master.as_ref() else {
                return Ok(0);
            };
            let (data, stopped) = self.wait_readable(master)?;

            if stopped && self.abort.load(Ordering::Acquire) {
                self.close();
                return Ok(0);
            }

            if data {
                let master = self.master.as_mut().ok_or(io::ErrorKind::BrokenPipe)?;
                match master.read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                        self.close();
                        return Ok(0);
                    }
                    Err(e) => return Err(e),
                }
            }

            if stopped {
                self.close();
                return Ok(0);
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.master.as_mut() {
            Some(master) => master.write(buf),
            None => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    fn close(&mut self) {
        self.master = None;
    }
}
