//! Window size management for PTY

use std::os::fd::{AsRawFd, BorrowedFd};

use nix::errno::Errno;

/// Reported instead of a zero errno when an ioctl fails without setting one.
pub const FALLBACK_ERRNO: Errno = Errno::EIO;

/// Window size in rows, columns, and pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    /// Number of rows (lines)
    pub rows: u16,
    /// Number of columns (characters per line)
    pub cols: u16,
    /// Width in pixels (optional, can be 0)
    pub pixel_width: u16,
    /// Height in pixels (optional, can be 0)
    pub pixel_height: u16,
}

impl WindowSize {
    /// Create a new window size
    pub fn new(rows: u16, cols: u16) -> Self {
        WindowSize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    /// Create a new window size with pixel dimensions
    pub fn with_pixels(rows: u16, cols: u16, pixel_width: u16, pixel_height: u16) -> Self {
        WindowSize {
            rows,
            cols,
            pixel_width,
            pixel_height,
        }
    }

    /// Convert to libc winsize structure
    pub fn to_winsize(&self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.pixel_width,
            ws_ypixel: self.pixel_height,
        }
    }

    /// Create from libc winsize structure
    pub fn from_winsize(ws: libc::winsize) -> Self {
        WindowSize {
            rows: ws.ws_row,
            cols: ws.ws_col,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        WindowSize::new(24, 80)
    }
}

/// Read the geometry of the terminal behind `fd` (TIOCGWINSZ).
pub fn get_window_size(fd: BorrowedFd<'_>) -> Result<WindowSize, Errno> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    // SAFETY: TIOCGWINSZ writes a winsize into the provided struct.
    let result = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ as _, &mut ws) };
    if result == -1 {
        Err(last_errno())
    } else {
        Ok(WindowSize::from_winsize(ws))
    }
}

/// Set the geometry of the terminal behind `fd` (TIOCSWINSZ).
pub fn set_window_size(fd: BorrowedFd<'_>, size: WindowSize) -> Result<(), Errno> {
    let ws = size.to_winsize();
    // SAFETY: TIOCSWINSZ only reads the provided struct.
    let result = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ as _, &ws) };
    if result == -1 {
        Err(last_errno())
    } else {
        Ok(())
    }
}

fn last_errno() -> Errno {
    match Errno::last() {
        Errno::UnknownErrno => FALLBACK_ERRNO,
        errno => errno,
    }
}
