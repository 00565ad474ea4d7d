//! Error types for PTY operations.

use std::io;
use thiserror::Error;

/// Which stage of a launch an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The executable was not found; no PTY or process was created.
    Resolution,
    /// PTY, descriptor or fork failure; no child is running.
    Setup,
    /// The wait primitive failed for a reason other than EINTR/ECHILD.
    Wait,
}

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Unable to find full path for \"{0}\"")]
    NotFound(String),

    #[error("Failed to open PTY master: {0}")]
    OpenMaster(#[source] nix::Error),

    #[error("Failed to grant PTY access: {0}")]
    GrantPty(#[source] nix::Error),

    #[error("Failed to unlock PTY: {0}")]
    UnlockPty(#[source] nix::Error),

    #[error("Failed to get slave name: {0}")]
    GetSlaveName(#[source] nix::Error),

    #[error("Failed to open slave PTY {path}: {source}")]
    OpenSlave {
        path: String,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to fork process: {0}")]
    Fork(#[source] nix::Error),

    #[error("Failed to set window size: {0}")]
    SetWindowSize(#[source] nix::Error),

    #[error("Failed to get window size: {0}")]
    GetWindowSize(#[source] nix::Error),

    #[error("Failed to wait for child: {0}")]
    Wait(#[source] nix::Error),

    #[error("Failed to signal child: {0}")]
    Signal(#[source] nix::Error),

    #[error("Invalid launch argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PtyError {
    /// Classify the error into the launch stage it came from.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PtyError::NotFound(_) => ErrorKind::Resolution,
            PtyError::Wait(_) => ErrorKind::Wait,
            _ => ErrorKind::Setup,
        }
    }
}

/// Result type for PTY operations
pub type Result<T> = std::result::Result<T, PtyError>;
