//! One launch: open the channels, start the child, bridge, wait, drain.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use std::path::PathBuf;

use thiserror::Error;

use crate::bridge::{Bridge, Endpoint, FdEndpoint, WorkerExit};
use crate::config::{BridgeConfig, ChannelSpec, ConfigError, LaunchArgs};
use crate::pty::{self, ChildBuilder, ErrorKind, ExitStatus, PtyError};

/// Exit code reported when the child could not be launched.
pub const SETUP_FAILURE_EXIT: i32 = -1;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Launch(#[from] PtyError),

    #[error("{role} channel fd:{fd} is not an open descriptor")]
    BadDescriptor { role: Role, fd: RawFd },

    #[error("failed to open {role} channel {path}: {source}")]
    OpenChannel {
        role: Role,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to set up {role} channel: {source}")]
    Channel {
        role: Role,
        #[source]
        source: io::Error,
    },

    #[error("failed to start bridge: {0}")]
    Bridge(#[source] io::Error),

    #[error("failed to open log file: {0}")]
    Log(#[source] io::Error),
}

impl SessionError {
    /// Whether the error came from resolving the command.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SessionError::Launch(e) if e.kind() == ErrorKind::Resolution)
    }
}

/// Which bridged stream a channel serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Input,
    Output,
    Error,
}

impl Role {
    fn inherited_fd(self) -> RawFd {
        match self {
            Role::Input => libc::STDIN_FILENO,
            Role::Output => libc::STDOUT_FILENO,
            Role::Error => libc::STDERR_FILENO,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Role::Input => "input",
            Role::Output => "output",
            Role::Error => "error",
        })
    }
}

/// The external ends of the bridged streams.
pub struct Channels {
    pub input: Box<dyn Endpoint>,
    pub output: Box<dyn Endpoint>,
    /// Gets the child's stderr in console mode; unused otherwise
    pub error: Option<Box<dyn Endpoint>>,
}

impl Channels {
    /// Open the channels named on the command line.
    pub fn open(args: &LaunchArgs) -> Result<Self, SessionError> {
        let input = open_channel(&args.input, Role::Input)?;
        let output = open_channel(&args.output, Role::Output)?;
        let error = if args.console_mode {
            Some(Box::new(open_channel(&args.error, Role::Error)?) as Box<dyn Endpoint>)
        } else {
            None
        };
        Ok(Channels {
            input: Box::new(input),
            output: Box::new(output),
            error,
        })
    }
}

/// Open one channel. Every channel owns its own descriptor, so the same
/// inherited descriptor may back several channels.
pub fn open_channel(spec: &ChannelSpec, role: Role) -> Result<FdEndpoint, SessionError> {
    let fd: OwnedFd = match spec {
        ChannelSpec::Inherit => duplicate(role.inherited_fd(), role)?,
        ChannelSpec::Descriptor(fd) => duplicate(*fd, role)?,
        ChannelSpec::Path(path) => OpenOptions::new()
            .read(role == Role::Input)
            .write(role != Role::Input)
            .open(path)
            .map_err(|source| SessionError::OpenChannel {
                role,
                path: path.clone(),
                source,
            })?
            .into(),
    };
    Ok(FdEndpoint::new(role.to_string(), fd))
}

fn duplicate(fd: RawFd, role: Role) -> Result<OwnedFd, SessionError> {
    if !pty::is_valid_fd(fd) {
        return Err(SessionError::BadDescriptor { role, fd });
    }
    // SAFETY: the descriptor was just checked to be open and is only
    // borrowed long enough to duplicate it
    unsafe { BorrowedFd::borrow_raw(fd) }
        .try_clone_to_owned()
        .map_err(|source| SessionError::Channel { role, source })
}

/// Launch the command of `args`, bridge it to `channels` and return its
/// exit status once it has exited and all output has been delivered.
pub fn run(
    args: &LaunchArgs,
    config: &BridgeConfig,
    channels: Channels,
) -> Result<ExitStatus, SessionError> {
    let Channels {
        input,
        output,
        error,
    } = channels;

    let mut builder = ChildBuilder::new(&args.command)
        .args(&args.args)
        .current_dir(&config.working_dir)
        .console_mode(args.console_mode)
        .separate_stderr(args.console_mode && error.is_some())
        .preserve_output(config.preserve_output);
    if let Some(size) = config.window_size() {
        builder = builder.size(size);
    }

    let mut child = builder.spawn()?;
    tracing::info!(
        pid = child.pid().as_raw(),
        command = ?args.command,
        console_mode = args.console_mode,
        "child started"
    );

    let mut bridge = Bridge::new(config.chunk_size, config.drain_window(), config.drain_limit());
    let clone_master = |terminal: &pty::Pty| terminal.try_clone_master().map_err(SessionError::Bridge);

    bridge
        .attach_input("stdin", input, clone_master(child.pty())?)
        .map_err(SessionError::Bridge)?;
    bridge
        .attach_output("stdout", clone_master(child.pty())?, output)
        .map_err(SessionError::Bridge)?;
    if let (Some(pty), Some(sink)) = (child.error_pty(), error) {
        bridge
            .attach_output("stderr", clone_master(pty)?, sink)
            .map_err(SessionError::Bridge)?;
    }

    let status = child.wait()?;
    tracing::info!(%status, code = status.code(), "child exited");

    for (name, exit) in bridge.shutdown() {
        match exit {
            WorkerExit::Fault(e) => tracing::warn!(channel = %name, error = %e, "output lost"),
            exit => tracing::debug!(channel = %name, ?exit, "channel closed"),
        }
    }

    Ok(status)
}
