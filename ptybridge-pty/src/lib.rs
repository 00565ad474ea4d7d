//! ptybridge PTY launching
//!
//! This crate provides the POSIX side of ptybridge:
//! - Allocating PTY master/slave pairs
//! - Resolving and launching a program with a PTY as its terminal
//! - Waiting for the child and normalizing its exit status
//! - Window size management (TIOCGWINSZ/TIOCSWINSZ, SIGWINCH)
//!
//! It logs through the `log` facade and never logs in a forked child.

pub mod child;
pub mod error;
pub mod pty;
pub mod resolve;
pub mod size;
pub mod wait;

pub use child::{ChildBuilder, ChildProcess, LaunchRequest, EXIT_EXEC_FAILED, EXIT_SETUP_FAILED};
pub use error::{ErrorKind, PtyError, Result};
pub use pty::{disable_echo, is_valid_fd, open_slave, Pty};
pub use resolve::{resolve, resolve_in_env};
pub use size::{get_window_size, set_window_size, WindowSize};
pub use wait::{wait_for_exit, ExitStatus, SIGNAL_EXIT_BASE};
