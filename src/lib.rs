//! ptybridge
//!
//! Runs a program on a pseudo-terminal and relays the terminal's streams
//! to and from externally supplied byte-stream channels.
//!
//! - `bridge`: Threaded stream workers with drain-aware shutdown
//! - `config`: Launch arguments and tunables
//! - `logging`: Log file subscriber
//! - `session`: Launch, bridge, wait and drain for one child
//! - `pty`: PTY allocation and process launching (re-exported crate)

pub mod bridge;
pub mod config;
pub mod logging;
pub mod session;

pub use ptybridge_pty as pty;

pub use config::{BridgeConfig, LaunchArgs};
pub use session::{run, Channels, SessionError};
