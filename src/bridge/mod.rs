//! Stream bridge between PTY masters and external channels
//!
//! Each output direction (terminal to channel) runs on its own thread and
//! is drained on shutdown: it keeps forwarding until it has been quiet for
//! the drain window, then its reader is stopped and its channel closed.
//! Draining is capped by the drain limit, past which pending output is
//! discarded. The input direction (channel to terminal) is detached and
//! abandoned; when its channel closes the child gets end of input.

mod endpoint;
mod shutdown;
mod worker;

use std::fs::File;
use std::io;
use std::sync::Arc;
use std::time::Duration;

pub use endpoint::{CancelableReader, Endpoint, FdEndpoint, StopHandle, TerminalInput};
pub use shutdown::ShutdownFlag;
pub use worker::{
    pump_input, pump_output, spawn_input, OutputChannel, WorkerExit, DEFAULT_CHUNK_SIZE,
    DEFAULT_DRAIN_LIMIT, DEFAULT_DRAIN_WINDOW,
};

/// The set of workers serving one child.
pub struct Bridge {
    shutdown: Arc<ShutdownFlag>,
    outputs: Vec<OutputChannel>,
    chunk_size: usize,
    drain_window: Duration,
    drain_limit: Duration,
}

impl Bridge {
    pub fn new(chunk_size: usize, drain_window: Duration, drain_limit: Duration) -> Self {
        Bridge {
            shutdown: Arc::new(ShutdownFlag::new()),
            outputs: Vec::new(),
            chunk_size,
            drain_window,
            drain_limit,
        }
    }

    /// Forward everything read from `master` to `sink`.
    pub fn attach_output(
        &mut self,
        name: &str,
        master: File,
        sink: Box<dyn Endpoint>,
    ) -> io::Result<()> {
        let channel = OutputChannel::spawn(name, master, sink, self.chunk_size)?;
        self.outputs.push(channel);
        Ok(())
    }

    /// Forward everything read from `source` into `master`.
    pub fn attach_input(
        &mut self,
        name: &str,
        source: Box<dyn Endpoint>,
        master: File,
    ) -> io::Result<()> {
        spawn_input(name, source, master, Arc::clone(&self.shutdown), self.chunk_size)
    }

    /// Raise the shutdown flag and drain every output direction in turn.
    pub fn shutdown(self) -> Vec<(String, WorkerExit)> {
        if self.shutdown.signal() {
            tracing::debug!(outputs = self.outputs.len(), "bridge shutting down");
        }
        let (window, limit) = (self.drain_window, self.drain_limit);
        self.outputs
            .into_iter()
            .map(|channel| {
                let name = channel.name().to_string();
                (name, channel.drain_and_close(window, limit))
            })
            .collect()
    }
}
