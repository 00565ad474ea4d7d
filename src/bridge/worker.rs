//! Bridge worker loops and their threads.

use std::fs::File;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use super::endpoint::{CancelableReader, Endpoint, StopHandle, TerminalInput};
use super::shutdown::ShutdownFlag;

/// Bytes moved per read.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// How long an output direction must stay quiet before it is closed.
pub const DEFAULT_DRAIN_WINDOW: Duration = Duration::from_millis(200);

/// Longest an output direction is drained before the rest is discarded.
pub const DEFAULT_DRAIN_LIMIT: Duration = Duration::from_secs(2);

/// Why a worker loop ended.
#[derive(Debug)]
pub enum WorkerExit {
    /// The source reached end of stream or was stopped.
    SourceClosed,
    /// The sink refused further writes.
    SinkClosed,
    /// Forwarding stopped on an I/O error.
    Fault(io::Error),
}

impl WorkerExit {
    pub fn is_fault(&self) -> bool {
        matches!(self, WorkerExit::Fault(_))
    }
}

/// Copy terminal output to an external sink.
///
/// Runs until the source reports end of stream. For a [`CancelableReader`]
/// that happens on slave hangup or once it is stopped, so output that is
/// still arriving after shutdown keeps flowing. Every forwarded chunk
/// pulses `activity`.
pub fn pump_output<S, D>(
    source: &mut S,
    sink: &mut D,
    activity: &Sender<()>,
    chunk_size: usize,
) -> WorkerExit
where
    S: Endpoint + ?Sized,
    D: Endpoint + ?Sized,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => return WorkerExit::SourceClosed,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(error = %e, "terminal read failed");
                return WorkerExit::Fault(e);
            }
        };
        if let Err(e) = sink.write_all(&buf[..n]) {
            tracing::warn!(error = %e, "output channel write failed, forwarding stopped");
            return WorkerExit::Fault(e);
        }
        // a full channel already carries a pending pulse
        let _ = activity.try_send(());
    }
}

/// Copy external input to the terminal.
///
/// End of stream or a broken pipe on the external side closes `sink`, as
/// does a raised `shutdown` once the last read returned nothing.
pub fn pump_input<S, D>(
    source: &mut S,
    sink: &mut D,
    shutdown: &ShutdownFlag,
    chunk_size: usize,
) -> WorkerExit
where
    S: Endpoint + ?Sized,
    D: Endpoint + ?Sized,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut last = 0;
    let exit = loop {
        if shutdown.is_set() && last == 0 {
            break WorkerExit::SourceClosed;
        }
        last = match source.read(&mut buf) {
            Ok(0) => break WorkerExit::SourceClosed,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_closed_channel(&e) => break WorkerExit::SourceClosed,
            Err(e) => break WorkerExit::Fault(e),
        };
        if let Err(e) = sink.write_all(&buf[..last]) {
            tracing::debug!(error = %e, "terminal no longer accepts input");
            break WorkerExit::SinkClosed;
        }
    };
    sink.close();
    exit
}

fn is_closed_channel(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof
    )
}

/// A running output worker and what is needed to drain it.
pub struct OutputChannel {
    name: String,
    handle: JoinHandle<(WorkerExit, Box<dyn Endpoint>)>,
    activity: Receiver<()>,
    stop: StopHandle,
}

impl OutputChannel {
    /// Start forwarding `master` to `sink` on a new thread.
    pub fn spawn(
        name: &str,
        master: File,
        sink: Box<dyn Endpoint>,
        chunk_size: usize,
    ) -> io::Result<Self> {
        let (mut reader, stop) = CancelableReader::new(master)?;
        let (activity_tx, activity) = bounded(1);
        let mut sink = sink;
        let handle = thread::Builder::new()
            .name(format!("ptybridge-{}", name))
            .spawn(move || {
                let exit = pump_output(&mut reader, &mut *sink, &activity_tx, chunk_size);
                reader.close();
                (exit, sink)
            })?;

        tracing::debug!(channel = name, "output worker started");
        Ok(OutputChannel {
            name: name.to_string(),
            handle,
            activity,
            stop,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait until no output arrived for `window`, then stop the worker and
    /// close its sink.
    ///
    /// Draining never takes longer than `limit`: output still arriving by
    /// then, say from a background process holding the terminal, is
    /// discarded.
    pub fn drain_and_close(mut self, window: Duration, limit: Duration) -> WorkerExit {
        let deadline = Instant::now() + limit;
        let finished = if self.wait_quiet(window, deadline) {
            self.stop.stop();
            self.wait_finished(deadline)
        } else {
            false
        };
        if !finished {
            tracing::warn!(
                channel = %self.name,
                limit_ms = limit.as_millis() as u64,
                "output still arriving at drain limit, discarding the rest"
            );
            self.stop.abort();
        }

        match self.handle.join() {
            Ok((exit, mut sink)) => {
                sink.close();
                tracing::debug!(channel = %self.name, ?exit, "output drained");
                exit
            }
            Err(_) => WorkerExit::Fault(io::Error::new(
                io::ErrorKind::Other,
                format!("{} worker panicked", self.name),
            )),
        }
    }

    /// Block until the worker has been quiet for `window` or has ended.
    /// Returns false once `deadline` passes first.
    fn wait_quiet(&self, window: Duration, deadline: Instant) -> bool {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let wait = window.min(remaining);
            match self.activity.recv_timeout(wait) {
                Ok(()) => continue,
                Err(RecvTimeoutError::Disconnected) => return true,
                Err(RecvTimeoutError::Timeout) if wait == window => return true,
                Err(RecvTimeoutError::Timeout) => continue,
            }
        }
    }

    /// Block until the worker thread has ended, or `deadline` passes.
    fn wait_finished(&self, deadline: Instant) -> bool {
        loop {
            match self.activity.recv_deadline(deadline) {
                Ok(()) if Instant::now() < deadline => continue,
                Ok(()) | Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => return true,
            }
        }
    }
}

/// Start forwarding `source` into `master` on a detached thread.
///
/// The thread is never joined: it may stay blocked reading `source`
/// after the session is over. When it ends the child is sent end of input
/// through [`TerminalInput`].
pub fn spawn_input(
    name: &str,
    source: Box<dyn Endpoint>,
    master: File,
    shutdown: Arc<ShutdownFlag>,
    chunk_size: usize,
) -> io::Result<()> {
    let mut source = source;
    let mut sink = TerminalInput::new(master);
    thread::Builder::new()
        .name(format!("ptybridge-{}", name))
        .spawn(move || {
            let exit = pump_input(&mut *source, &mut sink, &shutdown, chunk_size);
            tracing::debug!(?exit, "input worker finished");
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    use proptest::prelude::*;
    use ptybridge_pty::Pty;

    use crate::bridge::FdEndpoint;

    /// Serves a buffer in reads of bounded size.
    struct ScriptedSource {
        data: Vec<u8>,
        pos: usize,
        max_read: usize,
    }

    impl Endpoint for ScriptedSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.max_read).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }

        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::Unsupported.into())
        }

        fn close(&mut self) {}
    }

    /// Collects writes, accepting at most `max_write` bytes per call.
    #[derive(Default)]
    struct CollectingSink {
        data: Vec<u8>,
        max_write: usize,
        closed: bool,
    }

    impl Endpoint for CollectingSink {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.closed {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            let n = buf.len().min(self.max_write.max(1));
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]
        #[test]
        fn test_output_preserves_bytes_across_chunks(
            data in prop::collection::vec(any::<u8>(), 0..5000),
            max_read in 1usize..3000,
            max_write in 1usize..700,
            chunk_size in 1usize..2048,
        ) {
            let mut source = ScriptedSource { data: data.clone(), pos: 0, max_read };
            let mut sink = CollectingSink { max_write, ..Default::default() };
            let (tx, _rx) = bounded(1);

            let exit = pump_output(&mut source, &mut sink, &tx, chunk_size);

            prop_assert!(matches!(exit, WorkerExit::SourceClosed));
            prop_assert_eq!(sink.data, data);
        }
    }

    #[test]
    fn test_output_sink_failure_is_fault() {
        let mut source = ScriptedSource { data: vec![7; 10], pos: 0, max_read: 10 };
        let mut sink = CollectingSink { closed: true, ..Default::default() };
        let (tx, _rx) = bounded(1);

        let exit = pump_output(&mut source, &mut sink, &tx, 4);
        assert!(exit.is_fault());
    }

    #[test]
    fn test_output_pulses_activity() {
        let mut source = ScriptedSource { data: vec![1; 10], pos: 0, max_read: 5 };
        let mut sink = CollectingSink { max_write: 16, ..Default::default() };
        let (tx, rx) = bounded(1);

        pump_output(&mut source, &mut sink, &tx, 16);
        assert_eq!(rx.try_recv(), Ok(()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_input_eof_closes_terminal_side() {
        let mut source = ScriptedSource { data: b"ls\n".to_vec(), pos: 0, max_read: 64 };
        let mut sink = CollectingSink { max_write: 64, ..Default::default() };

        let exit = pump_input(&mut source, &mut sink, &ShutdownFlag::new(), 16);
        assert!(matches!(exit, WorkerExit::SourceClosed));
        assert_eq!(sink.data, b"ls\n");
        assert!(sink.closed);
    }

    /// Fails every read with one error kind.
    struct FailingSource(io::ErrorKind);

    impl Endpoint for FailingSource {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(self.0.into())
        }

        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::Unsupported.into())
        }

        fn close(&mut self) {}
    }

    #[test]
    fn test_input_closed_channel_closes_terminal_side() {
        for kind in [
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::UnexpectedEof,
        ] {
            let mut sink = CollectingSink { max_write: 64, ..Default::default() };
            let exit = pump_input(&mut FailingSource(kind), &mut sink, &ShutdownFlag::new(), 16);
            assert!(matches!(exit, WorkerExit::SourceClosed), "{:?}", kind);
            assert!(sink.closed, "{:?}", kind);
        }
    }

    #[test]
    fn test_input_read_error_is_fault() {
        let mut sink = CollectingSink { max_write: 64, ..Default::default() };
        let exit = pump_input(
            &mut FailingSource(io::ErrorKind::PermissionDenied),
            &mut sink,
            &ShutdownFlag::new(),
            16,
        );
        assert!(exit.is_fault());
        assert!(sink.closed);
    }

    #[test]
    fn test_input_ends_on_shutdown_when_idle() {
        let shutdown = ShutdownFlag::new();
        shutdown.signal();
        let mut source = ScriptedSource { data: b"late".to_vec(), pos: 0, max_read: 64 };
        let mut sink = CollectingSink { max_write: 64, ..Default::default() };

        let exit = pump_input(&mut source, &mut sink, &shutdown, 16);
        assert!(matches!(exit, WorkerExit::SourceClosed));
        assert!(sink.data.is_empty());
        assert!(sink.closed);
    }

    #[test]
    fn test_input_stops_when_terminal_gone() {
        let mut source = ScriptedSource { data: b"x".to_vec(), pos: 0, max_read: 64 };
        let mut sink = CollectingSink { closed: true, ..Default::default() };

        let exit = pump_input(&mut source, &mut sink, &ShutdownFlag::new(), 16);
        assert!(matches!(exit, WorkerExit::SinkClosed));
    }

    #[test]
    fn test_drain_delivers_pending_output() {
        let pty = Pty::open().unwrap();
        let mut slave = File::from(pty.open_slave(false).unwrap());
        let (ours, theirs) = UnixStream::pair().unwrap();

        let channel = OutputChannel::spawn(
            "stdout",
            pty.try_clone_master().unwrap(),
            Box::new(FdEndpoint::new("stdout", theirs)),
            DEFAULT_CHUNK_SIZE,
        )
        .unwrap();

        let payload = vec![b'x'; 3000];
        slave.write_all(&payload).unwrap();

        // slave stays open: only the stop ends the worker
        let exit = channel.drain_and_close(Duration::from_millis(100), DEFAULT_DRAIN_LIMIT);
        assert!(!exit.is_fault());

        let mut received = Vec::new();
        let mut ours = ours;
        ours.read_to_end(&mut received).unwrap();
        assert_eq!(received, payload);
    }

    #[test]
    fn test_drain_after_hangup() {
        let pty = Pty::open().unwrap();
        let mut slave = File::from(pty.open_slave(false).unwrap());
        let (mut ours, theirs) = UnixStream::pair().unwrap();

        let channel = OutputChannel::spawn(
            "stdout",
            pty.try_clone_master().unwrap(),
            Box::new(FdEndpoint::new("stdout", theirs)),
            DEFAULT_CHUNK_SIZE,
        )
        .unwrap();

        slave.write_all(b"bye").unwrap();
        drop(slave);

        let mut received = [0u8; 3];
        ours.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"bye");

        let exit = channel.drain_and_close(DEFAULT_DRAIN_WINDOW, DEFAULT_DRAIN_LIMIT);
        assert!(matches!(exit, WorkerExit::SourceClosed));
        let mut rest = Vec::new();
        ours.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_drain_bounded_by_limit() {
        let pty = Pty::open().unwrap();
        let mut slave = File::from(pty.open_slave(false).unwrap());
        let (mut ours, theirs) = UnixStream::pair().unwrap();

        let channel = OutputChannel::spawn(
            "stdout",
            pty.try_clone_master().unwrap(),
            Box::new(FdEndpoint::new("stdout", theirs)),
            DEFAULT_CHUNK_SIZE,
        )
        .unwrap();

        // keeps writing well past the limit, never quiet for a full window
        let writing = Arc::new(ShutdownFlag::new());
        let writer = {
            let writing = Arc::clone(&writing);
            thread::spawn(move || {
                while !writing.is_set() {
                    let _ = slave.write_all(b"x");
                    thread::sleep(Duration::from_millis(10));
                }
            })
        };

        let started = Instant::now();
        let exit = channel.drain_and_close(Duration::from_millis(100), Duration::from_millis(300));
        let elapsed = started.elapsed();
        writing.signal();
        writer.join().unwrap();

        assert!(!exit.is_fault());
        assert!(elapsed >= Duration::from_millis(300), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);
        let mut received = Vec::new();
        ours.read_to_end(&mut received).unwrap();
        assert!(!received.is_empty());
        assert!(received.iter().all(|&b| b == b'x'));
    }

    #[test]
    fn test_input_reaches_terminal() {
        let pty = Pty::open().unwrap();
        let mut slave = File::from(pty.open_slave(false).unwrap());
        ptybridge_pty::disable_echo(&slave);
        let (mut ours, theirs) = UnixStream::pair().unwrap();

        spawn_input(
            "stdin",
            Box::new(FdEndpoint::new("stdin", theirs)),
            pty.try_clone_master().unwrap(),
            Arc::new(ShutdownFlag::new()),
            DEFAULT_CHUNK_SIZE,
        )
        .unwrap();

        ours.write_all(b"hello\n").unwrap();
        let mut buf = [0u8; 16];
        let n = slave.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello\n");
    }
}
