//! End-to-end tests: real children on real PTYs, socket pairs as channels.

use std::ffi::OsString;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use ptybridge::bridge::{Endpoint, FdEndpoint};
use ptybridge::config::{BridgeConfig, ChannelSpec, LaunchArgs, LogDestination};
use ptybridge::pty::ExitStatus;
use ptybridge::session::{self, Channels, SessionError};

/// Test-side ends of the channels handed to a session.
struct Harness {
    input: UnixStream,
    output: UnixStream,
    error: Option<UnixStream>,
}

fn channels(with_error: bool) -> (Channels, Harness) {
    let (input, input_theirs) = UnixStream::pair().unwrap();
    let (output, output_theirs) = UnixStream::pair().unwrap();
    let (error, error_theirs) = if with_error {
        let (ours, theirs) = UnixStream::pair().unwrap();
        (Some(ours), Some(theirs))
    } else {
        (None, None)
    };

    let channels = Channels {
        input: Box::new(FdEndpoint::new("input", input_theirs)),
        output: Box::new(FdEndpoint::new("output", output_theirs)),
        error: error_theirs.map(|s| Box::new(FdEndpoint::new("error", s)) as Box<dyn Endpoint>),
    };
    (channels, Harness { input, output, error })
}

fn launch_args(console_mode: bool, command: &str, args: &[&str]) -> LaunchArgs {
    LaunchArgs {
        log: LogDestination::Disabled,
        console_mode,
        input: ChannelSpec::Inherit,
        output: ChannelSpec::Inherit,
        error: ChannelSpec::Inherit,
        command: command.into(),
        args: args.iter().map(OsString::from).collect(),
    }
}

fn sh(console_mode: bool, script: &str) -> LaunchArgs {
    launch_args(console_mode, "/bin/sh", &["-c", script])
}

fn config() -> BridgeConfig {
    BridgeConfig {
        drain_window_ms: 100,
        ..Default::default()
    }
}

fn read_all(stream: &mut UnixStream) -> Vec<u8> {
    let mut data = Vec::new();
    stream.read_to_end(&mut data).unwrap();
    data
}

/// Run a session on its own thread and give up on it after `timeout`.
fn run_within(
    args: LaunchArgs,
    config: BridgeConfig,
    channels: Channels,
    timeout: Duration,
) -> Option<Result<ExitStatus, SessionError>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(session::run(&args, &config, channels));
    });
    rx.recv_timeout(timeout).ok()
}

fn exit_code(script: &str) -> i32 {
    let (channels, _harness) = channels(false);
    session::run(&sh(false, script), &config(), channels)
        .unwrap()
        .code()
}

#[test]
fn test_exit_codes() {
    assert_eq!(exit_code("exit 0"), 0);
    assert_eq!(exit_code("exit 42"), 42);
    assert_eq!(exit_code("kill -TERM $$"), 143);
}

#[test]
fn test_large_output_is_byte_exact() {
    let (channels, mut harness) = channels(false);
    let script = "head -c 5000 /dev/zero | tr '\\000' 'a'";

    let status = session::run(&sh(false, script), &config(), channels).unwrap();

    assert!(status.success());
    let output = read_all(&mut harness.output);
    assert_eq!(output.len(), 5000);
    assert!(output.iter().all(|&b| b == b'a'));
}

#[test]
fn test_output_written_right_before_exit() {
    let (channels, mut harness) = channels(false);

    let status = session::run(&sh(false, "printf last; exit 3"), &config(), channels).unwrap();

    assert_eq!(status.code(), 3);
    assert_eq!(read_all(&mut harness.output), b"last");
}

#[test]
fn test_console_mode_separates_stderr() {
    let (channels, mut harness) = channels(true);

    let status =
        session::run(&sh(true, "printf out; printf err >&2"), &config(), channels).unwrap();

    assert!(status.success());
    assert_eq!(read_all(&mut harness.output), b"out");
    let mut error = harness.error.take().unwrap();
    assert_eq!(read_all(&mut error), b"err");
}

#[test]
fn test_stderr_interleaved_without_console_mode() {
    let (channels, mut harness) = channels(false);

    let status =
        session::run(&sh(false, "printf out; printf err >&2"), &config(), channels).unwrap();

    assert!(status.success());
    assert_eq!(read_all(&mut harness.output), b"outerr");
}

#[test]
fn test_input_reaches_child() {
    let (channels, mut harness) = channels(false);
    harness.input.write_all(b"ping\n").unwrap();

    // console mode keeps the terminal from echoing the line back
    let status = session::run(&launch_args(true, "head", &["-n", "1"]), &config(), channels).unwrap();

    assert!(status.success());
    assert_eq!(read_all(&mut harness.output), b"ping\r\n");
}

#[test]
fn test_working_dir_and_size_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let canonical = dir.path().canonicalize().unwrap();
    let config = BridgeConfig {
        working_dir: dir.path().to_path_buf(),
        rows: Some(40),
        cols: Some(100),
        ..config()
    };
    let script = format!(
        "test \"$(pwd -P)\" = \"{}\" && test \"$(stty size)\" = \"40 100\"",
        canonical.display()
    );

    let (channels, _harness) = channels(false);
    let status = session::run(&sh(false, &script), &config, channels).unwrap();
    assert!(status.success());
}

#[test]
fn test_missing_command() {
    let (channels, mut harness) = channels(false);

    let err = session::run(
        &launch_args(false, "ptybridge-no-such-command", &[]),
        &config(),
        channels,
    )
    .unwrap_err();

    assert!(err.is_not_found());
    // the channels were dropped without anything written
    assert!(read_all(&mut harness.output).is_empty());
}

#[test]
fn test_background_writer_does_not_hold_up_exit() {
    let (channels, mut harness) = channels(false);
    let config = BridgeConfig {
        drain_limit_ms: 500,
        ..config()
    };
    // the background loop outlives the shell and keeps the terminal busy
    let script = "(i=0; while [ $i -lt 100 ]; do printf x; sleep 0.05; i=$((i+1)); done) & exit 4";

    let status = run_within(sh(true, script), config, channels, Duration::from_secs(5))
        .expect("session still running after the child exited")
        .unwrap();

    assert_eq!(status.code(), 4);
    let output = read_all(&mut harness.output);
    assert!(output.iter().all(|&b| b == b'x'));
}

#[test]
fn test_closed_input_ends_child_input() {
    let (channels, harness) = channels(false);
    let Harness { mut input, output: _output, .. } = harness;
    input.write_all(b"abc\n").unwrap();
    drop(input);

    let status = run_within(sh(false, "cat >/dev/null; exit 7"), config(), channels, Duration::from_secs(10))
        .expect("child never saw end of input")
        .unwrap();

    assert_eq!(status.code(), 7);
}
