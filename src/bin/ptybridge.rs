//! ptybridge - launch a program on a PTY and relay its streams
//!
//! Usage: ptybridge <log-file|null> <console-mode 0|1> <input> <output> <error> <command> [args...]
//!
//! Exits with the child's exit code (128 + signal when it was killed), or
//! 255 when the child could not be launched.

use std::process::ExitCode;

use ptybridge::config::{self, BridgeConfig, LaunchArgs};
use ptybridge::session::{self, Channels, SessionError, SETUP_FAILURE_EXIT};
use ptybridge::logging;

fn main() -> ExitCode {
    let first = std::env::args_os().nth(1);
    if matches!(first.as_deref().and_then(|a| a.to_str()), Some("-h" | "--help")) {
        print_help();
        return ExitCode::SUCCESS;
    }

    let args = match LaunchArgs::parse(std::env::args_os().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("ptybridge: {}", e);
            eprintln!("{}", config::USAGE);
            return setup_failure();
        },
    };

    if let Err(e) = logging::init(&args.log) {
        eprintln!("ptybridge: {}", SessionError::Log(e));
        return setup_failure();
    }

    match launch(&args) {
        Ok(status) => {
            tracing::info!("exiting with {}", status.code());
            ExitCode::from(status.code() as u8)
        },
        Err(e) => {
            tracing::error!("launch failed: {}", e);
            eprintln!("ptybridge: {}", e);
            setup_failure()
        },
    }
}

fn launch(args: &LaunchArgs) -> Result<ptybridge::pty::ExitStatus, SessionError> {
    let config = BridgeConfig::load()?;
    tracing::debug!(?config, "configuration loaded");
    let channels = Channels::open(args)?;
    session::run(args, &config, channels)
}

fn setup_failure() -> ExitCode {
    ExitCode::from(SETUP_FAILURE_EXIT as u8)
}

fn print_help() {
    println!("ptybridge - run a program on a pseudo-terminal and relay its streams");
    println!();
    println!("{}", config::USAGE);
    println!();
    println!("Environment:");
    println!("  PTYBRIDGE_LOG              Log filter directives (default: info)");
    println!("  PTYBRIDGE_CONFIG           JSON config file");
    println!("  PTYBRIDGE_DRAIN_MS         Output drain window in milliseconds (default: 200)");
    println!("  PTYBRIDGE_ROWS / _COLS     Initial terminal size");
    println!("  PTYBRIDGE_CWD              Working directory of the child");
    println!("  PTYBRIDGE_PRESERVE_OUTPUT  Hold the terminal open until the child is reaped (default: 1)");
}
