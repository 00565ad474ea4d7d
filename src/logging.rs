//! Log file setup

use std::fs::File;
use std::io;
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogDestination;

/// Filter directives for the log file, `info` when unset.
pub const LOG_ENV: &str = "PTYBRIDGE_LOG";

/// Install the global subscriber writing to `destination`.
///
/// The file is created or truncated. Records from the `log` facade used
/// by the PTY crate are forwarded too. Returns false when logging is
/// disabled or a subscriber was already installed.
pub fn init(destination: &LogDestination) -> io::Result<bool> {
    let path = match destination {
        LogDestination::Disabled => return Ok(false),
        LogDestination::File(path) => path,
    };
    let file = File::create(path)?;

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_thread_names(true),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(log = %path.display(), "logging started");
    }
    Ok(installed)
}
