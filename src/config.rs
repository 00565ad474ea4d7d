//! Launch arguments and bridge configuration

use std::ffi::{OsStr, OsString};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::{DEFAULT_CHUNK_SIZE, DEFAULT_DRAIN_LIMIT, DEFAULT_DRAIN_WINDOW};
use crate::pty::WindowSize;

/// Names a JSON config file.
pub const CONFIG_ENV: &str = "PTYBRIDGE_CONFIG";
pub const DRAIN_MS_ENV: &str = "PTYBRIDGE_DRAIN_MS";
pub const DRAIN_LIMIT_MS_ENV: &str = "PTYBRIDGE_DRAIN_LIMIT_MS";
pub const ROWS_ENV: &str = "PTYBRIDGE_ROWS";
pub const COLS_ENV: &str = "PTYBRIDGE_COLS";
pub const CWD_ENV: &str = "PTYBRIDGE_CWD";
pub const PRESERVE_OUTPUT_ENV: &str = "PTYBRIDGE_PRESERVE_OUTPUT";

/// Log destination argument that turns logging off.
pub const NULL_LOG: &str = "null";

pub const USAGE: &str = "usage: ptybridge <log-file|null> <console-mode 0|1> <input> <output> <error> <command> [args...]\n\
channels: '-' for the launcher's own stream, 'fd:N' for an inherited descriptor, or a path";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("expected at least 6 arguments, got {0}")]
    MissingArguments(usize),

    #[error("console mode must be 0 or 1, got {0:?}")]
    InvalidConsoleFlag(OsString),

    #[error("invalid channel {0:?}")]
    InvalidChannel(OsString),

    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Where a bridged stream comes from or goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSpec {
    /// The launcher's own stdin, stdout or stderr (`-`)
    Inherit,
    /// A descriptor inherited from the controller (`fd:N`)
    Descriptor(RawFd),
    /// A FIFO, device or file opened by path
    Path(PathBuf),
}

impl ChannelSpec {
    pub fn parse(arg: &OsStr) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidChannel(arg.to_os_string());
        if arg.is_empty() {
            return Err(invalid());
        }
        if arg == "-" {
            return Ok(ChannelSpec::Inherit);
        }
        if let Some(number) = arg.to_str().and_then(|s| s.strip_prefix("fd:")) {
            let fd: RawFd = number.parse().map_err(|_| invalid())?;
            if fd < 0 {
                return Err(invalid());
            }
            return Ok(ChannelSpec::Descriptor(fd));
        }
        Ok(ChannelSpec::Path(PathBuf::from(arg)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogDestination {
    Disabled,
    File(PathBuf),
}

impl LogDestination {
    pub fn parse(arg: &OsStr) -> Self {
        if arg == NULL_LOG || arg.is_empty() {
            LogDestination::Disabled
        } else {
            LogDestination::File(PathBuf::from(arg))
        }
    }
}

/// The positional command line of the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArgs {
    pub log: LogDestination,
    pub console_mode: bool,
    pub input: ChannelSpec,
    pub output: ChannelSpec,
    /// Only bridged in console mode
    pub error: ChannelSpec,
    pub command: OsString,
    pub args: Vec<OsString>,
}

impl LaunchArgs {
    /// Parse the arguments that follow the program name.
    pub fn parse<I>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator,
        I::Item: Into<OsString>,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        if args.len() < 6 {
            return Err(ConfigError::MissingArguments(args.len()));
        }
        let mut args = args.into_iter();
        let mut next = || args.next().unwrap_or_default();

        let log = LogDestination::parse(&next());
        let console_mode = match next() {
            flag if flag == "0" => false,
            flag if flag == "1" => true,
            flag => return Err(ConfigError::InvalidConsoleFlag(flag)),
        };
        let input = ChannelSpec::parse(&next())?;
        let output = ChannelSpec::parse(&next())?;
        let error = ChannelSpec::parse(&next())?;
        let command = next();
        if command.is_empty() {
            return Err(ConfigError::Invalid("empty command".into()));
        }

        Ok(LaunchArgs {
            log,
            console_mode,
            input,
            output,
            error,
            command,
            args: args.collect(),
        })
    }
}

/// Tunables of a bridge session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Bytes moved per read
    pub chunk_size: usize,
    /// Quiet period that ends an output direction after the child exits
    pub drain_window_ms: u64,
    /// Longest an output direction is drained before remaining output is
    /// discarded
    pub drain_limit_ms: u64,
    /// Hold the slaves open until the child is reaped
    pub preserve_output: bool,
    /// Initial terminal rows
    pub rows: Option<u16>,
    /// Initial terminal columns
    pub cols: Option<u16>,
    /// Working directory of the child
    pub working_dir: PathBuf,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            drain_window_ms: DEFAULT_DRAIN_WINDOW.as_millis() as u64,
            drain_limit_ms: DEFAULT_DRAIN_LIMIT.as_millis() as u64,
            preserve_output: true,
            rows: None,
            cols: None,
            working_dir: PathBuf::from("."),
        }
    }
}

impl BridgeConfig {
    /// Defaults, then the file named by `PTYBRIDGE_CONFIG`, then the
    /// individual environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => Self::from_file(Path::new(&path))?,
            _ => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides from `lookup`, normally the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(DRAIN_MS_ENV) {
            self.drain_window_ms = parse_env(DRAIN_MS_ENV, &value)?;
        }
        if let Some(value) = lookup(DRAIN_LIMIT_MS_ENV) {
            self.drain_limit_ms = parse_env(DRAIN_LIMIT_MS_ENV, &value)?;
        }
        if let Some(value) = lookup(ROWS_ENV) {
            self.rows = Some(parse_env(ROWS_ENV, &value)?);
        }
        if let Some(value) = lookup(COLS_ENV) {
            self.cols = Some(parse_env(COLS_ENV, &value)?);
        }
        if let Some(value) = lookup(CWD_ENV) {
            self.working_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup(PRESERVE_OUTPUT_ENV) {
            self.preserve_output = match value.trim() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: PRESERVE_OUTPUT_ENV,
                        value,
                    })
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive".into()));
        }
        if self.drain_window_ms == 0 {
            return Err(ConfigError::Invalid("drain_window_ms must be positive".into()));
        }
        if self.drain_limit_ms < self.drain_window_ms {
            return Err(ConfigError::Invalid(
                "drain_limit_ms must not be shorter than drain_window_ms".into(),
            ));
        }
        if self.rows == Some(0) || self.cols == Some(0) {
            return Err(ConfigError::Invalid("terminal size must be positive".into()));
        }
        if self.working_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("working_dir is empty".into()));
        }
        Ok(())
    }

    pub fn drain_window(&self) -> Duration {
        Duration::from_millis(self.drain_window_ms)
    }

    pub fn drain_limit(&self) -> Duration {
        Duration::from_millis(self.drain_limit_ms)
    }

    /// Initial size when rows or columns are configured; the other
    /// dimension falls back to 24x80.
    pub fn window_size(&self) -> Option<WindowSize> {
        if self.rows.is_none() && self.cols.is_none() {
            return None;
        }
        let default = WindowSize::default();
        Some(WindowSize::new(
            self.rows.unwrap_or(default.rows),
            self.cols.unwrap_or(default.cols),
        ))
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
    })
}
