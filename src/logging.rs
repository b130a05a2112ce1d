//! Subscriber initialisation for the proxy binary.
//!
//! Logs go to stderr as JSON (default) or text. `LOG_FILE` additionally writes them to
//! a daily rolling file through a non-blocking writer; the returned guard must be held
//! for as long as logs should be flushed.

use std::path::{Path, PathBuf};

use snafu::{OptionExt, ResultExt, Snafu};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{InitError, RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter,
    filter::ParseError,
    fmt::{self, writer::BoxMakeWriter, writer::MakeWriterExt},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    /// An `EnvFilter` directive such as `info` or `fair_share_proxy=debug`.
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
            file: None,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `LOG_FORMAT` (`json` or `text`), `LOG_LEVEL` falling back to `RUST_LOG`, `LOG_FILE`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let format = match non_empty("LOG_FORMAT")
            .map(|value| value.trim().to_ascii_lowercase())
            .as_deref()
        {
            Some("text" | "pretty" | "plain") => LogFormat::Text,
            _ => LogFormat::Json,
        };

        Self {
            format,
            level: non_empty("LOG_LEVEL")
                .or_else(|| non_empty("RUST_LOG"))
                .unwrap_or_else(|| "info".to_string()),
            file: non_empty("LOG_FILE").map(PathBuf::from),
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LogError {
    #[snafu(display("Invalid log filter '{}': {}", filter, source))]
    InvalidFilter { filter: String, source: ParseError },

    #[snafu(display("Log file path '{}' has no file name", path.display()))]
    InvalidFile { path: PathBuf },

    #[snafu(display("Failed to open log file '{}': {}", path.display(), source))]
    FileOpen { path: PathBuf, source: InitError },

    #[snafu(display("Subscriber already initialized"))]
    AlreadyInitialized,
}

/// Installs the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>, LogError> {
    let filter = EnvFilter::try_new(&config.level).context(InvalidFilterSnafu {
        filter: config.level.clone(),
    })?;

    let (writer, guard) = match &config.file {
        Some(path) => {
            let (file, guard) = tracing_appender::non_blocking(rolling_appender(path)?);
            (BoxMakeWriter::new(std::io::stderr.and(file)), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(writer))
            .try_init(),
        LogFormat::Text => registry.with(fmt::layer().with_writer(writer)).try_init(),
    };
    installed.map_err(|_| LogError::AlreadyInitialized)?;

    Ok(guard)
}

fn rolling_appender(path: &Path) -> Result<RollingFileAppender, LogError> {
    let prefix = path
        .file_name()
        .context(InvalidFileSnafu { path })?
        .to_string_lossy()
        .into_owned();
    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .build(directory)
        .context(FileOpenSnafu { path })
}
