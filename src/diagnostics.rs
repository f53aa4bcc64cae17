//! Process wide logging: a console layer whose level can change at runtime, and an
//! optional detailed log file.
//!
//! Build one [`Diagnostics`] at start up and keep it alive until shutdown; dropping it
//! flushes the file writer.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, reload};

use crate::error::{Error, Result};

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Console level: off, error, warn, info, debug or trace.
    pub console_level: String,
    /// Detailed log file, if any.
    pub file: Option<PathBuf>,
    /// Filter directives for the file, e.g. `debug` or `est_link::link=trace`.
    pub file_filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_level: "error".into(),
            file: None,
            file_filter: "debug".into(),
        }
    }
}

pub fn parse_level(level: &str) -> Result<LevelFilter> {
    LevelFilter::from_str(level.trim())
        .map_err(|e| Error::Config(format!("invalid log level '{level}': {e}")))
}

/// Runtime control of the console level.
#[derive(Clone)]
pub struct ConsoleControl {
    handle: reload::Handle<LevelFilter, Registry>,
    level: Arc<Mutex<LevelFilter>>,
}

impl ConsoleControl {
    pub fn level(&self) -> LevelFilter {
        *self.level.lock()
    }

    pub fn set_level(&self, level: LevelFilter) -> Result<()> {
        self.handle
            .reload(level)
            .map_err(|e| Error::Config(format!("could not change the console level: {e}")))?;
        *self.level.lock() = level;
        Ok(())
    }
}

impl core::fmt::Debug for ConsoleControl {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConsoleControl")
            .field("level", &self.level())
            .finish()
    }
}

/// The logging handle of the process.
pub struct Diagnostics {
    console: ConsoleControl,
    _guard: Option<WorkerGuard>,
}

impl Diagnostics {
    /// Build the subscriber without installing it.
    pub fn build(
        config: &LogConfig,
    ) -> Result<(Self, impl tracing::Subscriber + Send + Sync + 'static)> {
        let (console_filter, handle) = reload::Layer::new(parse_level(&config.console_level)?);
        let console_layer = fmt::layer().with_target(false).with_filter(console_filter);

        let mut guard = None;
        let file_layer = match &config.file {
            Some(path) => {
                let filter = EnvFilter::try_new(&config.file_filter).map_err(|e| {
                    Error::Config(format!("invalid file filter '{}': {e}", config.file_filter))
                })?;
                let directory = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("."));
                let file_name = path
                    .file_name()
                    .ok_or_else(|| Error::Config(format!("{} is not a file path", path.display())))?;
                std::fs::create_dir_all(&directory).map_err(|e| {
                    Error::Config(format!("could not create {}: {e}", directory.display()))
                })?;

                let appender = tracing_appender::rolling::never(directory, file_name);
                let (writer, file_guard) = tracing_appender::non_blocking(appender);
                guard = Some(file_guard);
                Some(
                    fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_thread_names(true)
                        .with_filter(filter),
                )
            }
            None => None,
        };

        let subscriber = tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer);

        let level = parse_level(&config.console_level)?;
        let diagnostics = Diagnostics {
            console: ConsoleControl {
                handle,
                level: Arc::new(Mutex::new(level)),
            },
            _guard: guard,
        };
        Ok((diagnostics, subscriber))
    }

    /// Build and install as the global subscriber.
    pub fn init(config: &LogConfig) -> Result<Self> {
        let (diagnostics, subscriber) = Self::build(config)?;
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| Error::Config(format!("logging is already initialised: {e}")))?;
        Ok(diagnostics)
    }

    pub fn console(&self) -> ConsoleControl {
        self.console.clone()
    }

    pub fn set_console_level(&self, level: LevelFilter) -> Result<()> {
        self.console.set_level(level)
    }
}
