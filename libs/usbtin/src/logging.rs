//! Logging setup for applications embedding the adapter engine
//!
//! The library itself only emits `tracing` events; wire traffic is logged
//! at `debug`, state changes at `info`. Applications call [`init_logging`]
//! once, typically with the `logging` section of their
//! [`DeviceConfig`](crate::config::DeviceConfig).

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::error::{Result, UsbtinError};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `usbtin=debug`
    pub level: String,
    /// Enable console output
    pub console: bool,
    /// Daily rolling log file
    pub file: Option<String>,
    pub format: LogFormat,
    /// Enable ANSI colors in console output
    pub ansi: bool,
    /// Include span open/close events
    pub span_events: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: true,
            file: None,
            format: LogFormat::Compact,
            ansi: true,
            span_events: false,
        }
    }
}

fn env_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| UsbtinError::config(format!("Invalid log level: {e}")))
}

fn format_layer<S, W>(
    format: LogFormat,
    writer: W,
    ansi: bool,
    span_events: bool,
) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let spans = if span_events {
        FmtSpan::FULL
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_span_events(spans);

    match format {
        LogFormat::Json => layer
            .json()
            .with_thread_ids(true)
            .with_thread_names(true)
            .boxed(),
        LogFormat::Pretty => layer
            .pretty()
            .with_thread_ids(true)
            .with_thread_names(true)
            .boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    }
}

/// Install the global subscriber
///
/// Returns a guard that must be kept alive for file logging to work.
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let mut layers = Vec::new();
    let mut guard = None;

    if config.console {
        layers.push(
            format_layer(
                config.format,
                std::io::stdout,
                config.ansi,
                config.span_events,
            )
            .with_filter(env_filter(&config.level)?)
            .boxed(),
        );
    }

    if let Some(file_path) = &config.file {
        let path = Path::new(file_path);
        let directory = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(directory)
            .map_err(|e| UsbtinError::config(format!("Cannot create log directory: {e}")))?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("usbtin.log");
        let appender = tracing_appender::rolling::daily(directory, file_name);
        let (non_blocking, file_guard) = tracing_appender::non_blocking(appender);
        guard = Some(file_guard);

        layers.push(
            format_layer(config.format, non_blocking, false, config.span_events)
                .with_filter(env_filter(&config.level)?)
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| UsbtinError::config(format!("Failed to initialize logging: {e}")))?;

    Ok(guard)
}

/// Initialize logging for tests
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// A builder for constructing log configuration
#[derive(Debug, Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.config.level = level.into();
        self
    }

    pub fn console(mut self, enable: bool) -> Self {
        self.config.console = enable;
        self
    }

    pub fn file(mut self, path: impl Into<String>) -> Self {
        self.config.file = Some(path.into());
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn ansi(mut self, enable: bool) -> Self {
        self.config.ansi = enable;
        self
    }

    pub fn span_events(mut self, enable: bool) -> Self {
        self.config.span_events = enable;
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}
