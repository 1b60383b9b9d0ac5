//! Diagnostic output for the brickwire CLI.
//!
//! Everything goes to stderr so that `enumerate --json` and `call --json`
//! stay machine-readable on stdout. `RUST_LOG` takes precedence over the
//! level chosen on the command line, e.g.
//! `RUST_LOG=brickwire_client::correlator=trace brickwire enumerate`.

use clap::ValueEnum;
use thiserror::Error;
use tracing::{Level, Subscriber};
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*, registry::LookupSpan};

/// Crates whose events pass the default filter.
const CRATES: [&str; 3] = ["brickwire_client", "brickwire_protocol", "brickwire"];

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("a tracing subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
}

/// Shape of each log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    /// One JSON object per event
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Prefix lines with a timestamp
    pub timestamps: bool,
    /// Append source file and line
    pub source_location: bool,
    /// Filter directive used instead of `RUST_LOG` and `level`
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Compact,
            timestamps: true,
            source_location: false,
            filter: None,
        }
    }
}

impl LoggingConfig {
    /// Settings for a CLI run. `--debug` lowers the level to DEBUG, drops
    /// timestamps and shows where each event came from.
    #[must_use]
    pub fn for_cli(debug: bool, format: LogFormat) -> Self {
        let base = Self {
            format,
            ..Self::default()
        };
        if debug {
            Self {
                level: Level::DEBUG,
                timestamps: false,
                source_location: true,
                ..base
            }
        } else {
            base
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// `brickwire_client=<level>,...` for every brickwire crate.
    pub fn default_directive(&self) -> String {
        let level = self.level.as_str().to_ascii_lowercase();
        CRATES
            .iter()
            .map(|krate| format!("{krate}={level}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        match self.filter {
            Some(ref directive) => Ok(EnvFilter::try_new(directive)?),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(self.default_directive()))),
        }
    }

    fn layer<S>(&self) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_file(self.source_location)
            .with_line_number(self.source_location);

        match (self.format, self.timestamps) {
            (LogFormat::Json, _) => layer.json().boxed(),
            (LogFormat::Pretty, true) => layer.pretty().boxed(),
            (LogFormat::Pretty, false) => layer.pretty().without_time().boxed(),
            (LogFormat::Compact, true) => layer.compact().boxed(),
            (LogFormat::Compact, false) => layer.compact().without_time().boxed(),
        }
    }
}

/// Installs the global subscriber. Call once, before connecting.
pub fn init_logging(config: LoggingConfig) -> Result<(), LoggingError> {
    let subscriber = tracing_subscriber::registry()
        .with(config.env_filter()?)
        .with(config.layer());
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
