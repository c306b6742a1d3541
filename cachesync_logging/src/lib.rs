//! Log initialization and setup

pub mod cli;
pub mod config;

pub use config::*;

use std::cmp::min;
use std::io::{self, Write};

use thiserror::Error;
use tracing::Subscriber;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
};

/// Maximum length of a log line.
/// Space for a final trailing newline if truncated.
///
/// Docker "chunks" log message in 16KB chunks and not all log drivers recombine them, so lines
/// are truncated right below 16K and stay terminated with a newline if they were before.
const MAX_LINE_LENGTH: usize = 16 * 1024 - 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid log filter: {0}")]
    InvalidLogFilter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Cannot set global tracing subscriber")]
    SetGlobalDefaultError(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Builder for logging.
#[derive(Debug)]
pub struct Builder {
    log_format: LogFormat,
    log_filter: Option<EnvFilter>,
    // used when log_filter is none.
    default_log_filter: EnvFilter,
    make_writer: BoxMakeWriter,
    with_target: bool,
    with_ansi: bool,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Full,
            log_filter: None,
            default_log_filter: EnvFilter::new(Self::DEFAULT_LOG_FILTER),
            make_writer: make_writer(io::stdout),
            with_target: true,
            with_ansi: true,
        }
    }
}

impl Builder {
    pub const DEFAULT_LOG_FILTER: &'static str = "warn";

    pub fn new() -> Self {
        Self::default()
    }

    /// Set log_filter using a simple numeric "verbosity level".
    ///
    /// 0 means, keep existing `log_filter` value.
    pub fn with_log_verbose_count(self, log_verbose_count: u8) -> Self {
        let log_filter = match log_verbose_count {
            0 => self.log_filter,
            1 => Some(EnvFilter::new("info")),
            2 => Some(EnvFilter::new("debug,object_store=info")),
            _ => Some(EnvFilter::new("trace,object_store=info")),
        };
        Self { log_filter, ..self }
    }

    pub fn with_log_filter(self, log_filter: &Option<String>) -> Result<Self> {
        let log_filter = log_filter
            .as_deref()
            .map(EnvFilter::try_new)
            .transpose()?;
        Ok(Self { log_filter, ..self })
    }

    pub fn with_default_log_filter(self, default_log_filter: impl AsRef<str>) -> Result<Self> {
        let default_log_filter = EnvFilter::try_new(default_log_filter)?;
        Ok(Self {
            default_log_filter,
            ..self
        })
    }

    pub fn with_log_format(self, log_format: LogFormat) -> Self {
        Self { log_format, ..self }
    }

    pub fn with_log_destination(self, log_destination: LogDestination) -> Self {
        let make_writer = match log_destination {
            LogDestination::Stdout => make_writer(io::stdout),
            LogDestination::Stderr => make_writer(io::stderr),
        };
        Self {
            make_writer,
            ..self
        }
    }

    pub fn with_writer(self, make_writer: BoxMakeWriter) -> Self {
        Self {
            make_writer,
            ..self
        }
    }

    /// Sets whether or not an event's target and location are displayed.
    ///
    /// Defaults to true. See [tracing_subscriber::fmt::Layer::with_target]
    pub fn with_target(self, with_target: bool) -> Self {
        Self {
            with_target,
            ..self
        }
    }

    /// Enable/disable ANSI encoding for formatted events (i.e. colors).
    ///
    /// Defaults to true. See [tracing_subscriber::fmt::Layer::with_ansi]
    pub fn with_ansi(self, with_ansi: bool) -> Self {
        Self { with_ansi, ..self }
    }

    pub fn build(self) -> impl Subscriber + Send + Sync {
        let log_writer = self.make_writer;
        let with_target = self.with_target;
        let with_ansi = self.with_ansi;

        let layer = match self.log_format {
            LogFormat::Full => fmt::layer()
                .with_writer(log_writer)
                .with_target(with_target)
                .with_ansi(with_ansi)
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .pretty()
                .with_writer(log_writer)
                .with_target(with_target)
                .with_ansi(with_ansi)
                .boxed(),
            LogFormat::Json => fmt::layer()
                .json()
                .with_writer(log_writer)
                .with_target(with_target)
                .with_ansi(false)
                .boxed(),
        };

        let log_filter = self.log_filter.unwrap_or(self.default_log_filter);
        tracing_subscriber::registry().with(layer.with_filter(log_filter))
    }

    /// Build a tracing subscriber and install it as a global default subscriber for all threads.
    pub fn install_global(self) -> Result<()> {
        tracing::subscriber::set_global_default(self.build())?;
        Ok(())
    }
}

/// Line buffered writer capping every line at [`MAX_LINE_LENGTH`], so concurrent log lines
/// reach the underlying writer in one call each.
fn make_writer<F, W>(f: F) -> BoxMakeWriter
where
    F: Fn() -> W + Send + Sync + 'static,
    W: Write + 'static,
{
    BoxMakeWriter::new(move || {
        io::LineWriter::with_capacity(MAX_LINE_LENGTH, LimitedWriter(MAX_LINE_LENGTH, f()))
    })
}

struct LimitedWriter<W: Write>(usize, W);

impl<W: Write> Write for LimitedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let truncated = &buf[..min(self.0, buf.len())];
        let had_trailing_newline = buf[buf.len() - 1] == b'\n';
        if had_trailing_newline && (truncated[truncated.len() - 1] != b'\n') {
            // slow path; copy buffer and append a newline at the end
            // we still want to perform a single write syscall (if possible).
            let mut tmp = truncated.to_vec();
            tmp.push(b'\n');
            self.1.write_all(&tmp).map(|_| buf.len())
        } else {
            self.1.write_all(truncated).map(|_| buf.len())
        }
        // ^^^ `write_all`:
        // in case of interrupted syscalls we prefer to write a garbled log line.
        // than to just truncate the logs.
    }

    fn flush(&mut self) -> io::Result<()> {
        self.1.flush()
    }
}
