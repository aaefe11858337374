//! Logging setup over `tracing-subscriber`.
//!
//! Bot runtimes log inside a `bot` span carrying `bot_id`, so one noisy bot
//! can be turned up without touching the others:
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [logging.filters]
//! ibots_transport = "warn"
//!
//! [logging.bots]
//! greeter = "debug"
//! ```
//!
//! `RUST_LOG`, when set, replaces the base level; the configured filters are
//! added on top.
//!
//! ```rust,ignore
//! use ibots_runtime::logging::{LoggingBuilder, SpanEvents};
//!
//! LoggingBuilder::new()
//!     .bot_level("greeter", tracing::Level::DEBUG)
//!     .span_events(SpanEvents::LIFECYCLE)
//!     .init();
//! ```

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::{Level, warn};
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{LogFormat, LogOutput, LogRotation, LoggingConfig, SpanEventConfig};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpanEvents {
    pub new: bool,
    pub enter: bool,
    pub exit: bool,
    pub close: bool,
}

impl SpanEvents {
    pub const NONE: Self = Self {
        new: false,
        enter: false,
        exit: false,
        close: false,
    };

    /// When a bot run or a resource executor starts and ends.
    pub const LIFECYCLE: Self = Self {
        new: true,
        enter: false,
        exit: false,
        close: true,
    };

    pub const FULL: Self = Self {
        new: true,
        enter: true,
        exit: true,
        close: true,
    };

    fn to_fmt_span(self) -> FmtSpan {
        [
            (self.new, FmtSpan::NEW),
            (self.enter, FmtSpan::ENTER),
            (self.exit, FmtSpan::EXIT),
            (self.close, FmtSpan::CLOSE),
        ]
        .into_iter()
        .filter(|(on, _)| *on)
        .fold(FmtSpan::NONE, |acc, (_, flag)| acc | flag)
    }
}

impl From<&SpanEventConfig> for SpanEvents {
    fn from(config: &SpanEventConfig) -> Self {
        Self {
            new: config.new,
            enter: config.enter,
            exit: config.exit,
            close: config.close,
        }
    }
}

/// Installs the global subscriber described by `config`.
///
/// Does nothing if one is already installed.
pub fn init_from_config(config: &LoggingConfig) {
    LoggingBuilder::from_config(config).init();
}

// =============================================================================
// LoggingBuilder
// =============================================================================

#[derive(Debug)]
pub struct LoggingBuilder {
    level: Level,
    directives: Vec<String>,
    span_events: SpanEvents,
    format: LogFormat,
    output: LogOutput,
    file_path: Option<PathBuf>,
    rotation: LogRotation,
    with_target: bool,
    with_thread_ids: bool,
    with_file_location: bool,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            directives: Vec::new(),
            span_events: SpanEvents::NONE,
            format: LogFormat::Compact,
            output: LogOutput::Stdout,
            file_path: None,
            rotation: LogRotation::Never,
            with_target: true,
            with_thread_ids: false,
            with_file_location: false,
        }
    }
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &LoggingConfig) -> Self {
        let mut builder = Self {
            level: config.level.to_tracing_level(),
            span_events: SpanEvents::from(&config.span_events),
            format: config.format,
            output: config.output,
            file_path: config.file_path.clone(),
            rotation: config.rotation,
            with_thread_ids: config.thread_ids,
            with_file_location: config.file_location,
            ..Self::default()
        };

        // Sorted so the filter does not depend on map order
        let mut targets: Vec<_> = config.filters.iter().collect();
        targets.sort_by(|a, b| a.0.cmp(b.0));
        for (target, level) in targets {
            builder = builder.directive(&format!("{target}={}", level.as_str()));
        }

        let mut bots: Vec<_> = config.bots.iter().collect();
        bots.sort_by(|a, b| a.0.cmp(b.0));
        for (bot_id, level) in bots {
            builder = builder.bot_level(bot_id, level.to_tracing_level());
        }

        builder
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Adds an `EnvFilter` directive such as `ibots_runtime=debug`.
    pub fn directive(mut self, directive: &str) -> Self {
        self.directives.push(directive.to_string());
        self
    }

    /// Logs everything inside one bot's span at `level`.
    pub fn bot_level(self, bot_id: &str, level: Level) -> Self {
        let level = level.as_str().to_lowercase();
        self.directive(&format!("[bot{{bot_id={bot_id}}}]={level}"))
    }

    pub fn span_events(mut self, events: SpanEvents) -> Self {
        self.span_events = events;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    /// Logs to `path`, rotated according to `rotation`.
    pub fn file(mut self, path: impl Into<PathBuf>, rotation: LogRotation) -> Self {
        self.output = LogOutput::File;
        self.file_path = Some(path.into());
        self.rotation = rotation;
        self
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    pub fn with_thread_ids(mut self, enabled: bool) -> Self {
        self.with_thread_ids = enabled;
        self
    }

    pub fn with_file_location(mut self, enabled: bool) -> Self {
        self.with_file_location = enabled;
        self
    }

    fn filter(&self) -> EnvFilter {
        let base = self.level.as_str().to_lowercase();
        let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(base));
        for directive in &self.directives {
            match directive.parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => eprintln!("ignoring log filter '{directive}': {e}"),
            }
        }
        filter
    }

    fn appender(&self, path: &Path) -> RollingFileAppender {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let name = path.file_name().unwrap_or_else(|| OsStr::new("ibots.log"));
        match self.rotation {
            LogRotation::Never => rolling::never(dir, name),
            LogRotation::Hourly => rolling::hourly(dir, name),
            LogRotation::Daily => rolling::daily(dir, name),
        }
    }

    fn layer(&self, writer: BoxMakeWriter) -> BoxedLayer {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_span_events(self.span_events.to_fmt_span())
            .with_target(self.with_target)
            .with_thread_ids(self.with_thread_ids)
            .with_file(self.with_file_location)
            .with_line_number(self.with_file_location);

        match self.format {
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Full => layer.boxed(),
            LogFormat::Pretty => layer.pretty().boxed(),
            #[cfg(feature = "json-log")]
            LogFormat::Json => layer.json().boxed(),
        }
    }

    /// Installs the subscriber, ignoring an already installed one.
    pub fn init(self) {
        let _ = self.try_init();
    }

    pub fn try_init(self) -> Result<(), TryInitError> {
        let (writer, missing_path) = match (self.output, &self.file_path) {
            (LogOutput::Stdout, _) => (BoxMakeWriter::new(std::io::stdout), false),
            (LogOutput::Stderr, _) => (BoxMakeWriter::new(std::io::stderr), false),
            (LogOutput::File, Some(path)) => (BoxMakeWriter::new(self.appender(path)), false),
            (LogOutput::File, None) => (BoxMakeWriter::new(std::io::stdout), true),
        };

        tracing_subscriber::registry()
            .with(self.layer(writer))
            .with(self.filter())
            .try_init()?;

        if missing_path {
            warn!("File output requested without logging.file_path, logging to stdout");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_builder_from_config() {
        let mut config = LoggingConfig {
            level: LogLevel::Debug,
            thread_ids: true,
            span_events: SpanEventConfig {
                new: true,
                close: true,
                ..Default::default()
            },
            ..Default::default()
        };
        config.filters.insert("ibots_transport".into(), LogLevel::Trace);
        config.filters.insert("ibots_core".into(), LogLevel::Warn);
        config.bots.insert("greeter".into(), LogLevel::Trace);

        let builder = LoggingBuilder::from_config(&config);
        assert_eq!(builder.level, Level::DEBUG);
        assert_eq!(builder.span_events, SpanEvents::LIFECYCLE);
        assert!(builder.with_thread_ids);
        assert_eq!(
            builder.directives,
            vec![
                "ibots_core=warn".to_string(),
                "ibots_transport=trace".to_string(),
                "[bot{bot_id=greeter}]=trace".to_string(),
            ]
        );
    }

    #[test]
    fn test_directives_parse() {
        let builder = LoggingBuilder::new()
            .directive("ibots_core=debug")
            .bot_level("greeter", Level::TRACE);
        for directive in &builder.directives {
            assert!(
                directive.parse::<tracing_subscriber::filter::Directive>().is_ok(),
                "{directive}"
            );
        }
    }

    #[test]
    fn test_span_event_flags() {
        assert_eq!(SpanEvents::NONE.to_fmt_span(), FmtSpan::NONE);
        assert_eq!(SpanEvents::FULL.to_fmt_span(), FmtSpan::FULL);
        assert_eq!(
            SpanEvents::LIFECYCLE.to_fmt_span(),
            FmtSpan::NEW | FmtSpan::CLOSE
        );
    }
}
