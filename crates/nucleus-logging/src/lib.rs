//! Structured logging for the Nucleus rule pipeline
//!
//! # Features
//!
//! - **JSONL Output**: Structured JSON lines format for log aggregation (default)
//! - **Pretty Console**: Human-readable output for development
//! - **Processor Files**: One daily log file per processor via tracing-appender
//! - **Pipeline Level**: Separate level for the processor and WAL crates
//! - **Shard Context**: Spans that stamp processor and shard on every entry
//!
//! # Quick Start
//!
//! ```ignore
//! use nucleus_logging::{LogConfig, NucleusSubscriberBuilder};
//!
//! // JSONL to console
//! let _guard = NucleusSubscriberBuilder::new().init();
//!
//! // Rule processor logging to its own files, pipeline crates at debug
//! let _guard = NucleusSubscriberBuilder::new()
//!     .with_config(LogConfig::for_processor("/var/log/nucleus", "rules"))
//!     .with_pipeline_level("debug")
//!     .init();
//! ```

pub mod config;
pub mod context;

pub use config::{ConsoleFormat, FileConfig, LogConfig, PIPELINE_TARGETS, RotationStrategy};
pub use context::{processor_span, shard_span};

use std::fs::{self, File};

use thiserror::Error;
use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt};

/// A fully assembled subscriber
pub type BoxedSubscriber = Box<dyn Subscriber + Send + Sync>;

/// Errors raised while installing the subscriber
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Log file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Builder for configuring and initializing the logging subscriber
///
/// By default, console output uses JSONL format. Use `LogConfig::development()`
/// for human-readable pretty output during development.
pub struct NucleusSubscriberBuilder {
    config: LogConfig,
}

impl NucleusSubscriberBuilder {
    /// Create a new subscriber builder with default configuration
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
        }
    }

    /// Use a specific configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default log level
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    /// Set the level for the processor and WAL crates
    pub fn with_pipeline_level(mut self, level: impl Into<String>) -> Self {
        self.config.pipeline_level = Some(level.into());
        self
    }

    /// Choose the console format, or turn the console off
    pub fn with_console(mut self, console: ConsoleFormat) -> Self {
        self.config.console = console;
        self
    }

    /// Configure file output
    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    /// Filter from `RUST_LOG`, or from the configured levels when unset
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.config.directives()))
    }

    /// Assemble the subscriber without installing it
    ///
    /// The returned guard (present when file output is configured) must be
    /// kept alive for buffered file writes to be flushed.
    pub fn build(
        self,
        filter: EnvFilter,
    ) -> Result<(BoxedSubscriber, Option<WorkerGuard>), LogError> {
        let config = self.config;
        let include_spans = config.include_spans;

        let pretty_console = (config.console == ConsoleFormat::Pretty).then(|| {
            tracing_subscriber::fmt::layer()
                .with_ansi(config.ansi)
                .with_target(true)
        });
        let jsonl_console = (config.console == ConsoleFormat::Json).then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(include_spans)
                .flatten_event(true)
        });

        let (file_layer, guard) = match &config.file {
            Some(file_config) => {
                let (writer, guard) = create_file_writer(file_config)?;
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(include_spans)
                    .flatten_event(true)
                    .with_writer(writer);
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        let subscriber: BoxedSubscriber = Box::new(
            Registry::default()
                .with(filter)
                .with(pretty_console)
                .with(jsonl_console)
                .with(file_layer),
        );
        Ok((subscriber, guard))
    }

    /// Try to initialize the subscriber globally
    pub fn try_init(self) -> Result<Option<WorkerGuard>, LogError> {
        let filter = self.env_filter();
        let (subscriber, guard) = self.build(filter)?;
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| LogError::AlreadyInstalled(e.to_string()))?;
        Ok(guard)
    }

    /// Initialize the subscriber globally, reporting failures on stderr
    pub fn init(self) -> Option<WorkerGuard> {
        match self.try_init() {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("Warning: Failed to initialize logging: {}", e);
                None
            }
        }
    }
}

impl Default for NucleusSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Create the file writer; truncates for Never rotation, appends for others
fn create_file_writer(file_config: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LogError> {
    let rotation = match file_config.rotation {
        RotationStrategy::Never => {
            fs::create_dir_all(&file_config.directory)?;
            let file_path = file_config
                .directory
                .join(format!("{}.log", file_config.prefix));
            let file = File::create(&file_path)?;
            return Ok(tracing_appender::non_blocking(file));
        }
        RotationStrategy::Daily => Rotation::DAILY,
    };

    let appender = RollingFileAppender::new(rotation, &file_config.directory, &file_config.prefix);
    Ok(tracing_appender::non_blocking(appender))
}

/// Initialize logging for testing (minimal output)
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_testing() {
    let _ = NucleusSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .try_init();
}
