//! Logging configuration for pipeline processes

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Targets that carry processor, shard and WAL events
pub const PIPELINE_TARGETS: &[&str] = &["nucleus_processor", "nucleus_storage"];

/// How log lines are written to the console
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleFormat {
    /// No console output
    Off,
    /// Human-readable lines
    Pretty,
    /// One JSON object per line
    #[default]
    Json,
}

/// Main logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Level for everything not listed in [`PIPELINE_TARGETS`]
    pub default_level: String,
    /// Level for the pipeline crates; falls back to `default_level`
    pub pipeline_level: Option<String>,
    pub console: ConsoleFormat,
    /// Colors on pretty console output
    pub ansi: bool,
    /// Per-processor log files
    pub file: Option<FileConfig>,
    /// Attach the processor and shard span list to JSON lines
    pub include_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            pipeline_level: None,
            console: ConsoleFormat::Json,
            ansi: false,
            file: None,
            include_spans: true,
        }
    }
}

impl LogConfig {
    /// Pretty console output with verbose pipeline logging
    pub fn development() -> Self {
        Self {
            pipeline_level: Some("debug".to_string()),
            console: ConsoleFormat::Pretty,
            ansi: true,
            ..Default::default()
        }
    }

    /// JSON lines for one processor, written to `dir` only
    pub fn for_processor(dir: impl AsRef<Path>, processor: &str) -> Self {
        Self {
            console: ConsoleFormat::Off,
            file: Some(FileConfig::for_processor(dir, processor)),
            ..Default::default()
        }
    }

    /// Minimal output for tests
    pub fn testing() -> Self {
        Self {
            default_level: "warn".to_string(),
            console: ConsoleFormat::Pretty,
            ..Default::default()
        }
    }

    /// Filter directives, e.g. `warn,nucleus_processor=debug,nucleus_storage=debug`
    pub fn directives(&self) -> String {
        let mut directives = self.default_level.clone();
        if let Some(level) = &self.pipeline_level {
            for target in PIPELINE_TARGETS {
                directives.push_str(&format!(",{target}={level}"));
            }
        }
        directives
    }
}

/// File output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    pub directory: PathBuf,
    /// File name prefix
    pub prefix: String,
    pub rotation: RotationStrategy,
}

impl FileConfig {
    /// Daily files named after a processor, e.g. `nucleus-rules.2024-05-01`
    pub fn for_processor(dir: impl AsRef<Path>, processor: &str) -> Self {
        Self {
            directory: dir.as_ref().to_path_buf(),
            prefix: format!("nucleus-{processor}"),
            rotation: RotationStrategy::Daily,
        }
    }
}

/// File rotation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RotationStrategy {
    #[default]
    Daily,
    /// Single file, truncated on start
    Never,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.console, ConsoleFormat::Json);
        assert!(config.file.is_none());
        assert_eq!(config.directives(), "info");
    }

    #[test]
    fn test_development_raises_pipeline_level_only() {
        let config = LogConfig::development();
        assert_eq!(
            config.directives(),
            "info,nucleus_processor=debug,nucleus_storage=debug"
        );
    }

    #[test]
    fn test_processor_files() {
        let config = LogConfig::for_processor("/var/log/nucleus", "rules");
        assert_eq!(config.console, ConsoleFormat::Off);
        let file = config.file.unwrap();
        assert_eq!(file.directory, PathBuf::from("/var/log/nucleus"));
        assert_eq!(file.prefix, "nucleus-rules");
        assert_eq!(file.rotation, RotationStrategy::Daily);
    }
}
