//! Configuration for processors

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use nucleus_core::Properties;
use nucleus_storage::WalConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ProcessorError, ProcessorResult};

/// Recognized option names, relative to a processor's prefix
pub mod keys {
    pub const PARALLELISM: &str = "parallelism";
    pub const BUFFER_SIZE: &str = "buffer.size";
    pub const PERSISTENT_DIR: &str = "wal.persistent.dir";
    pub const TRANSIENT_DIR: &str = "wal.transient.dir";
    pub const AUTO_RESET: &str = "wal.auto.reset";
    pub const SHUFFLE_KEY: &str = "shuffle.key";
    pub const SLOW_EVALUATION_MS: &str = "slow.evaluation.ms";
}

/// Configuration for a processor
///
/// Immutable once the processor is started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Number of shard workers
    pub parallelism: usize,
    /// Capacity of each shard's inbound queue
    pub buffer_size: usize,
    /// Write-ahead log configuration
    pub wal: WalConfig,
    /// Header whose value selects the shard; the event id when unset
    pub shuffle_key: Option<String>,
    /// Evaluations slower than this are logged
    pub slow_evaluation_threshold: Option<Duration>,
    /// Opaque options passed through to each shard's rule engine
    pub engine: Properties,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            parallelism: 2,
            buffer_size: 1024,
            wal: WalConfig::default(),
            shuffle_key: None,
            slow_evaluation_threshold: None,
            engine: Properties::new(),
        }
    }
}

impl ProcessorConfig {
    /// Create a configuration with the WAL rooted at `data_dir`
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            wal: WalConfig::with_base_dir(data_dir.into()),
            ..Default::default()
        }
    }

    /// Set the number of shard workers
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Set the per-shard queue capacity
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the WAL configuration
    pub fn with_wal(mut self, wal: WalConfig) -> Self {
        self.wal = wal;
        self
    }

    /// Shard by the value of a header
    pub fn with_shuffle_key(mut self, header: impl Into<String>) -> Self {
        self.shuffle_key = Some(header.into());
        self
    }

    /// Log evaluations slower than `threshold`
    pub fn with_slow_evaluation_threshold(mut self, threshold: Duration) -> Self {
        self.slow_evaluation_threshold = Some(threshold);
        self
    }

    /// Set a pass-through engine option
    pub fn with_engine_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.engine.insert(key.into(), value.into());
        self
    }

    /// Check the configuration can start a processor
    pub fn validate(&self) -> ProcessorResult<()> {
        if self.parallelism == 0 {
            return Err(ProcessorError::config("parallelism must be at least 1"));
        }
        if self.buffer_size == 0 {
            return Err(ProcessorError::config("buffer size must be at least 1"));
        }
        Ok(())
    }

    /// Build a configuration from flat properties
    ///
    /// Options are read as `<prefix>.<key>` (see [`keys`]); anything missing
    /// keeps its default. Every property is also passed through to the
    /// engine unchanged.
    pub fn from_properties(prefix: &str, props: &Properties) -> ProcessorResult<Self> {
        let get = |key: &str| props.get(&format!("{prefix}.{key}"));
        let mut config = Self::default();

        if let Some(value) = get(keys::PARALLELISM) {
            config.parallelism = parse(prefix, keys::PARALLELISM, value)?;
        }
        if let Some(value) = get(keys::BUFFER_SIZE) {
            config.buffer_size = parse(prefix, keys::BUFFER_SIZE, value)?;
        }
        if let Some(value) = get(keys::PERSISTENT_DIR) {
            config.wal.persistent_dir = PathBuf::from(value);
        }
        if let Some(value) = get(keys::TRANSIENT_DIR) {
            config.wal.transient_dir = PathBuf::from(value);
        }
        if let Some(value) = get(keys::AUTO_RESET) {
            config.wal.auto_reset = parse(prefix, keys::AUTO_RESET, value)?;
        }
        if let Some(value) = get(keys::SHUFFLE_KEY) {
            config.shuffle_key = Some(value.clone());
        }
        if let Some(value) = get(keys::SLOW_EVALUATION_MS) {
            let millis: u64 = parse(prefix, keys::SLOW_EVALUATION_MS, value)?;
            config.slow_evaluation_threshold = Some(Duration::from_millis(millis));
        }
        config.engine = props.clone();

        config.validate()?;
        Ok(config)
    }
}

fn parse<T: FromStr>(prefix: &str, key: &str, value: &str) -> ProcessorResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ProcessorError::config(format!("invalid value for {prefix}.{key}: '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ProcessorConfig::default();
        config.validate().unwrap();
        assert!(config.shuffle_key.is_none());
        assert!(!config.wal.auto_reset);
    }

    #[test]
    fn test_from_properties() {
        let props = props(&[
            ("rules.parallelism", "4"),
            ("rules.buffer.size", "64"),
            ("rules.wal.persistent.dir", "/data/wal"),
            ("rules.wal.transient.dir", "/dev/shm/nucleus"),
            ("rules.wal.auto.reset", "true"),
            ("rules.shuffle.key", "host"),
            ("rules.slow.evaluation.ms", "250"),
            ("rstore.type", "file"),
        ]);

        let config = ProcessorConfig::from_properties("rules", &props).unwrap();
        assert_eq!(config.parallelism, 4);
        assert_eq!(config.buffer_size, 64);
        assert_eq!(config.wal.persistent_dir, PathBuf::from("/data/wal"));
        assert_eq!(config.wal.transient_dir, PathBuf::from("/dev/shm/nucleus"));
        assert!(config.wal.auto_reset);
        assert_eq!(config.shuffle_key.as_deref(), Some("host"));
        assert_eq!(
            config.slow_evaluation_threshold,
            Some(Duration::from_millis(250))
        );
        assert_eq!(config.engine.get("rstore.type").map(String::as_str), Some("file"));
    }

    #[test]
    fn test_from_properties_ignores_other_prefixes() {
        let props = props(&[("alerts.parallelism", "9")]);
        let config = ProcessorConfig::from_properties("rules", &props).unwrap();
        assert_eq!(config.parallelism, ProcessorConfig::default().parallelism);
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        let bad_number = props(&[("rules.parallelism", "many")]);
        let err = ProcessorConfig::from_properties("rules", &bad_number).unwrap_err();
        assert!(matches!(err, ProcessorError::Config(_)));
        assert!(err.to_string().contains("rules.parallelism"));

        let zero = props(&[("rules.parallelism", "0")]);
        assert!(ProcessorConfig::from_properties("rules", &zero).is_err());

        let bad_flag = props(&[("rules.wal.auto.reset", "yes")]);
        assert!(ProcessorConfig::from_properties("rules", &bad_flag).is_err());
    }
}
