//! Configuration for the durable queue

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// File name of the pending-event database inside the persistent directory
pub const DATABASE_FILE: &str = "pending.redb";

/// Directory under the transient directory that holds undecodable entries
pub const QUARANTINE_DIR: &str = "quarantine";

/// How hard a commit works to reach stable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Durability {
    /// Every append and acknowledgment is fsynced before it returns
    #[default]
    Immediate,
    /// Commits are persisted by a later immediate commit or clean shutdown
    Eventual,
}

impl From<Durability> for redb::Durability {
    fn from(value: Durability) -> Self {
        match value {
            Durability::Immediate => redb::Durability::Immediate,
            Durability::Eventual => redb::Durability::Eventual,
        }
    }
}

/// Configuration for a write-ahead log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Directory holding the database file
    pub persistent_dir: PathBuf,
    /// Working directory (quarantined entries)
    pub transient_dir: PathBuf,
    /// Wipe both directories before opening
    pub auto_reset: bool,
    /// Commit durability
    pub durability: Durability,
    /// Database page cache size in bytes
    pub cache_size: usize,
    /// Entries read per transaction during recovery
    pub recovery_batch_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            persistent_dir: PathBuf::from("./data/wal"),
            transient_dir: PathBuf::from("./data/mem"),
            auto_reset: false,
            durability: Durability::Immediate,
            cache_size: 16 * 1024 * 1024, // 16MB
            recovery_batch_size: 1024,
        }
    }
}

impl WalConfig {
    /// Create a configuration rooted at the two directories
    pub fn new(persistent_dir: impl Into<PathBuf>, transient_dir: impl Into<PathBuf>) -> Self {
        Self {
            persistent_dir: persistent_dir.into(),
            transient_dir: transient_dir.into(),
            ..Default::default()
        }
    }

    /// Place both directories under a common base
    pub fn with_base_dir(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self::new(base.join("wal"), base.join("mem"))
    }

    /// Wipe directories on start
    pub fn with_auto_reset(mut self, auto_reset: bool) -> Self {
        self.auto_reset = auto_reset;
        self
    }

    /// Set commit durability
    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    /// Set the recovery batch size (at least 1)
    pub fn with_recovery_batch_size(mut self, size: usize) -> Self {
        self.recovery_batch_size = size.max(1);
        self
    }

    /// Path of the database file
    pub fn database_path(&self) -> PathBuf {
        self.persistent_dir.join(DATABASE_FILE)
    }

    /// Path of the quarantine directory
    pub fn quarantine_dir(&self) -> PathBuf {
        self.transient_dir.join(QUARANTINE_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_dir_layout() {
        let config = WalConfig::with_base_dir("/tmp/nucleus");
        assert_eq!(config.persistent_dir, PathBuf::from("/tmp/nucleus/wal"));
        assert_eq!(config.transient_dir, PathBuf::from("/tmp/nucleus/mem"));
        assert_eq!(
            config.database_path(),
            PathBuf::from("/tmp/nucleus/wal/pending.redb")
        );
        assert!(!config.auto_reset);
    }

    #[test]
    fn test_recovery_batch_size_floor() {
        let config = WalConfig::default().with_recovery_batch_size(0);
        assert_eq!(config.recovery_batch_size, 1);
    }
}
