//! # Nucleus Storage
//!
//! The durable event queue of the Nucleus rule pipeline.
//!
//! Every event a processor accepts is appended to a write-ahead log keyed by
//! its identifier before it is dispatched, and removed again once a shard has
//! finished with it. An entry therefore exists exactly while its event is
//! accepted but not yet acknowledged. On start the log is replayed oldest
//! first into its owner, which re-dispatches without persisting again.
//!
//! ## Features
//!
//! - **DurableQueue trait**: append, acknowledge, earliest-id and recovery
//! - **RedbWal**: ordered, transactional on-disk implementation (redb)
//! - **InMemoryWal**: in-memory implementation for testing/simulation
//!
//! Acknowledgment is a point delete, so acknowledgment order is free to
//! differ from arrival order without any log compaction.

pub mod config;
pub mod error;
pub mod memory;
pub mod record;
pub mod redb_wal;

// Re-exports
pub use config::{Durability, WalConfig};
pub use error::StorageError;
pub use memory::InMemoryWal;
pub use record::WalRecord;
pub use redb_wal::RedbWal;

use async_trait::async_trait;
use nucleus_core::Event;

/// The owner a queue hands recovered events back to
#[async_trait]
pub trait RecoveryTarget: Send + Sync {
    /// Accept a recovered event without persisting it again
    async fn process_event_non_waled(&self, event: Event) -> Result<(), StorageError>;
}

/// Summary of a recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Events redelivered to the owner
    pub recovered: u64,
    /// Entries that could not be decoded and were moved aside
    pub quarantined: u64,
    /// Whether recovery stopped before reaching the end of the log
    pub halted: bool,
}

/// A crash-recoverable queue of unacknowledged events
///
/// Appends and acknowledgments may be called concurrently from every shard;
/// each touches a single key and is atomic on its own.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Open the store and replay every unacknowledged entry into `target`
    ///
    /// Only failing to open the store is an error. Problems while replaying
    /// are logged and reported in the returned [`RecoveryReport`].
    async fn start(&self, target: &dyn RecoveryTarget) -> Result<RecoveryReport, StorageError>;

    /// Durably append an event under its identifier
    ///
    /// Appending an event identical to a pending entry is a no-op. Appending
    /// different contents under a pending identifier fails with
    /// [`StorageError::Conflict`] and leaves the stored entry untouched.
    fn write_event(&self, event: &Event) -> Result<(), StorageError>;

    /// Durably remove an event; unknown ids are a no-op
    fn ack_event(&self, event_id: u64) -> Result<(), StorageError>;

    /// Smallest unacknowledged id, or `None` when the queue is empty
    fn earliest_event_id(&self) -> Result<Option<u64>, StorageError>;

    /// Number of unacknowledged entries
    fn pending_count(&self) -> Result<u64, StorageError>;

    /// Release the store; safe to call repeatedly or after a failed start
    fn stop(&self) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that the queue traits are object-safe
    fn _assert_object_safe(_: &dyn DurableQueue, _: &dyn RecoveryTarget) {}

    #[test]
    fn test_report_default_is_clean() {
        let report = RecoveryReport::default();
        assert_eq!(report.recovered, 0);
        assert_eq!(report.quarantined, 0);
        assert!(!report.halted);
    }
}
