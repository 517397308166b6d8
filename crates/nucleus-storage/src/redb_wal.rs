//! redb-backed write-ahead log
//!
//! Pending events live in a single ordered table keyed by event id, so the
//! oldest unacknowledged event is always the first key and acknowledgment is
//! a point delete. Each append or acknowledgment is its own write
//! transaction; redb serializes writers, which gives per-key atomicity when
//! every shard writes concurrently.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use nucleus_core::Event;
use parking_lot::RwLock;
use redb::{Builder, Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::{debug, error, info, instrument, warn};

use crate::config::WalConfig;
use crate::error::StorageError;
use crate::record::WalRecord;
use crate::{DurableQueue, RecoveryReport, RecoveryTarget};

// Key: event id, Value: encoded WalRecord
pub(crate) const PENDING_EVENTS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("pending_events");

/// Type alias for a batch of raw entries read during recovery
type RawBatch = Vec<(u64, Vec<u8>)>;

/// Durable queue stored in a redb database
pub struct RedbWal {
    config: WalConfig,
    db: RwLock<Option<Arc<Database>>>,
}

impl RedbWal {
    /// Create a queue; nothing touches the disk until [`DurableQueue::start`]
    pub fn new(config: WalConfig) -> Self {
        Self {
            config,
            db: RwLock::new(None),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Whether the store is currently open
    pub fn is_open(&self) -> bool {
        self.db.read().is_some()
    }

    fn database(&self) -> Result<Arc<Database>, StorageError> {
        self.db.read().clone().ok_or(StorageError::NotOpen)
    }

    /// Open or create the database, wiping first when configured to
    #[instrument(skip(self), fields(path = %self.config.database_path().display()))]
    fn open(&self) -> Result<(), StorageError> {
        if self.config.auto_reset {
            wipe_directory(&self.config.persistent_dir)?;
            wipe_directory(&self.config.transient_dir)?;
            info!(
                persistent = %self.config.persistent_dir.display(),
                transient = %self.config.transient_dir.display(),
                "Cleared WAL directories"
            );
        }

        std::fs::create_dir_all(&self.config.persistent_dir)?;
        std::fs::create_dir_all(&self.config.transient_dir)?;

        let db = Builder::new()
            .set_cache_size(self.config.cache_size)
            .create(self.config.database_path())?;

        // Create the table if it doesn't exist
        let write_txn = db.begin_write()?;
        write_txn.open_table(PENDING_EVENTS)?;
        write_txn.commit()?;

        *self.db.write() = Some(Arc::new(db));
        info!("Opened WAL database");
        Ok(())
    }

    /// Read up to `limit` entries with keys strictly greater than `after`
    fn read_batch(&self, after: Option<u64>, limit: usize) -> Result<RawBatch, StorageError> {
        let Some(start) = after.map_or(Some(0), |last| last.checked_add(1)) else {
            return Ok(Vec::new());
        };

        let db = self.database()?;
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(PENDING_EVENTS)?;

        let mut batch = Vec::with_capacity(limit);
        for entry in table.range(start..)?.take(limit) {
            let (key, value) = entry?;
            batch.push((key.value(), value.value().to_vec()));
        }
        Ok(batch)
    }

    /// Move an undecodable entry out of the live table into the quarantine
    /// directory
    fn quarantine(&self, event_id: u64, raw: &[u8]) -> Result<(), StorageError> {
        let dir = self.config.quarantine_dir();
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(format!("{event_id}.bin")), raw)?;
        self.ack_event(event_id)
    }

    async fn recover(&self, target: &dyn RecoveryTarget) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let mut cursor = None;

        loop {
            let batch = match self.read_batch(cursor, self.config.recovery_batch_size) {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, after = ?cursor, "Unable to read pending events, halting recovery");
                    report.halted = true;
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }

            for (event_id, raw) in batch {
                cursor = Some(event_id);

                let event = match WalRecord::decode(&raw) {
                    Ok(record) => record.into_event(event_id),
                    Err(e) => {
                        warn!(event_id, error = %e, "Failed to decode pending event, quarantining");
                        match self.quarantine(event_id, &raw) {
                            Ok(()) => report.quarantined += 1,
                            Err(qe) => {
                                error!(event_id, error = %qe, "Failed to quarantine event, leaving it in place");
                            }
                        }
                        continue;
                    }
                };

                debug!(event_id, headers = ?event.headers(), "Recovered non-acked event");
                if let Err(e) = target.process_event_non_waled(event).await {
                    error!(event_id, error = %e, "Unable to redeliver recovered event, halting recovery");
                    report.halted = true;
                    return report;
                }
                report.recovered += 1;
            }
        }

        info!(
            recovered = report.recovered,
            quarantined = report.quarantined,
            halted = report.halted,
            "Finished WAL recovery"
        );
        report
    }
}

#[async_trait]
impl DurableQueue for RedbWal {
    async fn start(&self, target: &dyn RecoveryTarget) -> Result<RecoveryReport, StorageError> {
        self.open()?;
        Ok(self.recover(target).await)
    }

    fn write_event(&self, event: &Event) -> Result<(), StorageError> {
        let value = WalRecord::encode(event)?;
        let db = self.database()?;

        let mut write_txn = db.begin_write()?;
        write_txn.set_durability(self.config.durability.into());
        let pending = {
            let mut table = write_txn.open_table(PENDING_EVENTS)?;
            let pending = table
                .get(event.id())?
                .map(|stored| stored.value() == value.as_slice());
            if pending.is_none() {
                table.insert(event.id(), value.as_slice())?;
            }
            pending
        };

        match pending {
            None => write_txn.commit()?,
            Some(true) => {
                write_txn.abort()?;
                debug!(event_id = event.id(), "Event already pending, append skipped");
            }
            Some(false) => {
                write_txn.abort()?;
                warn!(event_id = event.id(), "Refusing to overwrite a different pending event");
                return Err(StorageError::Conflict(event.id()));
            }
        }
        Ok(())
    }

    fn ack_event(&self, event_id: u64) -> Result<(), StorageError> {
        let db = self.database()?;

        let mut write_txn = db.begin_write()?;
        write_txn.set_durability(self.config.durability.into());
        let removed = {
            let mut table = write_txn.open_table(PENDING_EVENTS)?;
            table.remove(event_id)?.is_some()
        };
        write_txn.commit()?;

        if !removed {
            debug!(event_id, "Ack for unknown event ignored");
        }
        Ok(())
    }

    fn earliest_event_id(&self) -> Result<Option<u64>, StorageError> {
        let db = self.database()?;
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(PENDING_EVENTS)?;

        let first = table.first()?.map(|(key, _)| key.value());
        Ok(first)
    }

    fn pending_count(&self) -> Result<u64, StorageError> {
        let db = self.database()?;
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(PENDING_EVENTS)?;
        Ok(table.len()?)
    }

    fn stop(&self) -> Result<(), StorageError> {
        if self.db.write().take().is_some() {
            info!(path = %self.config.database_path().display(), "Closed WAL database");
        }
        Ok(())
    }
}

/// Remove a directory tree if present and recreate it empty
fn wipe_directory(path: &Path) -> Result<(), StorageError> {
    if path.exists() {
        std::fs::remove_dir_all(path)?;
    }
    std::fs::create_dir_all(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nucleus_core::fields;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CollectingTarget {
        events: Mutex<Vec<Event>>,
        fail_on: Option<u64>,
    }

    impl CollectingTarget {
        fn failing_on(event_id: u64) -> Self {
            Self {
                events: Mutex::new(Vec::new()),
                fail_on: Some(event_id),
            }
        }

        fn ids(&self) -> Vec<u64> {
            self.events.lock().iter().map(Event::id).collect()
        }
    }

    #[async_trait]
    impl RecoveryTarget for CollectingTarget {
        async fn process_event_non_waled(&self, event: Event) -> Result<(), StorageError> {
            if self.fail_on == Some(event.id()) {
                return Err(StorageError::delivery("rejected"));
            }
            self.events.lock().push(event);
            Ok(())
        }
    }

    fn config(temp: &TempDir) -> WalConfig {
        WalConfig::with_base_dir(temp.path())
    }

    fn event(id: u64) -> Event {
        Event::new(id)
            .with_header(fields::RULE_GROUP, "payments")
            .with_header("seq", id as i64)
            .with_body(format!("body-{id}").into_bytes())
    }

    async fn started(config: WalConfig) -> (RedbWal, CollectingTarget, RecoveryReport) {
        let wal = RedbWal::new(config);
        let target = CollectingTarget::default();
        let report = wal.start(&target).await.unwrap();
        (wal, target, report)
    }

    #[tokio::test]
    async fn test_write_ack_earliest() {
        let temp = TempDir::new().unwrap();
        let (wal, _, _) = started(config(&temp)).await;

        assert_eq!(wal.earliest_event_id().unwrap(), None);

        for id in [5, 2, 9] {
            wal.write_event(&event(id)).unwrap();
        }
        assert_eq!(wal.earliest_event_id().unwrap(), Some(2));
        assert_eq!(wal.pending_count().unwrap(), 3);

        wal.ack_event(2).unwrap();
        assert_eq!(wal.earliest_event_id().unwrap(), Some(5));

        // Unknown and repeated acks are no-ops
        wal.ack_event(2).unwrap();
        wal.ack_event(1234).unwrap();
        assert_eq!(wal.pending_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_append_never_replaces_pending_entry() {
        let temp = TempDir::new().unwrap();
        let (wal, _, _) = started(config(&temp)).await;

        let first = Event::new(7).with_header(fields::RULE_ID, 1i16);
        let second = Event::new(7).with_header(fields::RULE_ID, 2i16);
        wal.write_event(&first).unwrap();

        // Same contents again is a redelivery, not a new entry
        wal.write_event(&first).unwrap();
        assert!(matches!(
            wal.write_event(&second),
            Err(StorageError::Conflict(7))
        ));
        assert_eq!(wal.pending_count().unwrap(), 1);
        wal.stop().unwrap();

        let (wal, target, _) = started(config(&temp)).await;
        assert_eq!(*target.events.lock(), vec![first]);

        // Once acknowledged the id is free again
        wal.ack_event(7).unwrap();
        wal.write_event(&second).unwrap();
        assert_eq!(wal.pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_restart_redelivers_in_key_order() {
        let temp = TempDir::new().unwrap();
        {
            let (wal, target, report) = started(config(&temp)).await;
            assert_eq!(report.recovered, 0);
            assert!(target.ids().is_empty());
            for id in [3, 1, 2] {
                wal.write_event(&event(id)).unwrap();
            }
            wal.stop().unwrap();
        }

        let (wal, target, report) = started(config(&temp)).await;
        assert_eq!(report.recovered, 3);
        assert_eq!(target.ids(), vec![1, 2, 3]);

        // Identical id, headers and body
        for recovered in target.events.lock().iter() {
            assert_eq!(recovered, &event(recovered.id()));
        }

        assert_eq!(wal.earliest_event_id().unwrap(), Some(1));
        wal.ack_event(1).unwrap();
        assert_eq!(wal.earliest_event_id().unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_replaying_twice_keeps_store_consistent() {
        let temp = TempDir::new().unwrap();
        {
            let (wal, _, _) = started(config(&temp)).await;
            wal.write_event(&event(1)).unwrap();
            wal.write_event(&event(2)).unwrap();
            wal.stop().unwrap();
        }

        // Crash during replay: nothing acked, replay again
        {
            let (wal, target, _) = started(config(&temp)).await;
            assert_eq!(target.ids(), vec![1, 2]);
            wal.stop().unwrap();
        }

        let (wal, target, _) = started(config(&temp)).await;
        assert_eq!(target.ids(), vec![1, 2]);
        wal.ack_event(1).unwrap();
        wal.ack_event(2).unwrap();
        assert_eq!(wal.earliest_event_id().unwrap(), None);
    }

    #[tokio::test]
    async fn test_auto_reset_wipes_pending() {
        let temp = TempDir::new().unwrap();
        {
            let (wal, _, _) = started(config(&temp)).await;
            wal.write_event(&event(1)).unwrap();
            wal.stop().unwrap();
        }

        let (wal, target, report) = started(config(&temp).with_auto_reset(true)).await;
        assert_eq!(report.recovered, 0);
        assert!(target.ids().is_empty());
        assert_eq!(wal.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_operations_require_open_store() {
        let temp = TempDir::new().unwrap();
        let wal = RedbWal::new(config(&temp));

        assert!(matches!(
            wal.write_event(&event(1)),
            Err(StorageError::NotOpen)
        ));
        assert!(matches!(wal.ack_event(1), Err(StorageError::NotOpen)));
        assert!(matches!(
            wal.earliest_event_id(),
            Err(StorageError::NotOpen)
        ));

        // Stopping a never-started queue is fine, and so is stopping twice
        wal.stop().unwrap();
        let target = CollectingTarget::default();
        wal.start(&target).await.unwrap();
        wal.stop().unwrap();
        wal.stop().unwrap();
        assert!(!wal.is_open());
    }

    #[tokio::test]
    async fn test_start_fails_when_directory_unusable() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let wal = RedbWal::new(WalConfig::new(blocker.join("wal"), temp.path().join("mem")));
        let target = CollectingTarget::default();
        assert!(wal.start(&target).await.is_err());
        assert!(!wal.is_open());
        wal.stop().unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_quarantined() {
        let temp = TempDir::new().unwrap();
        let cfg = config(&temp);
        {
            let (wal, _, _) = started(cfg.clone()).await;
            wal.write_event(&event(1)).unwrap();
            wal.write_event(&event(3)).unwrap();
            wal.stop().unwrap();
        }
        {
            let db = Database::create(cfg.database_path()).unwrap();
            let write_txn = db.begin_write().unwrap();
            {
                let mut table = write_txn.open_table(PENDING_EVENTS).unwrap();
                table.insert(2u64, [0xffu8, 0x01, 0x02].as_slice()).unwrap();
            }
            write_txn.commit().unwrap();
        }

        let (wal, target, report) = started(cfg.clone()).await;
        assert_eq!(target.ids(), vec![1, 3]);
        assert_eq!(report.quarantined, 1);
        assert!(!report.halted);
        assert_eq!(wal.pending_count().unwrap(), 2);

        let quarantined = std::fs::read(cfg.quarantine_dir().join("2.bin")).unwrap();
        assert_eq!(quarantined, vec![0xff, 0x01, 0x02]);
    }

    #[tokio::test]
    async fn test_delivery_failure_halts_without_touching_store() {
        let temp = TempDir::new().unwrap();
        {
            let (wal, _, _) = started(config(&temp)).await;
            for id in 1..=3 {
                wal.write_event(&event(id)).unwrap();
            }
            wal.stop().unwrap();
        }

        let wal = RedbWal::new(config(&temp));
        let target = CollectingTarget::failing_on(2);
        let report = wal.start(&target).await.unwrap();

        assert!(report.halted);
        assert_eq!(report.recovered, 1);
        assert_eq!(target.ids(), vec![1]);
        assert_eq!(wal.pending_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_recovery_spans_batches() {
        let temp = TempDir::new().unwrap();
        let cfg = config(&temp).with_recovery_batch_size(2);
        {
            let (wal, _, _) = started(cfg.clone()).await;
            for id in (1..=7).rev() {
                wal.write_event(&event(id)).unwrap();
            }
            wal.stop().unwrap();
        }

        let (_, target, report) = started(cfg).await;
        assert_eq!(report.recovered, 7);
        assert_eq!(target.ids(), (1..=7).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_overwrite_keeps_single_entry() {
        let temp = TempDir::new().unwrap();
        let (wal, _, _) = started(config(&temp)).await;

        wal.write_event(&event(4)).unwrap();
        wal.write_event(&event(4).with_header("retry", true)).unwrap();
        assert_eq!(wal.pending_count().unwrap(), 1);
    }
}
