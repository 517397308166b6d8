//! In-memory durable queue for testing and simulation
//!
//! Keeps encoded records in an ordered map so the recovery path decodes
//! exactly what [`RedbWal`](crate::RedbWal) would. Entries survive
//! `stop`/`start` cycles of the same instance, which lets tests simulate a
//! process restart without touching the disk.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use nucleus_core::Event;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::record::WalRecord;
use crate::{DurableQueue, RecoveryReport, RecoveryTarget};

/// In-memory implementation of [`DurableQueue`]
#[derive(Debug, Default)]
pub struct InMemoryWal {
    entries: Mutex<BTreeMap<u64, Vec<u8>>>,
    open: AtomicBool,
    fail_writes: AtomicBool,
    fail_acks: AtomicBool,
}

impl InMemoryWal {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent appends fail with an I/O error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent acknowledgments fail with an I/O error
    pub fn set_fail_acks(&self, fail: bool) {
        self.fail_acks.store(fail, Ordering::SeqCst);
    }

    /// Identifiers of all pending entries in key order
    pub fn pending_ids(&self) -> Vec<u64> {
        self.entries.lock().keys().copied().collect()
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::NotOpen)
        }
    }

    fn next_entry(&self, after: Option<u64>) -> Option<(u64, Vec<u8>)> {
        let entries = self.entries.lock();
        let next = match after {
            None => entries.iter().next(),
            Some(last) => entries.range(last.checked_add(1)?..).next(),
        };
        next.map(|(id, raw)| (*id, raw.clone()))
    }
}

#[async_trait]
impl DurableQueue for InMemoryWal {
    async fn start(&self, target: &dyn RecoveryTarget) -> Result<RecoveryReport, StorageError> {
        self.open.store(true, Ordering::SeqCst);

        let mut report = RecoveryReport::default();
        let mut cursor = None;
        while let Some((event_id, raw)) = self.next_entry(cursor) {
            cursor = Some(event_id);
            let event = match WalRecord::decode(&raw) {
                Ok(record) => record.into_event(event_id),
                Err(e) => {
                    warn!(event_id, error = %e, "Dropping undecodable in-memory entry");
                    self.entries.lock().remove(&event_id);
                    report.quarantined += 1;
                    continue;
                }
            };
            if let Err(e) = target.process_event_non_waled(event).await {
                warn!(event_id, error = %e, "Unable to redeliver recovered event, halting recovery");
                report.halted = true;
                break;
            }
            report.recovered += 1;
        }

        debug!(recovered = report.recovered, "In-memory WAL started");
        Ok(report)
    }

    fn write_event(&self, event: &Event) -> Result<(), StorageError> {
        self.ensure_open()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::io("simulated append failure"));
        }
        let value = WalRecord::encode(event)?;
        match self.entries.lock().entry(event.id()) {
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
            Entry::Occupied(stored) if *stored.get() == value => {}
            Entry::Occupied(_) => return Err(StorageError::Conflict(event.id())),
        }
        Ok(())
    }

    fn ack_event(&self, event_id: u64) -> Result<(), StorageError> {
        self.ensure_open()?;
        if self.fail_acks.load(Ordering::SeqCst) {
            return Err(StorageError::io("simulated remove failure"));
        }
        self.entries.lock().remove(&event_id);
        Ok(())
    }

    fn earliest_event_id(&self) -> Result<Option<u64>, StorageError> {
        self.ensure_open()?;
        Ok(self.entries.lock().keys().next().copied())
    }

    fn pending_count(&self) -> Result<u64, StorageError> {
        self.ensure_open()?;
        Ok(self.entries.lock().len() as u64)
    }

    fn stop(&self) -> Result<(), StorageError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Ids(Mutex<Vec<u64>>);

    #[async_trait]
    impl RecoveryTarget for Ids {
        async fn process_event_non_waled(&self, event: Event) -> Result<(), StorageError> {
            self.0.lock().push(event.id());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_survives_restart_of_same_instance() {
        let wal = InMemoryWal::new();
        let first = Ids::default();
        wal.start(&first).await.unwrap();
        for id in [2, 1, 3] {
            wal.write_event(&Event::new(id)).unwrap();
        }
        wal.stop().unwrap();
        assert!(matches!(wal.pending_count(), Err(StorageError::NotOpen)));

        let second = Ids::default();
        let report = wal.start(&second).await.unwrap();
        assert_eq!(report.recovered, 3);
        assert_eq!(*second.0.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_simulated_failures() {
        let wal = InMemoryWal::new();
        tokio_test::block_on(wal.start(&Ids::default())).unwrap();

        wal.set_fail_writes(true);
        assert!(matches!(
            wal.write_event(&Event::new(1)),
            Err(StorageError::Io(_))
        ));
        assert!(wal.pending_ids().is_empty());

        wal.set_fail_writes(false);
        wal.write_event(&Event::new(1)).unwrap();
        wal.set_fail_acks(true);
        assert!(wal.ack_event(1).is_err());
        assert_eq!(wal.pending_ids(), vec![1]);
    }

    #[test]
    fn test_append_conflict_keeps_first_entry() {
        let wal = InMemoryWal::new();
        tokio_test::block_on(wal.start(&Ids::default())).unwrap();

        wal.write_event(&Event::new(4).with_header("rule", "a")).unwrap();
        wal.write_event(&Event::new(4).with_header("rule", "a")).unwrap();
        assert!(matches!(
            wal.write_event(&Event::new(4).with_header("rule", "b")),
            Err(StorageError::Conflict(4))
        ));
        assert_eq!(wal.pending_ids(), vec![4]);
    }
}
