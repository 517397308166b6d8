//! Value codec for write-ahead log entries
//!
//! An entry is keyed by event id; the value is a version byte followed by the
//! postcard encoding of the header snapshot and body.

use bytes::Bytes;
use nucleus_core::{Event, Headers};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Current record format version
pub const RECORD_VERSION: u8 = 1;

#[derive(Serialize)]
struct RecordRef<'a> {
    headers: &'a Headers,
    body: &'a Bytes,
}

/// A decoded log entry value
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WalRecord {
    pub headers: Headers,
    pub body: Bytes,
}

impl WalRecord {
    /// Encode the persisted part of an event
    pub fn encode(event: &Event) -> Result<Vec<u8>, StorageError> {
        let mut out = Vec::with_capacity(256);
        out.push(RECORD_VERSION);
        let record = RecordRef {
            headers: event.headers(),
            body: event.body(),
        };
        postcard::to_extend(&record, out).map_err(|e| StorageError::serialization(e.to_string()))
    }

    /// Decode a stored value
    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        match bytes.split_first() {
            Some((&RECORD_VERSION, rest)) => Ok(postcard::from_bytes(rest)?),
            Some((version, _)) => Err(StorageError::deserialization(format!(
                "unsupported record version {version}"
            ))),
            None => Err(StorageError::deserialization("empty record")),
        }
    }

    /// Rebuild the event stored under `id`
    pub fn into_event(self, id: u64) -> Event {
        Event::from_parts(id, self.headers, self.body)
    }
}
