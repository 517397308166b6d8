//! Deterministic shard assignment
//!
//! The same key maps to the same shard for the lifetime of a deployment,
//! which is what preserves per-key ordering across parallel workers.

use nucleus_core::Event;

/// Deterministic hash used to select a shard for a given key.
pub fn hash_shard_key(key: impl AsRef<[u8]>) -> u64 {
    // 64-bit FNV-1a keeps the hash stable across toolchains and processes.
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    key.as_ref().iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

/// Maps events to one of `shard_count` workers
#[derive(Debug, Clone)]
pub struct ShardRouter {
    shard_count: usize,
    shuffle_key: Option<String>,
}

impl ShardRouter {
    /// Create a router over `shard_count` shards (at least one)
    pub fn new(shard_count: usize, shuffle_key: Option<String>) -> Self {
        Self {
            shard_count: shard_count.max(1),
            shuffle_key,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Shard for an event
    ///
    /// Uses the shuffle-key header when configured and present, the event id
    /// otherwise.
    pub fn shard_for(&self, event: &Event) -> usize {
        let hash = match self
            .shuffle_key
            .as_deref()
            .and_then(|name| event.header(name))
        {
            Some(value) => hash_shard_key(value.key_bytes()),
            None => hash_shard_key(event.id().to_be_bytes()),
        };
        (hash % self.shard_count as u64) as usize
    }
}
