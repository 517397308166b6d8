//! Per-shard event handling contract

use async_trait::async_trait;
use nucleus_core::Event;

use crate::error::ProcessorResult;

/// What a worker does with an event once its handler is done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Fully processed; remove it from the write-ahead log
    Ack,
    /// Keep it in the write-ahead log for replay on restart
    Retain,
}

/// Consumes the events routed to one shard
///
/// A handler is owned by a single worker task and sees that shard's events
/// one at a time in arrival order, so it needs no internal locking. An `Err`
/// leaves the event un-acknowledged; the worker logs it and moves on.
#[async_trait]
pub trait ShardHandler: Send + 'static {
    async fn consume(&mut self, event: &Event) -> ProcessorResult<Disposition>;
}
