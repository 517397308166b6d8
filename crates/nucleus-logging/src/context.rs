//! Span helpers that stamp pipeline context onto log entries
//!
//! Shard workers run as async tasks that may hop threads, so context is
//! carried by spans (attached with `tracing::Instrument`) rather than by
//! thread-local state.

use tracing::{Span, info_span};

/// Span for a shard worker of a processor
///
/// Every event logged inside carries `processor` and `shard`. Spans use the
/// processor crate's target so the pipeline level in
/// [`LogConfig`](crate::LogConfig) applies to them.
pub fn shard_span(processor: &str, shard: usize) -> Span {
    info_span!(target: "nucleus_processor", "shard", processor = %processor, shard = shard)
}

/// Span for the lifecycle operations of a processor
pub fn processor_span(processor: &str) -> Span {
    info_span!(target: "nucleus_processor", "processor", processor = %processor)
}
