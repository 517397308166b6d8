//! Downstream sink contract

use std::fmt;

use async_trait::async_trait;

use crate::error::SinkError;
use crate::event::Event;

/// Positional role of a downstream sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkKind {
    Alert,
    State,
    Aggregation,
}

impl SinkKind {
    /// All sink kinds in positional order
    pub const ALL: [SinkKind; 3] = [SinkKind::Alert, SinkKind::State, SinkKind::Aggregation];

    /// Position of this sink in an output list
    pub fn index(self) -> usize {
        match self {
            SinkKind::Alert => 0,
            SinkKind::State => 1,
            SinkKind::Aggregation => 2,
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkKind::Alert => write!(f, "alert"),
            SinkKind::State => write!(f, "state"),
            SinkKind::Aggregation => write!(f, "aggregation"),
        }
    }
}

/// A downstream stage that durably accepts events
///
/// `enqueue_durable` must only return `Ok` once the event is safe against a
/// crash of the sink.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Durably enqueue an event
    async fn enqueue_durable(&self, event: Event) -> Result<(), SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_indices() {
        for (position, kind) in SinkKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), position);
        }
    }

    /// Test that the Sink trait is object-safe
    fn _assert_object_safe(_: &dyn Sink) {}
}
