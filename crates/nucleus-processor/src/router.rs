//! Positional downstream sinks

use std::fmt;
use std::sync::Arc;

use nucleus_core::{Event, Sink, SinkError, SinkKind};

use crate::error::{ProcessorError, ProcessorResult};

/// The alert, state and aggregation sinks of a processor
///
/// Any of them may be absent; sending to an absent sink fails with
/// [`SinkError::NotConfigured`].
#[derive(Clone, Default)]
pub struct OutputRouter {
    sinks: [Option<Arc<dyn Sink>>; 3],
}

impl OutputRouter {
    /// Router with no sinks
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a positional list: 0 alert, 1 state, 2 aggregation
    ///
    /// Shorter lists leave the trailing sinks unset.
    pub fn from_sinks(sinks: Vec<Arc<dyn Sink>>) -> ProcessorResult<Self> {
        if sinks.len() > SinkKind::ALL.len() {
            return Err(ProcessorError::config(format!(
                "at most {} output sinks are supported, got {}",
                SinkKind::ALL.len(),
                sinks.len()
            )));
        }
        let mut router = Self::new();
        for (slot, sink) in router.sinks.iter_mut().zip(sinks) {
            *slot = Some(sink);
        }
        Ok(router)
    }

    /// Set the sink for one role
    pub fn with_sink(mut self, kind: SinkKind, sink: Arc<dyn Sink>) -> Self {
        self.sinks[kind.index()] = Some(sink);
        self
    }

    pub fn get(&self, kind: SinkKind) -> Option<&Arc<dyn Sink>> {
        self.sinks[kind.index()].as_ref()
    }

    /// Durably enqueue an event on the sink for `kind`
    pub async fn send(&self, kind: SinkKind, event: Event) -> Result<(), SinkError> {
        let sink = self.get(kind).ok_or(SinkError::NotConfigured(kind))?;
        sink.enqueue_durable(event).await
    }
}

impl fmt::Debug for OutputRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for kind in SinkKind::ALL {
            map.entry(&kind, &self.get(kind).map(|sink| sink.name()));
        }
        map.finish()
    }
}
