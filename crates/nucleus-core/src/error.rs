//! Error types for Nucleus core contracts

use thiserror::Error;

use crate::sink::SinkKind;

/// Errors raised while interpreting an event
#[derive(Debug, Error)]
pub enum EventError {
    #[error("Malformed rule update for event {event_id}: {reason}")]
    MalformedRuleUpdate { event_id: u64, reason: String },

    #[error("Encoding error: {0}")]
    Encode(String),
}

/// Errors raised by a rule engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Rule engine initialization failed: {0}")]
    Initialize(String),

    #[error("Rule update for group '{group}' failed: {reason}")]
    RuleUpdate { group: String, reason: String },

    #[error("Evaluation failed: {0}")]
    Evaluation(String),
}

impl EngineError {
    /// Create a new Evaluation error
    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation(message.into())
    }

    /// Create a new RuleUpdate error
    pub fn rule_update(group: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RuleUpdate {
            group: group.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised when handing an event to a downstream sink
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink failed to durably accept the event
    #[error("Sink I/O error: {0}")]
    Io(String),

    /// No sink is configured at this position
    #[error("No {0} sink configured")]
    NotConfigured(SinkKind),

    /// The sink is no longer accepting events
    #[error("Sink closed: {0}")]
    Closed(String),
}

impl SinkError {
    /// Create a new I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Encode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_configured_names_the_sink() {
        let err = SinkError::NotConfigured(SinkKind::Aggregation);
        assert_eq!(err.to_string(), "No aggregation sink configured");
    }

    #[test]
    fn test_rule_update_error() {
        let err = EngineError::rule_update("payments", "bad json");
        assert!(matches!(err, EngineError::RuleUpdate { .. }));
        assert!(err.to_string().contains("payments"));
    }
}
