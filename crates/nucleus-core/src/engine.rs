//! Rule engine contract
//!
//! The rule engine is an external, swappable collaborator. A shard owns one
//! engine instance, drives its rule lifecycle through [`RuleEngine::update_rule`]
//! and evaluates data events with [`RuleEngine::evaluate`]. Everything an
//! evaluation produces is reported as an [`Outcome`] through a single
//! [`OutcomeCollector`].

use std::fmt;

use crate::Properties;
use crate::error::EngineError;
use crate::event::{Event, HeaderValue};
use crate::sink::SinkKind;

/// A stateless-with-respect-to-the-pipeline rule evaluator
///
/// Implementations are owned by exactly one shard and are never shared, so
/// they need to be `Send` but not `Sync`.
pub trait RuleEngine: Send {
    /// Prepare the engine with pass-through configuration
    fn initialize(&mut self, conf: &Properties) -> Result<(), EngineError>;

    /// Create, replace or delete rules of a group
    fn update_rule(&mut self, group: &str, content: &str, delete: bool)
    -> Result<(), EngineError>;

    /// Evaluate an event against the rules of its group
    fn evaluate(
        &mut self,
        event: &Event,
        outcomes: &mut dyn OutcomeCollector,
    ) -> Result<(), EngineError>;
}

/// Receives the outcomes of one evaluation
pub trait OutcomeCollector {
    fn emit(&mut self, outcome: Outcome);
}

impl OutcomeCollector for Vec<Outcome> {
    fn emit(&mut self, outcome: Outcome) {
        self.push(outcome);
    }
}

/// Everything a rule engine can report about an evaluated event
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// A matched rule asks for a templated alert
    TemplatedAlert {
        event: Event,
        rule_group: String,
        rule_id: i16,
        action_id: i16,
        rule_name: String,
        template_id: i16,
        timestamp: i64,
    },
    /// A matched rule asks for a raw alert to an explicit target
    RawAlert {
        event: Event,
        rule_id: i16,
        action_id: i16,
        target: String,
        media_type: String,
    },
    /// A rule matched
    RuleHit { rule_group: String, rule_id: i16 },
    /// Time spent executing a rule
    RuleEfficiency {
        rule_group: String,
        rule_id: i16,
        execute_nanos: u64,
    },
    /// Time spent evaluating a rule's condition
    ConditionEfficiency {
        rule_group: String,
        rule_id: i16,
        execute_nanos: u64,
    },
    /// A rule did not match the event
    NoMatch { event_id: u64, rule_id: i16 },
    /// A value for an aggregation window
    Aggregation {
        action: String,
        original: Event,
        timestamp: i64,
        window_size: u32,
        rule_action_id: String,
        aggregation_key: String,
        aggregation_value: HeaderValue,
    },
    /// Start or stop tracking state for a key
    StateTracking {
        track: bool,
        original: Event,
        timestamp: i64,
        window_size: u32,
        rule_action_id: String,
        aggregation_key: String,
    },
    /// A new event derived from the original
    NewEvent { original: Event, output: Event },
    /// The event, tagged by a rule
    TaggedEvent { event: Event },
    /// A data point for anomaly detection
    Anomaly { series_name: String, value: f64 },
    /// An action could not be carried out
    ActionError { event_id: u64, reason: String },
}

/// Discriminant of [`Outcome`], used for logging and counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    TemplatedAlert,
    RawAlert,
    RuleHit,
    RuleEfficiency,
    ConditionEfficiency,
    NoMatch,
    Aggregation,
    StateTracking,
    NewEvent,
    TaggedEvent,
    Anomaly,
    ActionError,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutcomeKind::TemplatedAlert => "templated_alert",
            OutcomeKind::RawAlert => "raw_alert",
            OutcomeKind::RuleHit => "rule_hit",
            OutcomeKind::RuleEfficiency => "rule_efficiency",
            OutcomeKind::ConditionEfficiency => "condition_efficiency",
            OutcomeKind::NoMatch => "no_match",
            OutcomeKind::Aggregation => "aggregation",
            OutcomeKind::StateTracking => "state_tracking",
            OutcomeKind::NewEvent => "new_event",
            OutcomeKind::TaggedEvent => "tagged_event",
            OutcomeKind::Anomaly => "anomaly",
            OutcomeKind::ActionError => "action_error",
        };
        f.write_str(name)
    }
}

impl Outcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::TemplatedAlert { .. } => OutcomeKind::TemplatedAlert,
            Outcome::RawAlert { .. } => OutcomeKind::RawAlert,
            Outcome::RuleHit { .. } => OutcomeKind::RuleHit,
            Outcome::RuleEfficiency { .. } => OutcomeKind::RuleEfficiency,
            Outcome::ConditionEfficiency { .. } => OutcomeKind::ConditionEfficiency,
            Outcome::NoMatch { .. } => OutcomeKind::NoMatch,
            Outcome::Aggregation { .. } => OutcomeKind::Aggregation,
            Outcome::StateTracking { .. } => OutcomeKind::StateTracking,
            Outcome::NewEvent { .. } => OutcomeKind::NewEvent,
            Outcome::TaggedEvent { .. } => OutcomeKind::TaggedEvent,
            Outcome::Anomaly { .. } => OutcomeKind::Anomaly,
            Outcome::ActionError { .. } => OutcomeKind::ActionError,
        }
    }

    /// The sink an outcome is forwarded to, or `None` for observability-only
    /// outcomes
    pub fn destination(&self) -> Option<SinkKind> {
        match self.kind() {
            OutcomeKind::TemplatedAlert => Some(SinkKind::Alert),
            OutcomeKind::Aggregation | OutcomeKind::Anomaly => Some(SinkKind::Aggregation),
            OutcomeKind::StateTracking | OutcomeKind::NewEvent | OutcomeKind::TaggedEvent => {
                Some(SinkKind::State)
            }
            OutcomeKind::RawAlert
            | OutcomeKind::RuleHit
            | OutcomeKind::RuleEfficiency
            | OutcomeKind::ConditionEfficiency
            | OutcomeKind::NoMatch
            | OutcomeKind::ActionError => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_collects_in_order() {
        let mut outcomes: Vec<Outcome> = Vec::new();
        outcomes.emit(Outcome::RuleHit {
            rule_group: "g".into(),
            rule_id: 1,
        });
        outcomes.emit(Outcome::NoMatch {
            event_id: 9,
            rule_id: 2,
        });
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].kind(), OutcomeKind::RuleHit);
        assert_eq!(outcomes[1].kind(), OutcomeKind::NoMatch);
    }

    #[test]
    fn test_destinations() {
        let alert = Outcome::TemplatedAlert {
            event: Event::new(1),
            rule_group: "g".into(),
            rule_id: 1,
            action_id: 1,
            rule_name: "r".into(),
            template_id: 1,
            timestamp: 0,
        };
        assert_eq!(alert.destination(), Some(SinkKind::Alert));

        let anomaly = Outcome::Anomaly {
            series_name: "cpu".into(),
            value: 0.9,
        };
        assert_eq!(anomaly.destination(), Some(SinkKind::Aggregation));

        let tagged = Outcome::TaggedEvent {
            event: Event::new(2),
        };
        assert_eq!(tagged.destination(), Some(SinkKind::State));

        let hit = Outcome::RuleHit {
            rule_group: "g".into(),
            rule_id: 1,
        };
        assert_eq!(hit.destination(), None);
    }
}
