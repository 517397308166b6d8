//! Event model
//!
//! An [`Event`] carries a durable identifier, a mapping of typed headers used
//! for routing and control, and an opaque body. Identifiers double as the
//! write-ahead log key and as the unit of acknowledgment, so they come from a
//! single [`EventFactory`] and are never reissued while an event is in flight.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::EventError;

/// Header field names understood by the pipeline
pub mod fields {
    /// Event type discriminator
    pub const EVENT_TYPE: &str = "_t";
    /// Rule group an event or rule belongs to
    pub const RULE_GROUP: &str = "_r";
    /// Serialized rule content carried by a rule update
    pub const RULE_CONTENT: &str = "_rc";
    /// Delete flag carried by a rule update
    pub const RULE_DELETE: &str = "_rd";
    /// Original event embedded in an alert
    pub const EVENT: &str = "_e";
    /// Outcome timestamp (epoch millis)
    pub const TIMESTAMP: &str = "_ts";
    /// Alert template id
    pub const ALERT_TEMPLATE_ID: &str = "_at";
    /// Action id within a rule
    pub const ACTION_ID: &str = "_ai";
    /// Rule id within a group
    pub const RULE_ID: &str = "_ri";
    /// Human readable rule name
    pub const RULE_NAME: &str = "_rn";
    /// Id of the event an outcome was derived from
    pub const ORIGIN_EVENT_ID: &str = "_oid";
    /// Rule action id for aggregation and state tracking
    pub const RULE_ACTION_ID: &str = "_rai";
    /// Aggregation window size in seconds
    pub const WINDOW_SIZE: &str = "_ws";
    /// Aggregation key
    pub const AGGREGATION_KEY: &str = "_ak";
    /// Aggregation value
    pub const AGGREGATION_VALUE: &str = "_av";
    /// Aggregation action kind
    pub const AGGREGATION_ACTION: &str = "_aa";
    /// State tracking flag
    pub const STATE_TRACK: &str = "_st";
    /// Anomaly series name
    pub const SERIES_NAME: &str = "_sn";
    /// Anomaly series value
    pub const SERIES_VALUE: &str = "_sv";
    /// Event tag marker
    pub const TAGGED: &str = "_tg";
}

/// Value of the [`fields::EVENT_TYPE`] header that marks a rule update
pub const EVENT_TYPE_RULE_UPDATE: &str = "rule_update";

/// Ordered header mapping of an event
pub type Headers = BTreeMap<String, HeaderValue>;

/// A typed header value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HeaderValue {
    Str(String),
    Int(i64),
    Short(i16),
    Float(f64),
    Bool(bool),
    Event(Box<Event>),
}

impl HeaderValue {
    /// Borrow the value as a string, if it is one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as a boolean, if it is one
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HeaderValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get the value as an integer, widening shorts
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            HeaderValue::Short(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Borrow the nested event, if this value holds one
    pub fn as_event(&self) -> Option<&Event> {
        match self {
            HeaderValue::Event(e) => Some(e),
            _ => None,
        }
    }

    /// Stable byte form used for shard hashing
    ///
    /// Equal values always produce equal bytes. A nested event is keyed by its
    /// identifier.
    pub fn key_bytes(&self) -> Vec<u8> {
        match self {
            HeaderValue::Str(s) => s.as_bytes().to_vec(),
            HeaderValue::Int(v) => v.to_be_bytes().to_vec(),
            HeaderValue::Short(v) => i64::from(*v).to_be_bytes().to_vec(),
            HeaderValue::Float(v) => v.to_bits().to_be_bytes().to_vec(),
            HeaderValue::Bool(b) => vec![u8::from(*b)],
            HeaderValue::Event(e) => e.id().to_be_bytes().to_vec(),
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Str(s) => write!(f, "{s}"),
            HeaderValue::Int(v) => write!(f, "{v}"),
            HeaderValue::Short(v) => write!(f, "{v}"),
            HeaderValue::Float(v) => write!(f, "{v}"),
            HeaderValue::Bool(b) => write!(f, "{b}"),
            HeaderValue::Event(e) => write!(f, "event#{}", e.id()),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<i16> for HeaderValue {
    fn from(value: i16) -> Self {
        HeaderValue::Short(value)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<Event> for HeaderValue {
    fn from(value: Event) -> Self {
        HeaderValue::Event(Box::new(value))
    }
}

/// A rule create/update/delete carried by a control event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleUpdate {
    pub group: String,
    pub content: String,
    pub delete: bool,
}

/// The unit flowing through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: u64,
    headers: Headers,
    body: Bytes,
}

impl Event {
    /// Create an empty event with the given identifier
    pub fn new(id: u64) -> Self {
        Self {
            id,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Create an event from its parts
    pub fn from_parts(id: u64, headers: Headers, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            headers,
            body: body.into(),
        }
    }

    /// Builder-style header insertion
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Builder-style body assignment
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    pub fn insert_header(&mut self, name: impl Into<String>, value: impl Into<HeaderValue>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    /// Split into identifier, headers and body
    pub fn into_parts(self) -> (u64, Headers, Bytes) {
        (self.id, self.headers, self.body)
    }

    /// The rule group this event is evaluated against, if any
    pub fn rule_group(&self) -> Option<&str> {
        self.header(fields::RULE_GROUP).and_then(HeaderValue::as_str)
    }

    /// Whether this is a rule-update control event
    pub fn is_rule_update(&self) -> bool {
        self.header(fields::EVENT_TYPE)
            .and_then(HeaderValue::as_str)
            .is_some_and(|t| t == EVENT_TYPE_RULE_UPDATE)
    }

    /// Interpret this event as a rule update
    ///
    /// A missing delete flag means the update is not a delete.
    pub fn rule_update(&self) -> Result<RuleUpdate, EventError> {
        let malformed = |reason: &str| EventError::MalformedRuleUpdate {
            event_id: self.id,
            reason: reason.to_string(),
        };

        let group = self
            .header(fields::RULE_GROUP)
            .ok_or_else(|| malformed("missing rule group"))?
            .to_string();
        let content = self
            .header(fields::RULE_CONTENT)
            .ok_or_else(|| malformed("missing rule content"))?
            .to_string();
        let delete = match self.header(fields::RULE_DELETE) {
            None => false,
            Some(v) => v
                .as_bool()
                .ok_or_else(|| malformed("delete flag is not a boolean"))?,
        };

        Ok(RuleUpdate {
            group,
            content,
            delete,
        })
    }

    /// Render the header mapping as JSON
    pub fn headers_json(&self) -> Result<Vec<u8>, EventError> {
        Ok(serde_json::to_vec(&self.headers)?)
    }

    /// Parse a header mapping previously rendered with [`Event::headers_json`]
    pub fn parse_headers_json(bytes: &[u8]) -> Result<Headers, EventError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event#{}", self.id)
    }
}

/// Hands out strictly increasing event identifiers
///
/// Shared by every processor of a pipeline so ids stay unique across stages.
#[derive(Debug)]
pub struct EventFactory {
    next: AtomicU64,
}

impl EventFactory {
    /// Create a factory whose first id is 1
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Create a factory whose first id is `first`
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Reserve the next identifier
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Build an empty event with a fresh identifier
    pub fn build(&self) -> Event {
        Event::new(self.next_id())
    }

    /// Record that `id` is in use so it is never handed out again
    pub fn observe(&self, id: u64) {
        self.next.fetch_max(id.saturating_add(1), Ordering::SeqCst);
    }

    /// The id the next call to [`EventFactory::next_id`] will return
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for EventFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_update_event(id: u64) -> Event {
        Event::new(id)
            .with_header(fields::EVENT_TYPE, EVENT_TYPE_RULE_UPDATE)
            .with_header(fields::RULE_GROUP, "payments")
            .with_header(fields::RULE_CONTENT, r#"{"id":1}"#)
    }

    #[test]
    fn test_rule_update_parsing() {
        let event = rule_update_event(7).with_header(fields::RULE_DELETE, true);
        assert!(event.is_rule_update());

        let update = event.rule_update().unwrap();
        assert_eq!(update.group, "payments");
        assert_eq!(update.content, r#"{"id":1}"#);
        assert!(update.delete);
    }

    #[test]
    fn test_rule_update_missing_delete_flag() {
        let update = rule_update_event(1).rule_update().unwrap();
        assert!(!update.delete);
    }

    #[test]
    fn test_rule_update_missing_content() {
        let event = Event::new(3)
            .with_header(fields::EVENT_TYPE, EVENT_TYPE_RULE_UPDATE)
            .with_header(fields::RULE_GROUP, "payments");
        let err = event.rule_update().unwrap_err();
        assert!(matches!(
            err,
            EventError::MalformedRuleUpdate { event_id: 3, .. }
        ));
    }

    #[test]
    fn test_data_event_is_not_rule_update() {
        let event = Event::new(1).with_header(fields::EVENT_TYPE, "data");
        assert!(!event.is_rule_update());
        assert!(!Event::new(2).is_rule_update());
    }

    #[test]
    fn test_headers_json_round_trip() {
        let nested = Event::new(11).with_header("host", "db-1").with_body("raw");
        let event = Event::new(12)
            .with_header(fields::EVENT, nested)
            .with_header(fields::RULE_ID, 4i16)
            .with_header(fields::TIMESTAMP, 1_700_000_000_000i64)
            .with_header("ratio", 0.25)
            .with_header("active", true);

        let json = event.headers_json().unwrap();
        let parsed = Event::parse_headers_json(&json).unwrap();
        assert_eq!(&parsed, event.headers());
    }

    #[test]
    fn test_headers_survive_postcard() {
        let event = Event::new(5)
            .with_header(fields::RULE_GROUP, "payments")
            .with_header("count", 3i64)
            .with_body(vec![1u8, 2, 3]);

        let bytes = postcard::to_allocvec(&event).unwrap();
        let decoded: Event = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_key_bytes_distinguish_values() {
        assert_eq!(
            HeaderValue::from("a").key_bytes(),
            HeaderValue::from("a").key_bytes()
        );
        assert_ne!(
            HeaderValue::from("a").key_bytes(),
            HeaderValue::from("b").key_bytes()
        );
        assert_eq!(
            HeaderValue::Short(7).key_bytes(),
            HeaderValue::Int(7).key_bytes()
        );
    }

    #[test]
    fn test_factory_is_monotonic() {
        let factory = EventFactory::new();
        let a = factory.next_id();
        let b = factory.next_id();
        assert_eq!(a, 1);
        assert!(b > a);
    }

    #[test]
    fn test_factory_observe_skips_recovered_ids() {
        let factory = EventFactory::new();
        factory.observe(41);
        assert_eq!(factory.build().id(), 42);

        // Observing an older id never moves the counter backwards
        factory.observe(3);
        assert_eq!(factory.next_id(), 43);
    }
}
