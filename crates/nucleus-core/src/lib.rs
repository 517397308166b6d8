//! # Nucleus Core
//!
//! Core types and contracts shared by every stage of the Nucleus rule
//! pipeline.
//!
//! ## Key Types
//!
//! - [`Event`]: the unit that flows through the pipeline (id, headers, body)
//! - [`HeaderValue`]: typed header values, including nested events
//! - [`EventFactory`]: monotonic event id assignment
//! - [`Outcome`]: one variant per rule-engine callback kind
//!
//! ## Key Traits
//!
//! - [`RuleEngine`]: the external, swappable rule evaluator a shard drives
//! - [`OutcomeCollector`]: where an engine reports what an evaluation produced
//! - [`Sink`]: a downstream stage that durably accepts outcome events

pub mod engine;
pub mod error;
pub mod event;
pub mod sink;

pub use engine::*;
pub use error::*;
pub use event::*;
pub use sink::*;

use std::collections::HashMap;

/// Opaque key/value configuration passed through to rule engines
pub type Properties = HashMap<String, String>;
