//! # Nucleus Processor
//!
//! Sharded, crash-recoverable event processing for the Nucleus rule pipeline.
//!
//! A [`Processor`] ties together:
//! - a durable queue (write-ahead log) from `nucleus-storage`
//! - a [`ShardRouter`] that keeps every shard key on one worker
//! - one [`ShardHandler`] per shard, such as [`RulesEngineHandler`]
//! - an [`OutputRouter`] over the alert, state and aggregation sinks
//!
//! Processors implement [`Sink`](nucleus_core::Sink), so the alert sink of a
//! rule processor can itself be a processor with its own log.
//!
//! ## Example
//!
//! ```rust,ignore
//! use nucleus_processor::{OutputRouter, ProcessorConfig, StopMode, start_rule_processor};
//!
//! let config = ProcessorConfig::from_properties("rules", &props)?;
//! let outputs = OutputRouter::from_sinks(vec![alerts, state, aggregation])?;
//! let (rules, stats) =
//!     start_rule_processor(config, wal, ids, outputs, |_shard| MyEngine::default()).await?;
//!
//! rules.process_event_waled(event).await?;
//! println!("earliest pending: {:?}", rules.earliest_event_id()?);
//!
//! rules.stop(StopMode::Drain).await?;
//! ```

pub mod config;
mod error;
mod handler;
mod processor;
mod router;
mod rules;
mod shard;

pub use config::ProcessorConfig;
pub use error::{ProcessorError, ProcessorResult};
pub use handler::{Disposition, ShardHandler};
pub use processor::{Processor, ProcessorStats, ProcessorStatsSnapshot, StopMode};
pub use router::OutputRouter;
pub use rules::{
    EvaluationSnapshot, EvaluationStats, RULES_PREFIX, RulesEngineHandler, start_rule_processor,
};
pub use shard::{ShardRouter, hash_shard_key};
