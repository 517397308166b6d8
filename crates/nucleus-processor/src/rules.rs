//! Rule evaluation stage
//!
//! Adapts a [`RuleEngine`] to a shard worker. Each shard owns its own engine
//! instance, so rule updates are broadcast to every shard and every engine
//! rebuilds the same rule set from the same stream of control events.
//!
//! Rule-update events are never acknowledged. They stay in the write-ahead
//! log and are replayed on every restart, which is how a fresh engine gets
//! its rules back.

use std::any::Any;
use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nucleus_core::{
    EngineError, Event, EventError, EventFactory, Outcome, RuleEngine, SinkKind, fields,
};
use nucleus_storage::DurableQueue;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::config::ProcessorConfig;
use crate::error::ProcessorResult;
use crate::handler::{Disposition, ShardHandler};
use crate::processor::Processor;
use crate::router::OutputRouter;

/// Configuration prefix and processor name of the rule stage
pub const RULES_PREFIX: &str = "rules";

/// Counters shared by every shard of a rule processor
#[derive(Debug, Default)]
pub struct EvaluationStats {
    evaluated: AtomicU64,
    rule_updates: AtomicU64,
    alerts: AtomicU64,
    forwarded: AtomicU64,
    rule_hits: AtomicU64,
    no_matches: AtomicU64,
    action_errors: AtomicU64,
    slow_evaluations: AtomicU64,
}

/// Point-in-time copy of [`EvaluationStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvaluationSnapshot {
    pub evaluated: u64,
    pub rule_updates: u64,
    pub alerts: u64,
    pub forwarded: u64,
    pub rule_hits: u64,
    pub no_matches: u64,
    pub action_errors: u64,
    pub slow_evaluations: u64,
}

impl EvaluationStats {
    pub fn snapshot(&self) -> EvaluationSnapshot {
        EvaluationSnapshot {
            evaluated: self.evaluated.load(Ordering::Relaxed),
            rule_updates: self.rule_updates.load(Ordering::Relaxed),
            alerts: self.alerts.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            rule_hits: self.rule_hits.load(Ordering::Relaxed),
            no_matches: self.no_matches.load(Ordering::Relaxed),
            action_errors: self.action_errors.load(Ordering::Relaxed),
            slow_evaluations: self.slow_evaluations.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Shard handler that evaluates events with a rule engine and forwards the
/// outcomes to the downstream sinks
pub struct RulesEngineHandler<E> {
    shard: usize,
    engine: E,
    outputs: OutputRouter,
    ids: Arc<EventFactory>,
    outcomes: Vec<Outcome>,
    /// Alert ids already used by the current evaluation
    alerted: HashSet<u64>,
    slow_threshold: Option<Duration>,
    stats: Arc<EvaluationStats>,
}

impl<E: RuleEngine> RulesEngineHandler<E> {
    /// Create a handler for `shard`, initializing `engine` with the
    /// pass-through engine options of `config`
    pub fn new(
        shard: usize,
        mut engine: E,
        config: &ProcessorConfig,
        outputs: OutputRouter,
        ids: Arc<EventFactory>,
    ) -> ProcessorResult<Self> {
        engine.initialize(&config.engine)?;
        Ok(Self {
            shard,
            engine,
            outputs,
            ids,
            outcomes: Vec::new(),
            alerted: HashSet::new(),
            slow_threshold: config.slow_evaluation_threshold,
            stats: Arc::new(EvaluationStats::default()),
        })
    }

    /// Report into shared counters
    pub fn with_stats(mut self, stats: Arc<EvaluationStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> &Arc<EvaluationStats> {
        &self.stats
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    fn apply_rule_update(&mut self, event: &Event) -> ProcessorResult<Disposition> {
        let update = event.rule_update()?;
        guarded(|| {
            self.engine
                .update_rule(&update.group, &update.content, update.delete)
        })?;
        bump(&self.stats.rule_updates);
        info!(
            event_id = event.id(),
            group = %update.group,
            delete = update.delete,
            "Processed rule update"
        );
        Ok(Disposition::Retain)
    }

    async fn evaluate(&mut self, event: &Event) -> ProcessorResult<Disposition> {
        self.outcomes.clear();
        self.alerted.clear();
        let started = Instant::now();
        let result = guarded(|| self.engine.evaluate(event, &mut self.outcomes));
        let elapsed = started.elapsed();
        bump(&self.stats.evaluated);

        if self.slow_threshold.is_some_and(|threshold| elapsed > threshold) {
            bump(&self.stats.slow_evaluations);
            warn!(
                event_id = event.id(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow rule evaluation"
            );
        }

        if let Err(e) = result {
            self.outcomes.clear();
            action_error(&self.stats, event.id(), &e.to_string());
            return Err(e.into());
        }

        let mut outcomes = std::mem::take(&mut self.outcomes);
        let mut failures = 0usize;
        for outcome in outcomes.drain(..) {
            if !self.handle(event, outcome).await {
                failures += 1;
            }
        }
        self.outcomes = outcomes;

        if failures == 0 {
            Ok(Disposition::Ack)
        } else {
            debug!(
                event_id = event.id(),
                failures, "Leaving event for replay after failed actions"
            );
            Ok(Disposition::Retain)
        }
    }

    /// Handle one outcome; `false` when an action failed
    async fn handle(&mut self, event: &Event, outcome: Outcome) -> bool {
        trace!(event_id = event.id(), kind = %outcome.kind(), "Rule outcome");
        let origin = event.id();
        let destination = outcome.destination();

        let routed = match outcome {
            Outcome::TemplatedAlert {
                event: output,
                rule_group,
                rule_id,
                action_id,
                rule_name,
                template_id,
                timestamp,
            } => build_alert(
                output,
                rule_group,
                rule_id,
                action_id,
                rule_name,
                template_id,
                timestamp,
            )
            .and_then(|alert| {
                if self.alerted.insert(alert.id()) {
                    Ok(alert)
                } else {
                    rekey_alert(alert, self.ids.next_id())
                }
            }),
            Outcome::Aggregation {
                action,
                original,
                timestamp,
                window_size,
                rule_action_id,
                aggregation_key,
                aggregation_value,
            } => Ok(self
                .derived(origin)
                .with_header(fields::AGGREGATION_ACTION, action)
                .with_header(fields::EVENT, original)
                .with_header(fields::TIMESTAMP, timestamp)
                .with_header(fields::WINDOW_SIZE, i64::from(window_size))
                .with_header(fields::RULE_ACTION_ID, rule_action_id)
                .with_header(fields::AGGREGATION_KEY, aggregation_key)
                .with_header(fields::AGGREGATION_VALUE, aggregation_value)),
            Outcome::StateTracking {
                track,
                original,
                timestamp,
                window_size,
                rule_action_id,
                aggregation_key,
            } => Ok(self
                .derived(origin)
                .with_header(fields::STATE_TRACK, track)
                .with_header(fields::EVENT, original)
                .with_header(fields::TIMESTAMP, timestamp)
                .with_header(fields::WINDOW_SIZE, i64::from(window_size))
                .with_header(fields::RULE_ACTION_ID, rule_action_id)
                .with_header(fields::AGGREGATION_KEY, aggregation_key)),
            Outcome::NewEvent { original, output } => {
                let (_, headers, body) = output.into_parts();
                let mut derived = self.derived(original.id()).with_body(body);
                for (name, value) in headers {
                    derived.headers_mut().entry(name).or_insert(value);
                }
                Ok(derived)
            }
            Outcome::TaggedEvent { event: tagged } => {
                let tagged_id = tagged.id();
                let (_, headers, body) = tagged.into_parts();
                let mut derived = Event::from_parts(self.ids.next_id(), headers, body);
                derived.insert_header(fields::ORIGIN_EVENT_ID, tagged_id as i64);
                derived.insert_header(fields::TAGGED, true);
                Ok(derived)
            }
            Outcome::Anomaly { series_name, value } => Ok(self
                .derived(origin)
                .with_header(fields::SERIES_NAME, series_name)
                .with_header(fields::SERIES_VALUE, value)),
            Outcome::RawAlert {
                rule_id, target, ..
            } => {
                warn!(
                    event_id = origin,
                    rule_id, target = %target, "Raw alerts are not supported; dropping"
                );
                return true;
            }
            Outcome::RuleHit {
                rule_group,
                rule_id,
            } => {
                bump(&self.stats.rule_hits);
                trace!(group = %rule_group, rule_id, "Rule hit");
                return true;
            }
            Outcome::RuleEfficiency {
                rule_group,
                rule_id,
                execute_nanos,
            } => {
                trace!(group = %rule_group, rule_id, execute_nanos, "Rule efficiency");
                return true;
            }
            Outcome::ConditionEfficiency {
                rule_group,
                rule_id,
                execute_nanos,
            } => {
                trace!(group = %rule_group, rule_id, execute_nanos, "Condition efficiency");
                return true;
            }
            Outcome::NoMatch { event_id, rule_id } => {
                bump(&self.stats.no_matches);
                trace!(event_id, rule_id, "No rule matched");
                return true;
            }
            Outcome::ActionError { event_id, reason } => {
                action_error(&self.stats, event_id, &reason);
                return false;
            }
        };

        let Some(kind) = destination else {
            return true;
        };
        match routed {
            Ok(output) => forward(&self.outputs, &self.stats, kind, output, origin).await,
            Err(e) => {
                action_error(&self.stats, origin, &e.to_string());
                false
            }
        }
    }

    /// Empty event with a fresh id that points back at `origin`
    ///
    /// Ids are not stable across replays: evaluating the same event again
    /// emits new ids. Downstream deduplication keys on the `_oid` header plus
    /// the outcome's headers instead.
    fn derived(&self, origin: u64) -> Event {
        self.ids
            .build()
            .with_header(fields::ORIGIN_EVENT_ID, origin as i64)
    }
}

#[async_trait]
impl<E: RuleEngine + 'static> ShardHandler for RulesEngineHandler<E> {
    async fn consume(&mut self, event: &Event) -> ProcessorResult<Disposition> {
        if event.is_rule_update() {
            self.apply_rule_update(event)
        } else {
            self.evaluate(event).await
        }
    }
}

/// Send an outcome event downstream; `false` when the sink failed
async fn forward(
    outputs: &OutputRouter,
    stats: &EvaluationStats,
    kind: SinkKind,
    output: Event,
    origin: u64,
) -> bool {
    let output_id = output.id();
    match outputs.send(kind, output).await {
        Ok(()) => {
            if kind == SinkKind::Alert {
                bump(&stats.alerts);
            }
            bump(&stats.forwarded);
            debug!(event_id = origin, output_id, sink = %kind, "Forwarded outcome");
            true
        }
        Err(e) => {
            action_error(stats, origin, &format!("{kind} sink: {e}"));
            false
        }
    }
}

fn action_error(stats: &EvaluationStats, event_id: u64, reason: &str) {
    bump(&stats.action_errors);
    warn!(event_id, reason, "Action error");
}

/// Alert event for a matched rule
///
/// Keeps the id of the event it alerts on. The body is the JSON rendering of
/// the headers.
fn build_alert(
    output: Event,
    rule_group: String,
    rule_id: i16,
    action_id: i16,
    rule_name: String,
    template_id: i16,
    timestamp: i64,
) -> Result<Event, EventError> {
    let mut alert = Event::new(output.id())
        .with_header(fields::EVENT, output)
        .with_header(fields::TIMESTAMP, timestamp)
        .with_header(fields::ALERT_TEMPLATE_ID, template_id)
        .with_header(fields::ACTION_ID, action_id)
        .with_header(fields::RULE_ID, rule_id)
        .with_header(fields::RULE_NAME, rule_name)
        .with_header(fields::RULE_GROUP, rule_group);
    let body = alert.headers_json()?;
    alert.set_body(body);
    Ok(alert)
}

/// Move a second alert for the same event to its own id
///
/// Two alerts under one id would collide in a durable alert sink. The
/// original id is kept in `_oid`.
fn rekey_alert(alert: Event, id: u64) -> Result<Event, EventError> {
    let origin = alert.id();
    let (_, headers, _) = alert.into_parts();
    let mut alert = Event::from_parts(id, headers, Vec::<u8>::new())
        .with_header(fields::ORIGIN_EVENT_ID, origin as i64);
    let body = alert.headers_json()?;
    alert.set_body(body);
    Ok(alert)
}

/// Run an engine call, turning a panic into an evaluation error
fn guarded<T>(call: impl FnOnce() -> Result<T, EngineError>) -> Result<T, EngineError> {
    catch_unwind(AssertUnwindSafe(call))
        .unwrap_or_else(|payload| Err(EngineError::evaluation(panic_message(&*payload))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("rule engine panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("rule engine panicked: {message}")
    } else {
        "rule engine panicked".to_string()
    }
}

/// Start the rule stage: one engine per shard, outcomes routed to `outputs`
///
/// Returns the processor together with the evaluation counters shared by
/// its shards.
pub async fn start_rule_processor<E, F>(
    config: ProcessorConfig,
    wal: Arc<dyn DurableQueue>,
    ids: Arc<EventFactory>,
    outputs: OutputRouter,
    mut engines: F,
) -> ProcessorResult<(Arc<Processor>, Arc<EvaluationStats>)>
where
    E: RuleEngine + 'static,
    F: FnMut(usize) -> E,
{
    let stats = Arc::new(EvaluationStats::default());
    let handler_ids = Arc::clone(&ids);
    let handler_stats = Arc::clone(&stats);
    let processor = Processor::start(RULES_PREFIX, config, wal, ids, |shard, config| {
        Ok(RulesEngineHandler::new(
            shard,
            engines(shard),
            config,
            outputs.clone(),
            Arc::clone(&handler_ids),
        )?
        .with_stats(Arc::clone(&handler_stats)))
    })
    .await?;
    Ok((processor, stats))
}
