//! Sharded, WAL-backed processor
//!
//! A processor accepts events, persists them to its write-ahead log, and
//! dispatches each one to a shard worker chosen by [`ShardRouter`]. Each
//! worker feeds its shard's events, in arrival order, to a [`ShardHandler`]
//! and acknowledges them once the handler is done.
//!
//! ```text
//! process_event_waled ─► WAL append ─► dispatch ─► shard channel ─► worker ─► handler
//!                                         ▲                           │
//! WAL recovery ─► process_event_non_waled ┘                      ack_event
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use nucleus_core::{Event, EventFactory, Sink, SinkError};
use nucleus_logging::{processor_span, shard_span};
use nucleus_storage::{DurableQueue, RecoveryTarget, RedbWal, StorageError};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, instrument, warn};

use crate::config::ProcessorConfig;
use crate::error::{ProcessorError, ProcessorResult};
use crate::handler::{Disposition, ShardHandler};
use crate::shard::ShardRouter;

/// How [`Processor::stop`] treats events already queued on the shards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Process everything already dispatched, then stop
    Drain,
    /// Stop after each worker's current event; the rest stay in the WAL
    Abandon,
}

/// Counters shared by a processor and its workers
#[derive(Debug, Default)]
pub struct ProcessorStats {
    accepted: AtomicU64,
    processed: AtomicU64,
    acked: AtomicU64,
    retained: AtomicU64,
    failed: AtomicU64,
    ack_failures: AtomicU64,
    rule_updates: AtomicU64,
    recovered: AtomicU64,
    quarantined: AtomicU64,
}

/// Point-in-time copy of [`ProcessorStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStatsSnapshot {
    /// Events durably accepted through the WAL path
    pub accepted: u64,
    /// Events a worker handed to its handler
    pub processed: u64,
    pub acked: u64,
    /// Events the handler chose to keep in the WAL
    pub retained: u64,
    /// Events the handler failed on
    pub failed: u64,
    pub ack_failures: u64,
    pub rule_updates: u64,
    /// Events redelivered from the WAL on start
    pub recovered: u64,
    pub quarantined: u64,
}

impl ProcessorStats {
    pub fn snapshot(&self) -> ProcessorStatsSnapshot {
        ProcessorStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            retained: self.retained.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            rule_updates: self.rule_updates.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            quarantined: self.quarantined.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// A running, sharded processor
pub struct Processor {
    name: String,
    config: ProcessorConfig,
    wal: Arc<dyn DurableQueue>,
    ids: Arc<EventFactory>,
    shards: ShardRouter,
    /// Shard inbound channels; `None` once stopping
    senders: RwLock<Option<Arc<[mpsc::Sender<Event>]>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    running: AtomicBool,
    stats: Arc<ProcessorStats>,
}

impl Processor {
    /// Start a processor
    ///
    /// Builds one handler per shard with `make_handler`, spawns the shard
    /// workers, then opens the WAL and replays every unacknowledged event
    /// before returning. Failing to open the WAL stops the workers and is
    /// returned as an error.
    pub async fn start<H, F>(
        name: impl Into<String>,
        config: ProcessorConfig,
        wal: Arc<dyn DurableQueue>,
        ids: Arc<EventFactory>,
        mut make_handler: F,
    ) -> ProcessorResult<Arc<Self>>
    where
        H: ShardHandler,
        F: FnMut(usize, &ProcessorConfig) -> ProcessorResult<H>,
    {
        config.validate()?;
        let name = name.into();

        let handlers = (0..config.parallelism)
            .map(|shard| make_handler(shard, &config))
            .collect::<ProcessorResult<Vec<_>>>()?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let stats = Arc::new(ProcessorStats::default());
        let mut senders = Vec::with_capacity(handlers.len());
        let mut workers = Vec::with_capacity(handlers.len());

        for (shard, handler) in handlers.into_iter().enumerate() {
            let (tx, rx) = mpsc::channel(config.buffer_size);
            let worker = ShardWorker {
                handler,
                rx,
                shutdown_rx: shutdown_tx.subscribe(),
                wal: Arc::clone(&wal),
                stats: Arc::clone(&stats),
            };
            workers.push(tokio::spawn(
                worker.run().instrument(shard_span(&name, shard)),
            ));
            senders.push(tx);
        }

        let processor = Arc::new(Self {
            shards: ShardRouter::new(config.parallelism, config.shuffle_key.clone()),
            name,
            config,
            wal,
            ids,
            senders: RwLock::new(Some(senders.into())),
            workers: Mutex::new(workers),
            shutdown_tx,
            running: AtomicBool::new(true),
            stats,
        });

        let span = processor_span(&processor.name);
        match processor.wal.start(&*processor).instrument(span).await {
            Ok(report) => {
                processor
                    .stats
                    .recovered
                    .store(report.recovered, Ordering::Relaxed);
                processor
                    .stats
                    .quarantined
                    .store(report.quarantined, Ordering::Relaxed);
                info!(
                    processor = %processor.name,
                    parallelism = processor.config.parallelism,
                    recovered = report.recovered,
                    quarantined = report.quarantined,
                    halted = report.halted,
                    "Processor started"
                );
                Ok(processor)
            }
            Err(e) => {
                error!(processor = %processor.name, error = %e, "Failed to open write-ahead log");
                if let Err(stop_err) = processor.stop(StopMode::Abandon).await {
                    warn!(processor = %processor.name, error = %stop_err, "Cleanup after failed start");
                }
                Err(e.into())
            }
        }
    }

    /// Start a processor backed by a [`RedbWal`] at `config.wal`
    pub async fn start_persistent<H, F>(
        name: impl Into<String>,
        config: ProcessorConfig,
        ids: Arc<EventFactory>,
        make_handler: F,
    ) -> ProcessorResult<Arc<Self>>
    where
        H: ShardHandler,
        F: FnMut(usize, &ProcessorConfig) -> ProcessorResult<H>,
    {
        let wal: Arc<dyn DurableQueue> = Arc::new(RedbWal::new(config.wal.clone()));
        Self::start(name, config, wal, ids, make_handler).await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Accept a new event: persist it, then dispatch it
    ///
    /// A failed append is returned and the event is not dispatched.
    pub async fn process_event_waled(&self, event: Event) -> ProcessorResult<()> {
        if !self.is_running() {
            return Err(ProcessorError::Stopped(self.name.clone()));
        }
        self.wal.write_event(&event)?;
        bump(&self.stats.accepted);
        self.ids.observe(event.id());
        self.dispatch(event).await
    }

    /// Dispatch an event that is already in the WAL
    pub async fn process_event_non_waled(&self, event: Event) -> ProcessorResult<()> {
        self.ids.observe(event.id());
        self.dispatch(event).await
    }

    /// Remove a fully processed event from the WAL
    pub fn ack_event(&self, event_id: u64) -> ProcessorResult<()> {
        acknowledge(self.wal.as_ref(), event_id, &self.stats)?;
        Ok(())
    }

    /// Oldest unacknowledged event id
    ///
    /// Rule updates are never acknowledged, so once a rule processor has
    /// received one this stays at the oldest retained rule update. Lag of
    /// data events has to be read from downstream instead.
    pub fn earliest_event_id(&self) -> ProcessorResult<Option<u64>> {
        Ok(self.wal.earliest_event_id()?)
    }

    /// Number of unacknowledged events
    pub fn pending_count(&self) -> ProcessorResult<u64> {
        Ok(self.wal.pending_count()?)
    }

    pub fn stats(&self) -> ProcessorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Hand an event to its shard, or to every shard for rule updates
    ///
    /// Waits while the target shard's channel is full.
    async fn dispatch(&self, event: Event) -> ProcessorResult<()> {
        let senders = self
            .senders
            .read()
            .clone()
            .ok_or_else(|| ProcessorError::Stopped(self.name.clone()))?;
        let closed = |_| ProcessorError::Stopped(self.name.clone());

        if event.is_rule_update() {
            bump(&self.stats.rule_updates);
            for sender in senders.iter() {
                sender.send(event.clone()).await.map_err(closed)?;
            }
            return Ok(());
        }

        let shard = self.shards.shard_for(&event);
        senders[shard].send(event).await.map_err(closed)
    }

    /// Stop the workers and release the WAL
    ///
    /// Safe to call more than once. Unacknowledged events stay in the WAL.
    #[instrument(skip(self), fields(processor = %self.name))]
    pub async fn stop(&self, mode: StopMode) -> ProcessorResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(()); // Already stopped
        }

        if mode == StopMode::Abandon {
            let _ = self.shutdown_tx.send(());
        }
        // Closing the channels ends each worker once its queue is empty
        drop(self.senders.write().take());

        let workers = std::mem::take(&mut *self.workers.lock());
        let mut failure = None;
        for (shard, worker) in workers.into_iter().enumerate() {
            if let Err(e) = worker.await {
                error!(shard, error = %e, "Shard worker terminated abnormally");
                failure = Some(ProcessorError::Worker(format!("shard {shard}: {e}")));
            }
        }

        self.wal.stop()?;
        info!(?mode, "Processor stopped");
        failure.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl RecoveryTarget for Processor {
    async fn process_event_non_waled(&self, event: Event) -> Result<(), StorageError> {
        Processor::process_event_non_waled(self, event)
            .await
            .map_err(|e| StorageError::delivery(e.to_string()))
    }
}

#[async_trait]
impl Sink for Processor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue_durable(&self, event: Event) -> Result<(), SinkError> {
        self.process_event_waled(event).await.map_err(|e| match e {
            ProcessorError::Stopped(name) => SinkError::Closed(name),
            other => SinkError::io(other.to_string()),
        })
    }
}

/// Remove an entry, retrying once before giving up
fn acknowledge(
    wal: &dyn DurableQueue,
    event_id: u64,
    stats: &ProcessorStats,
) -> Result<(), StorageError> {
    let result = wal.ack_event(event_id).or_else(|e| {
        warn!(event_id, error = %e, "Acknowledgment failed; retrying");
        wal.ack_event(event_id)
    });
    match &result {
        Ok(()) => bump(&stats.acked),
        Err(e) => {
            bump(&stats.ack_failures);
            error!(event_id, error = %e, "Acknowledgment failed; event will be replayed");
        }
    }
    result
}

/// One shard's consumer loop
struct ShardWorker<H> {
    handler: H,
    rx: mpsc::Receiver<Event>,
    shutdown_rx: broadcast::Receiver<()>,
    wal: Arc<dyn DurableQueue>,
    stats: Arc<ProcessorStats>,
}

impl<H: ShardHandler> ShardWorker<H> {
    async fn run(mut self) {
        debug!("Shard worker started");
        loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    debug!(queued = self.rx.len(), "Abandoning queued events");
                    break;
                }
                next = self.rx.recv() => match next {
                    Some(event) => event,
                    None => break,
                },
            };
            self.process(event).await;
        }
        debug!("Shard worker stopped");
    }

    async fn process(&mut self, event: Event) {
        bump(&self.stats.processed);
        match self.handler.consume(&event).await {
            Ok(Disposition::Ack) => {
                // Failures are logged and counted; the entry is replayed later
                let _ = acknowledge(self.wal.as_ref(), event.id(), &self.stats);
            }
            Ok(Disposition::Retain) => bump(&self.stats.retained),
            Err(e) => {
                bump(&self.stats.failed);
                error!(event_id = event.id(), error = %e, "Event processing failed; leaving it for replay");
            }
        }
    }
}
