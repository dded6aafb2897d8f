//! Per-pair single-writer matching.
//!
//! Every pair gets one actor task that owns its `MatchingEngine`; the
//! dispatcher routes order messages to the actor by pair key, so all
//! mutations of one book run strictly in arrival order while different
//! pairs match in parallel.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{publish_json, Delivery};
use crate::context::CoreContext;
use crate::engine::{CancelOutcome, EngineError, MatchingEngine};
use crate::lifecycle::ChangeNotification;
use crate::messages::{Alert, AlertKind, ControlMessage, EngineMessage, OrderMessage};
use crate::metrics;
use crate::model::Pair;
use crate::subjects::{self, OPERATOR_CONTROL};

const PUBLISH_BACKOFF_MS: u64 = 50;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Pair actor for {0} has stopped")]
    ActorStopped(String),
}

/// One unit of work for a pair actor. The actor acks the delivery once every
/// resulting message is published, and nacks it otherwise.
pub struct PairCommand {
    pub message: OrderMessage,
    pub delivery: Option<Delivery>,
}

struct PairActor {
    engine: MatchingEngine,
    ctx: CoreContext,
    pair_key: String,
    publish_attempts: u32,
    /// Engine output not yet accepted by the bus, oldest first.
    outbox: VecDeque<EngineMessage>,
    changes: Option<broadcast::Sender<ChangeNotification>>,
}

impl PairActor {
    fn new(
        pair: Pair,
        ctx: CoreContext,
        publish_attempts: u32,
        changes: Option<broadcast::Sender<ChangeNotification>>,
    ) -> Self {
        Self {
            engine: MatchingEngine::new(pair, ctx.time.clone()),
            pair_key: pair.key(),
            ctx,
            publish_attempts: publish_attempts.max(1),
            outbox: VecDeque::new(),
            changes,
        }
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<PairCommand>) {
        debug!(pair = %self.pair_key, "Pair actor started");
        while let Some(command) = inbox.recv().await {
            let started = Instant::now();
            self.handle(command).await;
            metrics::observe_match_latency(started.elapsed().as_secs_f64());
        }
        // Last chance for anything the bus refused
        self.flush_outbox().await;
        debug!(pair = %self.pair_key, pending = self.outbox.len(), "Pair actor stopped");
    }

    async fn handle(&mut self, command: PairCommand) {
        let PairCommand { message, delivery } = command;
        if let Some(d) = &delivery {
            if d.attempt > 1 {
                metrics::inc_redeliveries();
            }
        }

        match self.apply(message) {
            Ok(messages) => self.outbox.extend(messages),
            Err(EngineError::DuplicateOrder(hash)) => {
                // Redelivery: its output is either published or still queued
                debug!(order_hash = ?hash, pair = %self.pair_key, "Duplicate order skipped");
                metrics::inc_duplicates_skipped(1);
            }
            Err(e @ EngineError::InvariantViolation { .. }) => {
                error!(pair = %self.pair_key, error = %e, "🚨 Matching invariant violated");
                self.ctx.halts.halt_pair(&self.pair_key, &e.to_string());
                metrics::set_halted_pairs(self.ctx.halts.halted_pairs().len() as i64);
                self.raise_alert(e.to_string()).await;
            }
        }

        let flushed = self.flush_outbox().await;
        self.publish_snapshot();
        if let Some(d) = delivery {
            let result = if flushed { d.ack().await } else { d.nack().await };
            if let Err(e) = result {
                warn!(pair = %self.pair_key, error = %e, "Delivery settle failed");
            }
        }
    }

    fn apply(&mut self, message: OrderMessage) -> Result<Vec<EngineMessage>, EngineError> {
        match message {
            OrderMessage::New(order) => {
                let responses = if self.ctx.halts.is_halted(&self.pair_key) {
                    let reason = self
                        .ctx
                        .halts
                        .reason(&self.pair_key)
                        .unwrap_or_else(|| "pair halted".to_string());
                    vec![self.engine.reject(order, format!("pair halted: {}", reason))?]
                } else {
                    self.engine.submit(order)?
                };
                metrics::inc_orders_processed();
                let trades: usize = responses.iter().map(|r| r.trades.len()).sum();
                if trades > 0 {
                    metrics::inc_trades_matched(trades as u64);
                }
                Ok(responses.into_iter().map(EngineMessage::Response).collect())
            }
            OrderMessage::Cancel(cancel) => {
                let report = self.engine.cancel(&cancel.order_hash)?;
                match (report.outcome, report.response.clone()) {
                    (CancelOutcome::Cancelled, Some(response)) => {
                        Ok(vec![EngineMessage::Response(response)])
                    }
                    _ => Ok(vec![EngineMessage::CancelReport(report)]),
                }
            }
        }
    }

    /// Publishes the outbox in order. Returns true once it is empty.
    async fn flush_outbox(&mut self) -> bool {
        let subject = subjects::orders_matched(&self.pair_key);
        while let Some(message) = self.outbox.front() {
            let mut published = false;
            for attempt in 1..=self.publish_attempts {
                match publish_json(self.ctx.bus.as_ref(), &subject, &self.pair_key, message).await
                {
                    Ok(()) => {
                        published = true;
                        break;
                    }
                    Err(e) => {
                        warn!(pair = %self.pair_key, attempt, error = %e, "Engine output publish failed");
                        if attempt < self.publish_attempts {
                            tokio::time::sleep(Duration::from_millis(
                                PUBLISH_BACKOFF_MS * u64::from(attempt),
                            ))
                            .await;
                        }
                    }
                }
            }
            if !published {
                return false;
            }
            self.outbox.pop_front();
        }
        true
    }

    fn publish_snapshot(&self) {
        if let Some(changes) = &self.changes {
            let _ = changes.send(ChangeNotification::BookSnapshot(self.engine.book().snapshot()));
        }
    }

    async fn raise_alert(&self, message: String) {
        let alert = ControlMessage::Alert(Alert {
            kind: AlertKind::InvariantViolation,
            message,
            pair_key: Some(self.pair_key.clone()),
            nonce: None,
            timestamp: self.ctx.time.now_millis(),
        });
        if let Err(e) = publish_json(self.ctx.bus.as_ref(), OPERATOR_CONTROL, &self.pair_key, &alert).await {
            error!(pair = %self.pair_key, error = %e, "Failed to publish invariant alert");
        }
    }
}

struct PairHandle {
    inbox: mpsc::Sender<PairCommand>,
    task: JoinHandle<()>,
}

/// Routes order messages to per-pair actors, spawning them on first use.
pub struct Dispatcher {
    ctx: CoreContext,
    queue_capacity: usize,
    publish_attempts: u32,
    changes: Option<broadcast::Sender<ChangeNotification>>,
    actors: HashMap<String, PairHandle>,
}

impl Dispatcher {
    pub fn new(ctx: CoreContext, queue_capacity: usize, publish_attempts: u32) -> Self {
        Self {
            ctx,
            queue_capacity: queue_capacity.max(1),
            publish_attempts,
            changes: None,
            actors: HashMap::new(),
        }
    }

    /// Book snapshots are sent here after every processed message.
    pub fn with_change_feed(mut self, changes: broadcast::Sender<ChangeNotification>) -> Self {
        self.changes = Some(changes);
        self
    }

    pub fn pair_count(&self) -> usize {
        self.actors.len()
    }

    /// Queues `message` on its pair's actor. Waits while that actor's queue is full.
    pub async fn dispatch(
        &mut self,
        message: OrderMessage,
        delivery: Option<Delivery>,
    ) -> Result<(), DispatchError> {
        let pair = *message.pair();
        let key = pair.key();
        let alive = matches!(self.actors.get(&key), Some(h) if !h.inbox.is_closed());
        if !alive {
            let handle = self.spawn_actor(pair);
            self.actors.insert(key.clone(), handle);
        }
        let Some(handle) = self.actors.get(&key) else {
            return Err(DispatchError::ActorStopped(key));
        };
        handle
            .inbox
            .send(PairCommand { message, delivery })
            .await
            .map_err(|_| DispatchError::ActorStopped(key))
    }

    fn spawn_actor(&self, pair: Pair) -> PairHandle {
        info!(pair = %pair, "Spawning pair actor");
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let actor = PairActor::new(
            pair,
            self.ctx.clone(),
            self.publish_attempts,
            self.changes.clone(),
        );
        PairHandle {
            inbox: tx,
            task: tokio::spawn(actor.run(rx)),
        }
    }

    /// Closes every actor's queue and waits for the queued work to drain.
    pub async fn shutdown(self) {
        let count = self.actors.len();
        let mut tasks = Vec::with_capacity(count);
        for (_, handle) in self.actors {
            drop(handle.inbox);
            tasks.push(handle.task);
        }
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Pair actor panicked");
            }
        }
        info!(pairs = count, "Dispatcher shut down");
    }
}
