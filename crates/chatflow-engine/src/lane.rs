use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use chatflow_core::config::LaneConfig;
use chatflow_core::error::{ChatflowError, Result};
use chatflow_core::types::{ContactId, FlowId, InboundEvent, PairKey};

use crate::engine::{AdvanceResult, ExecutionEngine};

enum Command {
    Advance {
        event: InboundEvent,
        respond: oneshot::Sender<Result<AdvanceResult>>,
    },
    Stop {
        respond: oneshot::Sender<Result<bool>>,
    },
}

/// A command queued in a conversation lane.
struct LaneItem {
    seq: u64,
    command: Command,
}

struct Lane {
    tx: mpsc::Sender<LaneItem>,
    next_seq: u64,
    /// Advance items with a lower sequence number are answered with `Cancelled`.
    discard_before: Arc<AtomicU64>,
    /// Resolves once the worker has exited, drained items included.
    finished: Option<oneshot::Receiver<()>>,
}

impl Lane {
    fn worker_done(&mut self) -> bool {
        match self.finished.as_mut() {
            Some(rx) => !matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)),
            None => true,
        }
    }
}

/// Result of an event queued with [`LaneRegistry::push`].
pub struct PendingAdvance {
    rx: oneshot::Receiver<Result<AdvanceResult>>,
}

impl PendingAdvance {
    pub async fn wait(self) -> Result<AdvanceResult> {
        self.rx.await.map_err(|_| ChatflowError::Cancelled)?
    }
}

/// Per-pair FIFO lanes. Events for one (flow, contact) pair run strictly one
/// after another on that pair's worker task; different pairs run in parallel.
///
/// Workers exit after `idle_secs` without work and are respawned on demand.
pub struct LaneRegistry {
    engine: Arc<ExecutionEngine>,
    lanes: Mutex<HashMap<PairKey, Lane>>,
    buffer: usize,
    idle: Duration,
}

impl LaneRegistry {
    pub fn new(engine: Arc<ExecutionEngine>, config: &LaneConfig) -> Self {
        Self {
            engine,
            lanes: Mutex::new(HashMap::new()),
            buffer: config.buffer.max(1),
            idle: Duration::from_secs(config.idle_secs.max(1)),
        }
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    /// Queue an event on the pair's lane and wait for its result.
    pub async fn submit(
        &self,
        contact: &ContactId,
        flow_id: &FlowId,
        event: InboundEvent,
    ) -> Result<AdvanceResult> {
        self.push(contact, flow_id, event).await?.wait().await
    }

    /// Queue an event and return as soon as it holds its place in the lane.
    /// Events pushed one after another by the same caller run in that order.
    pub async fn push(
        &self,
        contact: &ContactId,
        flow_id: &FlowId,
        event: InboundEvent,
    ) -> Result<PendingAdvance> {
        let pair = PairKey::new(flow_id.clone(), contact.clone());
        let (respond, rx) = oneshot::channel();
        self.enqueue(&pair, Command::Advance { event, respond }).await?;
        Ok(PendingAdvance { rx })
    }

    /// Discard the pair's queued events and force-close its live run.
    /// The event in flight, if any, finishes first.
    pub async fn stop(&self, flow_id: &FlowId, contact: &ContactId) -> Result<bool> {
        let pair = PairKey::new(flow_id.clone(), contact.clone());
        let (respond, rx) = oneshot::channel();
        self.enqueue(&pair, Command::Stop { respond }).await?;
        rx.await.map_err(|_| ChatflowError::Cancelled)?
    }

    /// Number of lanes with a running worker.
    pub fn active_lanes(&self) -> usize {
        let lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes.values().filter(|l| !l.tx.is_closed()).count()
    }

    async fn enqueue(&self, pair: &PairKey, command: Command) -> Result<()> {
        let mut command = command;
        // A worker may close between lookup and send; the second attempt respawns it.
        for _ in 0..2 {
            let (tx, item) = {
                let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
                lanes.retain(|_, lane| !lane.tx.is_closed() || !lane.worker_done());
                let retiring = match lanes.get_mut(pair) {
                    Some(lane) if lane.tx.is_closed() => Some(lane.finished.take()),
                    _ => None,
                };
                if let Some(predecessor) = retiring {
                    // The retired worker may still be draining; its successor waits for it
                    lanes.insert(pair.clone(), self.spawn(pair.clone(), predecessor));
                }
                let lane = lanes
                    .entry(pair.clone())
                    .or_insert_with(|| self.spawn(pair.clone(), None));
                let seq = lane.next_seq;
                lane.next_seq += 1;
                if matches!(command, Command::Stop { .. }) {
                    lane.discard_before.store(seq, Ordering::SeqCst);
                }
                (lane.tx.clone(), LaneItem { seq, command })
            };
            match tx.send(item).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(item)) => command = item.command,
            }
        }
        Err(ChatflowError::Cancelled)
    }

    fn spawn(&self, pair: PairKey, predecessor: Option<oneshot::Receiver<()>>) -> Lane {
        let (tx, rx) = mpsc::channel(self.buffer);
        let (done, finished) = oneshot::channel();
        let discard_before = Arc::new(AtomicU64::new(0));
        tokio::spawn(run_lane(
            self.engine.clone(),
            pair,
            rx,
            discard_before.clone(),
            self.idle,
            predecessor,
            done,
        ));
        Lane {
            tx,
            next_seq: 0,
            discard_before,
            finished: Some(finished),
        }
    }
}

async fn run_lane(
    engine: Arc<ExecutionEngine>,
    pair: PairKey,
    mut rx: mpsc::Receiver<LaneItem>,
    discard_before: Arc<AtomicU64>,
    idle: Duration,
    predecessor: Option<oneshot::Receiver<()>>,
    done: oneshot::Sender<()>,
) {
    if let Some(previous) = predecessor {
        // Resolves with an error when the previous worker drops its sender
        let _ = previous.await;
    }
    debug!(pair = %pair, "Lane started");
    loop {
        match tokio::time::timeout(idle, rx.recv()).await {
            Ok(Some(item)) => handle(&engine, &pair, item, &discard_before).await,
            Ok(None) => break,
            Err(_) => {
                rx.close();
                // Items sent before the close still get an answer
                while let Ok(item) = rx.try_recv() {
                    handle(&engine, &pair, item, &discard_before).await;
                }
                break;
            }
        }
    }
    debug!(pair = %pair, "Lane closed");
    drop(done);
}

async fn handle(engine: &ExecutionEngine, pair: &PairKey, item: LaneItem, discard_before: &AtomicU64) {
    match item.command {
        Command::Advance { event, respond } => {
            if item.seq < discard_before.load(Ordering::SeqCst) {
                debug!(pair = %pair, event_id = event.id(), "Discarding event queued before stop");
                let _ = respond.send(Err(ChatflowError::Cancelled));
                return;
            }
            let result = engine.advance(&pair.contact_id, &pair.flow_id, event).await;
            let _ = respond.send(result);
        }
        Command::Stop { respond } => {
            let _ = respond.send(engine.stop(&pair.flow_id, &pair.contact_id).await);
        }
    }
}
