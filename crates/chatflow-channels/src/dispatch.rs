use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chatflow_core::error::Result;
use chatflow_core::traits::ChannelAdapter;
use chatflow_core::types::{ContactId, FlowId, InboundEvent, InboundMessage, PairKey};
use chatflow_engine::{AdvanceResult, Disposition, LaneRegistry};

use crate::sink::AdapterSink;

/// Dispatches inbound channel messages to the engine through per-pair lanes
/// and arms the wake-up timers runs ask for.
///
/// A message goes to the contact's live run on that channel when there is
/// one, otherwise to the active flow bound to the channel. One contact's
/// messages are handled one at a time in arrival order, and each is resolved
/// only after the previous one was applied, so a message sent right after a
/// flow switch lands in the new flow. Outgoing messages reach adapters
/// through the [`AdapterSink`] the engine was built with.
pub struct ChannelDispatcher {
    router: Router,
    sink: Arc<AdapterSink>,
    cancel: CancellationToken,
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
}

#[derive(Clone)]
struct Router {
    lanes: Arc<LaneRegistry>,
    /// Generation of the newest timer per pair; older timers fire into nothing.
    timers: Arc<Mutex<HashMap<PairKey, u64>>>,
    generations: Arc<AtomicU64>,
    /// Per contact, the ticket of the newest queued message and the signal
    /// that fires when it is done.
    tails: Arc<Mutex<HashMap<ContactId, (u64, oneshot::Receiver<()>)>>>,
    cancel: CancellationToken,
}

impl ChannelDispatcher {
    pub fn new(lanes: Arc<LaneRegistry>, sink: Arc<AdapterSink>, cancel: CancellationToken) -> Self {
        Self {
            router: Router {
                lanes,
                timers: Arc::new(Mutex::new(HashMap::new())),
                generations: Arc::new(AtomicU64::new(0)),
                tails: Arc::new(Mutex::new(HashMap::new())),
                cancel: cancel.child_token(),
            },
            sink,
            cancel,
            adapters: HashMap::new(),
        }
    }

    /// Add a channel adapter. It also becomes the delivery target for its channel.
    pub fn add_adapter(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.sink.register(adapter.clone());
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    /// Which flow an inbound message belongs to, if any.
    pub async fn resolve(&self, message: &InboundMessage) -> Result<Option<FlowId>> {
        self.router.resolve(message).await
    }

    /// Route one message and wait for the engine's result.
    /// `Ok(None)` means no flow serves the message's channel.
    pub async fn dispatch(&self, message: InboundMessage) -> Result<Option<AdvanceResult>> {
        self.router.sequence(message).await
    }

    /// Start all adapters and dispatch incoming messages until cancelled or
    /// every adapter has closed its sender. In-flight messages finish first.
    pub async fn run(self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<InboundMessage>(256);

        for (name, adapter) in &self.adapters {
            info!(channel = %name, "Starting channel adapter");
            if let Err(e) = adapter.start(tx.clone()).await {
                error!(channel = %name, error = %e, "Failed to start adapter");
            }
        }

        // Drop our copy so the channel can close when adapters stop
        drop(tx);

        info!(count = self.adapters.len(), "Channel dispatcher running");

        let mut inflight = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Channel dispatcher shutting down");
                    break;
                }
                Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
                message = rx.recv() => {
                    let Some(message) = message else {
                        info!("All channel senders dropped, shutting down");
                        break;
                    };
                    // Take the contact's place in line here, in arrival order;
                    // the message is routed off the loop once its turn comes.
                    let contact = message.contact_id.clone();
                    let routed = self.router.sequence(message);
                    inflight.spawn(async move {
                        if let Err(e) = routed.await {
                            warn!(contact = %contact, error = %e, "Inbound message failed");
                        }
                    });
                }
            }
        }

        while inflight.join_next().await.is_some() {}
        self.router.cancel.cancel();

        for (name, adapter) in &self.adapters {
            info!(channel = %name, "Stopping channel adapter");
            if let Err(e) = adapter.stop().await {
                error!(channel = %name, error = %e, "Failed to stop adapter");
            }
        }

        Ok(())
    }
}

impl Router {
    async fn resolve(&self, message: &InboundMessage) -> Result<Option<FlowId>> {
        let engine = self.lanes.engine();
        let live = engine.states().live_for_contact(&message.contact_id).await?;
        if let Some(state) = live
            .into_iter()
            .filter(|s| s.channel_id == message.channel_id)
            .max_by_key(|s| s.updated_at)
        {
            return Ok(Some(state.flow_id));
        }
        let active = engine.flows().active_for_channel(&message.channel_id).await?;
        Ok(active.map(|flow| flow.id))
    }

    /// Queue a message behind the contact's earlier ones. The returned future
    /// waits for its turn, then resolves the flow and runs the message.
    fn sequence(
        &self,
        message: InboundMessage,
    ) -> impl Future<Output = Result<Option<AdvanceResult>>> + Send + 'static {
        let router = self.clone();
        let contact = message.contact_id.clone();
        let ticket = self.generations.fetch_add(1, Ordering::Relaxed);
        let (done, turn) = oneshot::channel::<()>();
        let previous = {
            let mut tails = self.tails.lock().unwrap_or_else(|e| e.into_inner());
            tails.insert(contact.clone(), (ticket, turn)).map(|(_, rx)| rx)
        };

        async move {
            if let Some(previous) = previous {
                // Resolves with an error when the previous message drops its sender
                let _ = previous.await;
            }
            let outcome = router.route(message).await;
            {
                let mut tails = router.tails.lock().unwrap_or_else(|e| e.into_inner());
                if tails.get(&contact).map(|(t, _)| *t) == Some(ticket) {
                    tails.remove(&contact);
                }
            }
            drop(done);
            outcome
        }
    }

    async fn route(&self, message: InboundMessage) -> Result<Option<AdvanceResult>> {
        let Some(flow_id) = self.resolve(&message).await? else {
            info!(
                channel = %message.channel_id,
                contact = %message.contact_id,
                "No flow serves this channel, dropping message"
            );
            return Ok(None);
        };
        let contact = message.contact_id.clone();
        let channel_id = message.channel_id.clone();
        debug!(flow_id = %flow_id, contact = %contact, "Dispatching inbound message");
        let result = self
            .lanes
            .submit(&contact, &flow_id, InboundEvent::Message(message))
            .await?;
        self.after(&contact, &channel_id, &result);
        Ok(Some(result))
    }

    /// Arm or disarm the pair's wake-up timer after an applied event.
    fn after(&self, contact: &ContactId, channel_id: &str, result: &AdvanceResult) {
        if result.disposition != Disposition::Applied {
            return;
        }
        let pair = PairKey::new(result.flow_id.clone(), contact.clone());
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(wake) = result.wake.clone() else {
            timers.remove(&pair);
            return;
        };
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        timers.insert(pair.clone(), generation);
        drop(timers);

        let channel_id = channel_id.to_string();
        debug!(pair = %pair, node_id = %wake.node_id, after_secs = wake.after.as_secs(), "Wake-up armed");

        let router = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = router.cancel.cancelled() => return,
                _ = tokio::time::sleep(wake.after) => {}
            }
            if !router.is_current(&pair, generation) {
                return;
            }
            let event = InboundEvent::Timer {
                id: uuid::Uuid::new_v4().to_string(),
                channel_id: channel_id.clone(),
                node_id: wake.node_id,
            };
            match router.lanes.submit(&pair.contact_id, &pair.flow_id, event).await {
                Ok(result) => router.after(&pair.contact_id, &channel_id, &result),
                Err(e) => warn!(pair = %pair, error = %e, "Wake-up failed"),
            }
        });
    }

    fn is_current(&self, pair: &PairKey, generation: u64) -> bool {
        let timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        timers.get(pair) == Some(&generation)
    }
}
