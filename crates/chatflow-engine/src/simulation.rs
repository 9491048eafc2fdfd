use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, Stream};
use serde::Serialize;
use tracing::debug;

use chatflow_core::config::SimulationConfig;
use chatflow_core::error::Result;
use chatflow_core::event::EventBus;
use chatflow_core::flow::{FlowDefinition, NodeKind};
use chatflow_core::state::RunStatus;
use chatflow_core::traits::*;
use chatflow_core::types::{
    ContactId, FlowId, HandoffRecord, InboundEvent, InboundMessage, OutgoingMessage, PairKey, TagAction,
};
use chatflow_store::InMemoryStore;

use crate::effects::Effect;
use crate::engine::{EngineOptions, ExecutionEngine};
use crate::graph::ensure_valid;
use crate::nodes::Services;

const CONTACT: &str = "simulator";
const CHANNEL: &str = "simulation";

/// One line of a simulated conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "entry", rename_all = "camelCase")]
pub enum TranscriptEntry {
    /// What the simulated contact said.
    Inbound { text: String },
    Bot(OutgoingMessage),
    Handoff(HandoffRecord),
    #[serde(rename_all = "camelCase")]
    Integration {
        node_id: String,
        kind: String,
        target: String,
        succeeded: bool,
    },
    Finished {
        status: RunStatus,
        reason: Option<String>,
    },
}

/// Preview a flow without touching real state or external systems.
///
/// The runner is a reusable recipe; each `start` yields a fresh, finite
/// `Simulation` backed by its own in-memory store. Waiting nodes get the next
/// scripted reply, or a deterministic default: the first menu option, a
/// sample value for questions, "ok" otherwise.
#[derive(Clone)]
pub struct SimulationRunner {
    entry: FlowId,
    flows: Vec<FlowDefinition>,
    script: Vec<String>,
    trigger: String,
    max_steps: usize,
    services: Services,
    options: EngineOptions,
}

impl SimulationRunner {
    pub fn new(flow: FlowDefinition) -> Self {
        Self {
            entry: flow.id.clone(),
            flows: vec![flow],
            script: vec![],
            trigger: "hi".into(),
            max_steps: SimulationConfig::default().max_steps,
            services: simulated_services(),
            options: EngineOptions::default(),
        }
    }

    /// Make another flow available, e.g. a `switchFlow` target.
    pub fn with_flow(mut self, flow: FlowDefinition) -> Self {
        self.flows.push(flow);
        self
    }

    /// Replies used in order at each suspension before falling back to defaults.
    pub fn with_script<I, S>(mut self, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script = replies.into_iter().map(Into::into).collect();
        self
    }

    /// The message that starts the run.
    pub fn with_trigger(mut self, text: impl Into<String>) -> Self {
        self.trigger = text.into();
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// Replace the simulated collaborators, e.g. with real adapters.
    pub fn with_services(mut self, services: Services) -> Self {
        self.services = services;
        self
    }

    pub fn with_engine_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate the entry flow and set up a fresh simulation.
    pub fn start(&self) -> Result<Simulation> {
        let store = Arc::new(InMemoryStore::new());
        let mut definitions = HashMap::new();
        for flow in &self.flows {
            let mut flow = flow.clone();
            flow.version = flow.version.max(1);
            if flow.id == self.entry {
                ensure_valid(&flow)?;
            }
            store.put_flow(flow.clone())?;
            definitions.insert(flow.id.clone(), flow);
        }

        let options = EngineOptions {
            require_active: false,
            ..self.options.clone()
        };
        let engine = ExecutionEngine::new(
            store.clone(),
            store.clone(),
            self.services.clone(),
            Arc::new(NullSink),
            Arc::new(EventBus::default()),
            options,
        );

        Ok(Simulation {
            engine,
            store,
            definitions,
            contact: ContactId::from_str(CONTACT),
            flow_id: self.entry.clone(),
            script: self.script.iter().cloned().collect(),
            next_input: Some(self.trigger.clone()),
            waiting_at: None,
            pending: VecDeque::new(),
            emitted: 0,
            max_steps: self.max_steps,
            last_status: RunStatus::Running,
            finished: false,
            counter: 0,
        })
    }
}

/// A running preview. Pull entries with `next_entry` or `into_stream`.
pub struct Simulation {
    engine: ExecutionEngine,
    store: Arc<InMemoryStore>,
    definitions: HashMap<FlowId, FlowDefinition>,
    contact: ContactId,
    /// Flow the conversation is in; changes after a switch.
    flow_id: FlowId,
    script: VecDeque<String>,
    next_input: Option<String>,
    waiting_at: Option<String>,
    pending: VecDeque<TranscriptEntry>,
    emitted: usize,
    max_steps: usize,
    last_status: RunStatus,
    finished: bool,
    counter: u64,
}

impl Simulation {
    /// Next transcript entry, or `None` once the run has finished.
    pub async fn next_entry(&mut self) -> Result<Option<TranscriptEntry>> {
        loop {
            if self.finished && self.pending.is_empty() {
                return Ok(None);
            }
            if self.emitted >= self.max_steps {
                self.pending.clear();
                self.finished = true;
                self.emitted += 1;
                return Ok(Some(TranscriptEntry::Finished {
                    status: self.last_status,
                    reason: Some("step limit reached".into()),
                }));
            }
            if let Some(entry) = self.pending.pop_front() {
                self.emitted += 1;
                return Ok(Some(entry));
            }
            self.step().await?;
        }
    }

    /// Drain the whole transcript.
    pub async fn collect(mut self) -> Result<Vec<TranscriptEntry>> {
        let mut entries = vec![];
        while let Some(entry) = self.next_entry().await? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Lazy stream of entries. An error ends the stream after it is yielded.
    pub fn into_stream(self) -> impl Stream<Item = Result<TranscriptEntry>> {
        stream::unfold(self, |mut sim| async move {
            match sim.next_entry().await {
                Ok(Some(entry)) => Some((Ok(entry), sim)),
                Ok(None) => None,
                Err(e) => {
                    sim.finished = true;
                    sim.pending.clear();
                    Some((Err(e), sim))
                }
            }
        })
    }

    async fn step(&mut self) -> Result<()> {
        let body = match self.next_input.take() {
            Some(trigger) => trigger,
            None => self.reply(),
        };
        self.pending.push_back(TranscriptEntry::Inbound { text: body.clone() });

        self.counter += 1;
        let mut message = InboundMessage::text(&self.contact, CHANNEL, body);
        message.id = format!("sim-{}", self.counter);
        let result = self
            .engine
            .advance(&self.contact, &self.flow_id, InboundEvent::Message(message))
            .await?;

        self.flow_id = result.flow_id.clone();
        for effect in result.effects {
            self.pending.push_back(match effect {
                Effect::Message(m) => TranscriptEntry::Bot(m),
                Effect::Handoff(h) => TranscriptEntry::Handoff(h),
                Effect::IntegrationCall {
                    node_id,
                    kind,
                    target,
                    succeeded,
                    ..
                } => TranscriptEntry::Integration {
                    node_id,
                    kind,
                    target,
                    succeeded,
                },
            });
        }

        let status = result.status.unwrap_or(RunStatus::Error);
        self.last_status = status;
        if status.is_closed() {
            let pair = PairKey::new(self.flow_id.clone(), self.contact.clone());
            let reason = self
                .store
                .last_archived(&pair)
                .await?
                .and_then(|s| s.error_reason);
            debug!(flow_id = %self.flow_id, status = %status, "Simulation finished");
            self.pending.push_back(TranscriptEntry::Finished { status, reason });
            self.finished = true;
        } else {
            self.waiting_at = result.node_id;
        }
        Ok(())
    }

    /// Scripted reply, else a default that fits the waiting node.
    fn reply(&mut self) -> String {
        if let Some(scripted) = self.script.pop_front() {
            return scripted;
        }
        let node = self
            .waiting_at
            .as_deref()
            .and_then(|id| self.definitions.get(&self.flow_id)?.node(id));
        match node.map(|n| &n.kind) {
            Some(NodeKind::Menu(p)) => p
                .options
                .first()
                .map(|o| o.trigger().to_string())
                .unwrap_or_else(|| "ok".into()),
            Some(NodeKind::Question(p)) => p.input_type.sample(),
            _ => "ok".into(),
        }
    }
}

/// Collaborators that answer without leaving the process.
pub fn simulated_services() -> Services {
    Services {
        http: Arc::new(SimulatedHttp),
        completion: Some(Arc::new(SimulatedCompletion)),
        sub_bot: Arc::new(SimulatedSubBot),
        contacts: Arc::new(SimulatedContacts),
    }
}

struct SimulatedHttp;

impl HttpClient for SimulatedHttp {
    fn send(&self, _request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
        Box::pin(async {
            Ok(HttpResponse {
                status: 200,
                body: "{}".into(),
            })
        })
    }
}

struct SimulatedCompletion;

impl CompletionClient for SimulatedCompletion {
    fn complete(&self, _request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>> {
        Box::pin(async {
            Ok(CompletionResponse {
                text: "[simulated response]".into(),
            })
        })
    }
}

struct SimulatedSubBot;

impl SubBotClient for SimulatedSubBot {
    fn delegate(&self, _request: SubBotRequest) -> BoxFuture<'_, Result<SubBotReply>> {
        Box::pin(async {
            Ok(SubBotReply {
                done: true,
                ..SubBotReply::default()
            })
        })
    }
}

struct SimulatedContacts;

impl ContactDirectory for SimulatedContacts {
    fn apply_tags(&self, _contact: &ContactId, _action: TagAction, _tags: &[String]) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

struct NullSink;

impl EffectSink for NullSink {
    fn deliver(&self, _message: &OutgoingMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn handoff(&self, _record: &HandoffRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
