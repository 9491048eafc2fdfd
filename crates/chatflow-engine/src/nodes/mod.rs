//! Node executor table: one handler per node kind.
//!
//! `enter` runs when the engine arrives at a node. `resume` runs when an
//! inbound event reaches a node the run is waiting on. Both are exhaustive
//! over [`NodeKind`], so a new kind does not compile until it is handled.

mod conditional;
mod content;
mod handoff;
mod http;
mod input;
mod language_model;
mod subbot;
mod tag;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::warn;

use chatflow_core::error::{ChatflowError, Result};
use chatflow_core::event::EventBus;
use chatflow_core::flow::{Node, NodeKind, OutputKey, SwitchFlowProps};
use chatflow_core::render::{render, RenderScope};
use chatflow_core::state::{ExecutionState, Speaker};
use chatflow_core::traits::{CompletionClient, ContactDirectory, HttpClient, SubBotClient};
use chatflow_core::types::{FlowEvent, HandoffTarget, InboundEvent, MessageType, OutgoingMessage};

use crate::effects::{Effect, Effects};
use crate::engine::EngineOptions;

pub use conditional::first_match;
pub use http::extract_path;
pub use input::match_option;

/// External collaborators the node handlers call.
#[derive(Clone)]
pub struct Services {
    pub http: Arc<dyn HttpClient>,
    /// Language-model nodes fail (and route to `error`) when absent.
    pub completion: Option<Arc<dyn CompletionClient>>,
    pub sub_bot: Arc<dyn SubBotClient>,
    pub contacts: Arc<dyn ContactDirectory>,
}

/// What a handler decided.
#[derive(Debug)]
pub enum NodeResult {
    /// Leave through this output.
    Next(OutputKey),
    /// Stop and wait for the next inbound event.
    Suspend,
    /// Terminal `end`.
    Complete,
    /// Terminal handoff; the record is already in the effect buffer.
    Handoff(HandoffTarget),
    Switch(SwitchFlowProps),
    /// Integration failure, routed through `error` or `timeout`.
    Failed { key: OutputKey, error: ChatflowError },
    /// The event means nothing to this node. Nothing is committed.
    Ignored,
}

impl NodeResult {
    fn failed(error: ChatflowError) -> Self {
        let key = if error.is_timeout() {
            OutputKey::Timeout
        } else {
            OutputKey::Error
        };
        Self::Failed { key, error }
    }
}

/// Everything a handler may read or touch while it runs.
pub(crate) struct NodeContext<'a> {
    pub state: &'a mut ExecutionState,
    pub node: &'a Node,
    pub event: &'a InboundEvent,
    pub services: &'a Services,
    pub options: &'a EngineOptions,
    pub bus: &'a EventBus,
    pub effects: &'a mut Effects,
}

impl NodeContext<'_> {
    pub fn message_body(&self) -> Option<&str> {
        self.event.message_body()
    }

    /// Render a template against the run. Unresolved tokens become empty
    /// strings and are reported as render warnings.
    pub fn render(&self, template: &str) -> String {
        let scope = RenderScope::for_state(self.state, self.message_body(), Utc::now());
        let rendered = render(template, &scope);
        for token in rendered.unresolved {
            warn!(
                flow_id = %self.state.flow_id,
                node_id = %self.node.id,
                token = %token,
                "Unresolved template token"
            );
            self.bus.publish(FlowEvent::RenderWarning {
                pair: self.state.pair(),
                node_id: self.node.id.clone(),
                token,
            });
        }
        rendered.text
    }

    /// Resolve a variable or system value by name.
    pub fn lookup(&self, name: &str) -> Option<String> {
        RenderScope::for_state(self.state, self.message_body(), Utc::now()).lookup(name)
    }

    pub fn emit(&mut self, message: OutgoingMessage) {
        if matches!(message.message_type, MessageType::Text | MessageType::Options | MessageType::Audio) {
            let window = self.options.conversation_window;
            self.state.record_turn(Speaker::Bot, &message.content, window);
        }
        self.effects.push(Effect::Message(message));
    }

    pub fn say(&mut self, text: String) {
        let message = OutgoingMessage::text(&self.state.contact_id, &self.state.channel_id, text);
        self.emit(message);
    }

    pub fn timeout(&self, secs: Option<u64>) -> Duration {
        secs.map(Duration::from_secs).unwrap_or(self.options.default_timeout)
    }

    pub fn integration_called(&mut self, target: &str, succeeded: bool, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let kind = self.node.kind.name();
        self.bus.publish(FlowEvent::IntegrationCalled {
            pair: self.state.pair(),
            node_id: self.node.id.clone(),
            kind,
            succeeded,
            elapsed_ms,
        });
        self.effects.push(Effect::IntegrationCall {
            node_id: self.node.id.clone(),
            kind: kind.to_string(),
            target: target.to_string(),
            succeeded,
            elapsed_ms,
        });
    }
}

/// Run a node on arrival.
pub(crate) async fn enter(ctx: &mut NodeContext<'_>) -> NodeResult {
    let node = ctx.node;
    match &node.kind {
        NodeKind::Start => NodeResult::Next(OutputKey::Default),
        NodeKind::Message(p) => content::message(ctx, p),
        NodeKind::Menu(p) => input::present_menu(ctx, p, &p.prompt),
        NodeKind::Question(p) => input::ask(ctx, &p.prompt),
        NodeKind::Conditional(p) => conditional::evaluate(ctx, p),
        NodeKind::Webhook(p) => http::call(ctx, p, true).await,
        NodeKind::ApiRequest(p) => http::call(ctx, p, false).await,
        NodeKind::LanguageModel(p) => language_model::complete(ctx, p).await,
        NodeKind::SubBotDelegate(p) => subbot::delegate(ctx, p).await,
        NodeKind::QueueHandoff(p) => {
            handoff::hand_off(ctx, HandoffTarget::Queue(p.queue.clone()), p.message.as_deref())
        }
        NodeKind::AttendantHandoff(p) => handoff::hand_off(
            ctx,
            HandoffTarget::Attendant(p.attendant.clone()),
            p.message.as_deref(),
        ),
        NodeKind::TagOp(p) => tag::apply(ctx, p).await,
        NodeKind::SwitchFlow(p) => NodeResult::Switch(p.clone()),
        NodeKind::End => NodeResult::Complete,
    }
}

/// Feed an inbound event to the node the run is waiting on.
pub(crate) async fn resume(ctx: &mut NodeContext<'_>) -> NodeResult {
    let node = ctx.node;
    let event = ctx.event;
    match (&node.kind, event) {
        (NodeKind::Menu(p), InboundEvent::Message(m)) => input::choose(p, &m.body),
        (NodeKind::Question(p), InboundEvent::Message(m)) => input::answer(ctx, p, &m.body),
        (NodeKind::SubBotDelegate(p), _) => subbot::resume(ctx, p).await,
        (
            NodeKind::Start
            | NodeKind::Message(_)
            | NodeKind::Menu(_)
            | NodeKind::Question(_)
            | NodeKind::Conditional(_)
            | NodeKind::Webhook(_)
            | NodeKind::ApiRequest(_)
            | NodeKind::LanguageModel(_)
            | NodeKind::QueueHandoff(_)
            | NodeKind::AttendantHandoff(_)
            | NodeKind::TagOp(_)
            | NodeKind::SwitchFlow(_)
            | NodeKind::End,
            _,
        ) => NodeResult::Ignored,
    }
}

/// Ask again after an input mismatch with no edge to follow.
pub(crate) fn retry(ctx: &mut NodeContext<'_>) {
    let node = ctx.node;
    match &node.kind {
        NodeKind::Menu(p) => {
            let prompt = p.retry_prompt.as_deref().unwrap_or(&p.prompt);
            input::present_menu(ctx, p, prompt);
        }
        NodeKind::Question(p) => {
            input::ask(ctx, p.retry_prompt.as_deref().unwrap_or(&p.prompt));
        }
        _ => {}
    }
}

/// Call an integration with a per-attempt timeout, retrying failures.
/// `retries` is the number of extra attempts after the first.
pub(crate) async fn call_with_retries<T, F, Fut>(
    target: &str,
    retries: u32,
    timeout: Duration,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = retries.saturating_add(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        let outcome = match tokio::time::timeout(timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(ChatflowError::IntegrationTimeout {
                target: target.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt < attempts {
                    warn!(integration = %target, attempt, error = %e, "Integration call failed, retrying");
                }
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| ChatflowError::Integration {
        target: target.to_string(),
        message: "no attempt made".into(),
    }))
}
