use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use chatflow_core::config::{EngineConfig, HooksConfig};
use chatflow_core::error::{ChatflowError, Result, StateError};
use chatflow_core::event::EventBus;
use chatflow_core::flow::{FlowDefinition, Node, NodeKind, OutputKey, SwitchFlowProps};
use chatflow_core::hooks::{self, HookPoint};
use chatflow_core::state::{ExecutionState, RunStatus, Speaker};
use chatflow_core::traits::{EffectSink, FlowStore, StateStore};
use chatflow_core::types::{
    ContactId, FlowEvent, FlowId, HandoffRecord, InboundEvent, OutgoingMessage, PairKey,
};

use crate::effects::{Effect, Effects};
use crate::graph::{FlowGraph, NodeIdx};
use crate::nodes::{self, NodeContext, NodeResult, Services};
use crate::router::{self, Route};

/// Engine tunables, usually built from `[engine]` config.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub max_steps: usize,
    pub fallback_message: String,
    pub conversation_window: usize,
    pub processed_event_window: usize,
    pub default_timeout: Duration,
    /// New runs only start on the active version. Simulations turn this off
    /// to run the latest draft.
    pub require_active: bool,
}

impl EngineOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_steps: config.max_steps_per_advance,
            fallback_message: config.fallback_message.clone(),
            conversation_window: config.conversation_window,
            processed_event_window: config.processed_event_window,
            default_timeout: Duration::from_secs(config.default_timeout_secs),
            require_active: true,
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// How an inbound event was treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Executed and committed.
    Applied,
    /// Already applied earlier; nothing ran.
    Duplicate,
    /// Meaningless for the run's current node (or no run); nothing committed.
    Ignored,
}

/// A timer the caller should arm: deliver `InboundEvent::Timer` for `node_id` after `after`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeUp {
    pub node_id: String,
    pub after: Duration,
}

/// Outcome of one `advance`.
#[derive(Debug, Clone)]
pub struct AdvanceResult {
    /// Everything the advance did, in order.
    pub effects: Vec<Effect>,
    /// Status of the run the conversation is in; `None` when there is no run.
    pub status: Option<RunStatus>,
    /// Flow the conversation is in after the advance (differs after a switch).
    pub flow_id: FlowId,
    pub node_id: Option<String>,
    pub disposition: Disposition,
    pub wake: Option<WakeUp>,
}

impl AdvanceResult {
    fn untouched(state: Option<&ExecutionState>, flow_id: &FlowId, disposition: Disposition) -> Self {
        Self {
            effects: vec![],
            status: state.map(|s| s.status),
            flow_id: state.map(|s| s.flow_id.clone()).unwrap_or_else(|| flow_id.clone()),
            node_id: state.map(|s| s.current_node_id.clone()),
            disposition,
            wake: None,
        }
    }

    /// Messages for the contact.
    pub fn outgoing(&self) -> Vec<&OutgoingMessage> {
        self.effects
            .iter()
            .filter_map(|e| match e {
                Effect::Message(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn handoffs(&self) -> Vec<&HandoffRecord> {
        self.effects
            .iter()
            .filter_map(|e| match e {
                Effect::Handoff(h) => Some(h),
                _ => None,
            })
            .collect()
    }

    /// Message contents, for logs and tests.
    pub fn texts(&self) -> Vec<&str> {
        self.outgoing().into_iter().map(|m| m.content.as_str()).collect()
    }
}

struct Run {
    state: ExecutionState,
    graph: Arc<FlowGraph>,
}

/// Scratch space for one advance.
#[derive(Default)]
struct Pass {
    effects: Effects,
    /// Runs closed by a switch, archived before the current one is committed.
    closed: Vec<ExecutionState>,
    steps: usize,
    /// Lifecycle events held until the commit succeeds.
    after_commit: Vec<FlowEvent>,
    hooks: Vec<(HookPoint, ExecutionState, Option<String>)>,
}

enum Failure {
    State(StateError),
    Integration(ChatflowError),
}

enum Settled {
    Done,
    Ignored,
}

/// Interpreter for flow graphs.
///
/// `advance` applies one inbound event to one (flow, contact) pair: it loads
/// or starts the run, executes nodes until one suspends or the run closes,
/// commits the new state with a revision check and only then hands messages
/// and handoffs to the effect sink. Callers must serialize calls per pair
/// (see `LaneRegistry`).
pub struct ExecutionEngine {
    flows: Arc<dyn FlowStore>,
    states: Arc<dyn StateStore>,
    services: Services,
    sink: Arc<dyn EffectSink>,
    bus: Arc<EventBus>,
    options: EngineOptions,
    hooks: Option<HooksConfig>,
    graphs: Mutex<HashMap<(FlowId, u32), Arc<FlowGraph>>>,
}

impl ExecutionEngine {
    pub fn new(
        flows: Arc<dyn FlowStore>,
        states: Arc<dyn StateStore>,
        services: Services,
        sink: Arc<dyn EffectSink>,
        bus: Arc<EventBus>,
        options: EngineOptions,
    ) -> Self {
        Self {
            flows,
            states,
            services,
            sink,
            bus,
            options,
            hooks: None,
            graphs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_hooks(mut self, hooks: Option<HooksConfig>) -> Self {
        self.hooks = hooks.filter(|h| !h.is_empty());
        self
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn flows(&self) -> &Arc<dyn FlowStore> {
        &self.flows
    }

    pub fn states(&self) -> &Arc<dyn StateStore> {
        &self.states
    }

    /// Apply one inbound event to the (flow, contact) pair.
    pub async fn advance(
        &self,
        contact: &ContactId,
        flow_id: &FlowId,
        event: InboundEvent,
    ) -> Result<AdvanceResult> {
        let pair = PairKey::new(flow_id.clone(), contact.clone());
        let mut pass = Pass::default();

        let mut run = match self.load_live(&pair).await? {
            Some(state) => {
                if state.has_applied(event.id()) {
                    debug!(pair = %pair, event_id = event.id(), "Event already applied");
                    return Ok(AdvanceResult::untouched(Some(&state), flow_id, Disposition::Duplicate));
                }
                match self.pinned_graph(&state).await {
                    Ok(graph) => Run { state, graph },
                    Err(ChatflowError::State(e)) => return self.abandon(state, e, &event).await,
                    Err(e) => return Err(e),
                }
            }
            None => {
                if let Some(last) = self.states.last_archived(&pair).await? {
                    if last.has_applied(event.id()) {
                        debug!(pair = %pair, event_id = event.id(), "Event already applied to a closed run");
                        return Ok(AdvanceResult::untouched(Some(&last), flow_id, Disposition::Duplicate));
                    }
                }
                if !matches!(event, InboundEvent::Message(_)) {
                    debug!(pair = %pair, kind = event.kind(), "No live run, ignoring event");
                    return Ok(AdvanceResult::untouched(None, flow_id, Disposition::Ignored));
                }
                let graph = self.entry_graph(flow_id).await?;
                self.start_run(graph, contact, event.channel_id(), &mut pass)
            }
        };

        if let InboundEvent::Message(m) = &event {
            run.state
                .record_turn(Speaker::Contact, &m.body, self.options.conversation_window);
        }

        let resuming = run.state.status == RunStatus::WaitingInput;
        if let Settled::Ignored = self.execute(&mut run, &event, resuming, &mut pass).await? {
            debug!(pair = %pair, kind = event.kind(), node_id = %run.state.current_node_id, "Event ignored by waiting node");
            return Ok(AdvanceResult::untouched(Some(&run.state), flow_id, Disposition::Ignored));
        }

        self.commit(&mut run, &event, &mut pass).await?;
        Ok(self.finish(run, pass).await)
    }

    /// Force-close the live run of a pair as `error` with reason `cancelled`.
    /// Returns false when there was no live run.
    pub async fn stop(&self, flow_id: &FlowId, contact: &ContactId) -> Result<bool> {
        let pair = PairKey::new(flow_id.clone(), contact.clone());
        let mut state = match self.states.load_state(&pair).await {
            Ok(Some(state)) => state,
            Ok(None) => return Ok(false),
            Err(ChatflowError::State(e)) => {
                warn!(pair = %pair, error = %e, "Dropping unreadable run state on stop");
                return self.states.delete_state(&pair).await;
            }
            Err(e) => return Err(e),
        };

        state.close(RunStatus::Error, Some("cancelled".into()));
        state.revision += 1;
        self.states.archive_state(&state).await?;

        info!(pair = %pair, node_id = %state.current_node_id, "Run cancelled");
        self.bus.publish(FlowEvent::RunFailed {
            pair,
            node_id: Some(state.current_node_id.clone()),
            reason: "cancelled".into(),
            fatal_state: false,
        });
        hooks::fire(self.hooks.as_ref(), HookPoint::RunError, &state, Some("cancelled"));
        Ok(true)
    }

    async fn load_live(&self, pair: &PairKey) -> Result<Option<ExecutionState>> {
        match self.states.load_state(pair).await {
            Ok(Some(state)) if state.status.is_closed() => {
                warn!(pair = %pair, status = %state.status, "Closed run left in live slot, removing");
                self.states.delete_state(pair).await?;
                Ok(None)
            }
            Ok(state) => Ok(state),
            Err(ChatflowError::State(e)) => {
                error!(pair = %pair, error = %e, "Discarding unreadable run state");
                self.states.delete_state(pair).await?;
                self.bus.publish(FlowEvent::RunFailed {
                    pair: pair.clone(),
                    node_id: None,
                    reason: e.to_string(),
                    fatal_state: true,
                });
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Close a run whose flow version can no longer be executed.
    async fn abandon(
        &self,
        mut state: ExecutionState,
        cause: StateError,
        event: &InboundEvent,
    ) -> Result<AdvanceResult> {
        let reason = cause.to_string();
        error!(
            flow_id = %state.flow_id,
            contact = %state.contact_id,
            node_id = %state.current_node_id,
            error = %reason,
            "Run failed with state error"
        );
        state.close(RunStatus::Error, Some(reason.clone()));
        state.mark_applied(event.id(), self.options.processed_event_window);
        state.revision += 1;
        self.states.archive_state(&state).await?;

        self.bus.publish(FlowEvent::RunFailed {
            pair: state.pair(),
            node_id: Some(state.current_node_id.clone()),
            reason: reason.clone(),
            fatal_state: true,
        });
        hooks::fire(self.hooks.as_ref(), HookPoint::RunError, &state, Some(&reason));
        Ok(AdvanceResult {
            effects: vec![],
            status: Some(state.status),
            flow_id: state.flow_id.clone(),
            node_id: Some(state.current_node_id.clone()),
            disposition: Disposition::Applied,
            wake: None,
        })
    }

    fn start_run(&self, graph: Arc<FlowGraph>, contact: &ContactId, channel: &str, pass: &mut Pass) -> Run {
        let start_id = graph.node(graph.start()).id.clone();
        let mut state = ExecutionState::new(
            graph.id().clone(),
            graph.version(),
            contact.clone(),
            channel,
            &start_id,
        );
        state.enter(&start_id);

        info!(flow_id = %state.flow_id, version = state.flow_version, contact = %contact, "Run started");
        pass.after_commit.push(FlowEvent::RunStarted {
            pair: state.pair(),
            flow_version: state.flow_version,
        });
        self.queue_hook(pass, HookPoint::RunStart, &state, None);
        Run { state, graph }
    }

    /// Execute nodes until the run suspends or closes.
    async fn execute(
        &self,
        run: &mut Run,
        event: &InboundEvent,
        mut resuming: bool,
        pass: &mut Pass,
    ) -> Result<Settled> {
        loop {
            if pass.steps >= self.options.max_steps {
                let budget = self.options.max_steps;
                self.fail(run, pass, Failure::State(StateError::StepBudgetExceeded(budget)));
                return Ok(Settled::Done);
            }

            let graph = run.graph.clone();
            let Some(idx) = graph.lookup(&run.state.current_node_id) else {
                let missing = run.state.current_node_id.clone();
                self.fail(run, pass, Failure::State(StateError::MissingNode(missing)));
                return Ok(Settled::Done);
            };
            let node = graph.node(idx);
            pass.steps += 1;

            if !resuming {
                debug!(flow_id = %run.state.flow_id, node_id = %node.id, kind = node.kind.name(), "Entering node");
                self.bus.publish(FlowEvent::NodeEntered {
                    pair: run.state.pair(),
                    node_id: node.id.clone(),
                    kind: node.kind.name(),
                });
            }

            let result = {
                let mut ctx = self.context(run, node, event, &mut pass.effects);
                if resuming {
                    nodes::resume(&mut ctx).await
                } else {
                    nodes::enter(&mut ctx).await
                }
            };
            resuming = false;

            match result {
                NodeResult::Ignored => return Ok(Settled::Ignored),
                NodeResult::Suspend => {
                    self.suspend(run, node);
                    return Ok(Settled::Done);
                }
                NodeResult::Next(key) => match router::route(&graph, idx, key) {
                    Route::Next(next) => self.step_to(run, &graph, node, next, key),
                    Route::Retry => {
                        debug!(node_id = %node.id, output = %key, "Input mismatch, asking again");
                        let mut ctx = self.context(run, node, event, &mut pass.effects);
                        nodes::retry(&mut ctx);
                        self.suspend(run, node);
                        return Ok(Settled::Done);
                    }
                    Route::Unrouted if matches!(key, OutputKey::Error | OutputKey::Timeout) => {
                        let error = ChatflowError::Integration {
                            target: node.id.clone(),
                            message: format!("no edge for output '{}'", key),
                        };
                        self.fail(run, pass, Failure::Integration(error));
                        return Ok(Settled::Done);
                    }
                    Route::Unrouted => {
                        let dangling = StateError::DanglingOutput {
                            node: node.id.clone(),
                            key: key.to_string(),
                        };
                        self.fail(run, pass, Failure::State(dangling));
                        return Ok(Settled::Done);
                    }
                },
                NodeResult::Failed { key, error } => match router::route(&graph, idx, key) {
                    Route::Next(next) => {
                        warn!(node_id = %node.id, output = %key, error = %error, "Integration failed, taking failure output");
                        self.step_to(run, &graph, node, next, key);
                    }
                    Route::Retry | Route::Unrouted => {
                        self.fail(run, pass, Failure::Integration(error));
                        return Ok(Settled::Done);
                    }
                },
                NodeResult::Complete => {
                    self.complete(run, pass);
                    return Ok(Settled::Done);
                }
                NodeResult::Handoff(target) => {
                    info!(flow_id = %run.state.flow_id, contact = %run.state.contact_id, target = %target, "Conversation handed off");
                    pass.after_commit.push(FlowEvent::Handoff {
                        pair: run.state.pair(),
                        target: target.clone(),
                    });
                    self.queue_hook(pass, HookPoint::Handoff, &run.state, Some(target.to_string()));
                    self.complete(run, pass);
                    return Ok(Settled::Done);
                }
                NodeResult::Switch(props) => {
                    if !self.switch_flow(run, &props, pass).await? {
                        let missing = StateError::MissingSwitchTarget(props.flow_id.0.clone());
                        self.fail(run, pass, Failure::State(missing));
                        return Ok(Settled::Done);
                    }
                }
            }
        }
    }

    fn context<'a>(
        &'a self,
        run: &'a mut Run,
        node: &'a Node,
        event: &'a InboundEvent,
        effects: &'a mut Effects,
    ) -> NodeContext<'a> {
        NodeContext {
            state: &mut run.state,
            node,
            event,
            services: &self.services,
            options: &self.options,
            bus: &self.bus,
            effects,
        }
    }

    fn step_to(&self, run: &mut Run, graph: &FlowGraph, from: &Node, next: NodeIdx, key: OutputKey) {
        let target = &graph.node(next).id;
        debug!(from = %from.id, output = %key, to = %target, "Following edge");
        run.state.enter(target);
        run.state.status = RunStatus::Running;
    }

    fn suspend(&self, run: &mut Run, node: &Node) {
        run.state.status = RunStatus::WaitingInput;
        debug!(flow_id = %run.state.flow_id, contact = %run.state.contact_id, node_id = %node.id, "Run waiting for input");
        self.bus.publish(FlowEvent::Suspended {
            pair: run.state.pair(),
            node_id: node.id.clone(),
        });
    }

    fn complete(&self, run: &mut Run, pass: &mut Pass) {
        run.state.close(RunStatus::Completed, None);
        info!(flow_id = %run.state.flow_id, contact = %run.state.contact_id, steps = pass.steps, "Run completed");
        pass.after_commit.push(FlowEvent::RunCompleted {
            pair: run.state.pair(),
            steps: pass.steps,
        });
        self.queue_hook(pass, HookPoint::RunComplete, &run.state, None);
    }

    /// Close the run as `error`. Integration failures send the fallback
    /// message once; state errors are incidents.
    fn fail(&self, run: &mut Run, pass: &mut Pass, failure: Failure) {
        let node_id = run.state.current_node_id.clone();
        let (reason, fatal_state) = match failure {
            Failure::State(e) => {
                error!(
                    flow_id = %run.state.flow_id,
                    contact = %run.state.contact_id,
                    node_id = %node_id,
                    error = %e,
                    "Run failed with state error"
                );
                (e.to_string(), true)
            }
            Failure::Integration(e) => {
                warn!(
                    flow_id = %run.state.flow_id,
                    contact = %run.state.contact_id,
                    node_id = %node_id,
                    error = %e,
                    "Integration failed with no failure output, closing run"
                );
                let text = run
                    .graph
                    .definition()
                    .fallback_message
                    .clone()
                    .unwrap_or_else(|| self.options.fallback_message.clone());
                run.state
                    .record_turn(Speaker::Bot, &text, self.options.conversation_window);
                pass.effects.push(Effect::Message(OutgoingMessage::text(
                    &run.state.contact_id,
                    &run.state.channel_id,
                    text,
                )));
                (e.to_string(), false)
            }
        };

        run.state.close(RunStatus::Error, Some(reason.clone()));
        pass.after_commit.push(FlowEvent::RunFailed {
            pair: run.state.pair(),
            node_id: Some(node_id),
            reason: reason.clone(),
            fatal_state,
        });
        self.queue_hook(pass, HookPoint::RunError, &run.state, Some(reason));
    }

    /// Replace the run with a fresh one at the target flow's start.
    /// Returns false when the target has no runnable version.
    async fn switch_flow(&self, run: &mut Run, props: &SwitchFlowProps, pass: &mut Pass) -> Result<bool> {
        let graph = match self.entry_graph(&props.flow_id).await {
            Ok(graph) => graph,
            Err(
                ChatflowError::FlowNotFound(_)
                | ChatflowError::FlowInactive(_)
                | ChatflowError::Validation(_),
            ) => return Ok(false),
            Err(e) => return Err(e),
        };

        let contact = run.state.contact_id.clone();
        let target_pair = PairKey::new(props.flow_id.clone(), contact.clone());
        let already_closed = pass.closed.iter().any(|s| s.pair() == target_pair);
        if target_pair != run.state.pair() && !already_closed {
            match self.states.load_state(&target_pair).await {
                Ok(Some(mut existing)) => {
                    warn!(pair = %target_pair, "Closing existing run superseded by flow switch");
                    existing.close(RunStatus::Error, Some("superseded by flow switch".into()));
                    pass.closed.push(existing);
                }
                Ok(None) => {}
                Err(ChatflowError::State(e)) => {
                    warn!(pair = %target_pair, error = %e, "Dropping unreadable run state before switch");
                    self.states.delete_state(&target_pair).await?;
                }
                Err(e) => return Err(e),
            }
        }

        let start_id = graph.node(graph.start()).id.clone();
        let mut next = ExecutionState::new(
            graph.id().clone(),
            graph.version(),
            contact,
            run.state.channel_id.clone(),
            &start_id,
        );
        if props.carry_variables {
            next.variables = run.state.variables.clone();
        }
        next.conversation = run.state.conversation.clone();
        next.applied_events = run.state.applied_events.clone();
        next.enter(&start_id);

        let mut previous = std::mem::replace(&mut run.state, next);
        previous.close(RunStatus::Completed, None);
        run.graph = graph;

        info!(
            from = %previous.pair(),
            to = %props.flow_id,
            carry_variables = props.carry_variables,
            "Switching flow"
        );
        pass.after_commit.push(FlowEvent::FlowSwitched {
            from: previous.pair(),
            to: props.flow_id.clone(),
        });
        pass.after_commit.push(FlowEvent::RunStarted {
            pair: run.state.pair(),
            flow_version: run.state.flow_version,
        });
        let detail = format!("switched to {}", props.flow_id);
        self.queue_hook(pass, HookPoint::RunComplete, &previous, Some(detail));
        self.queue_hook(pass, HookPoint::RunStart, &run.state, None);
        pass.closed.push(previous);
        Ok(true)
    }

    /// Persist the advance in one store commit: runs closed by a switch are
    /// archived and the current run saved or archived, each behind a
    /// revision check. A failed commit leaves nothing applied, so a
    /// redelivered event runs again.
    async fn commit(&self, run: &mut Run, event: &InboundEvent, pass: &mut Pass) -> Result<()> {
        let window = self.options.processed_event_window;
        for closed in pass.closed.iter_mut() {
            closed.mark_applied(event.id(), window);
            closed.revision += 1;
        }

        let state = &mut run.state;
        state.mark_applied(event.id(), window);
        state.updated_at = Utc::now();
        state.revision += 1;
        if state.status.is_closed() {
            let mut archive = std::mem::take(&mut pass.closed);
            archive.push(state.clone());
            self.states.commit_states(&archive, None).await
        } else {
            self.states.commit_states(&pass.closed, Some(&*state)).await
        }
    }

    /// Publish, fire hooks and deliver effects once the commit stands.
    async fn finish(&self, run: Run, pass: Pass) -> AdvanceResult {
        let Pass {
            effects,
            after_commit,
            hooks: queued,
            ..
        } = pass;

        for event in after_commit {
            self.bus.publish(event);
        }
        for (point, state, detail) in queued {
            hooks::fire(self.hooks.as_ref(), point, &state, detail.as_deref());
        }

        let effects = effects.into_vec();
        self.deliver(&effects).await;

        let wake = self.wake_for(&run);
        AdvanceResult {
            effects,
            status: Some(run.state.status),
            flow_id: run.state.flow_id.clone(),
            node_id: Some(run.state.current_node_id.clone()),
            disposition: Disposition::Applied,
            wake,
        }
    }

    async fn deliver(&self, effects: &[Effect]) {
        for effect in effects {
            let outcome = match effect {
                Effect::Message(message) => self.sink.deliver(message).await,
                Effect::Handoff(record) => self.sink.handoff(record).await,
                Effect::IntegrationCall { .. } => Ok(()),
            };
            if let Err(e) = outcome {
                warn!(error = %e, "Effect delivery failed");
            }
        }
    }

    fn wake_for(&self, run: &Run) -> Option<WakeUp> {
        if run.state.status != RunStatus::WaitingInput {
            return None;
        }
        let node = run.graph.node(run.graph.lookup(&run.state.current_node_id)?);
        match &node.kind {
            NodeKind::SubBotDelegate(p) => p.idle_timeout_secs.map(|secs| WakeUp {
                node_id: node.id.clone(),
                after: Duration::from_secs(secs),
            }),
            _ => None,
        }
    }

    fn queue_hook(&self, pass: &mut Pass, point: HookPoint, state: &ExecutionState, detail: Option<String>) {
        if self.hooks.is_some() {
            pass.hooks.push((point, state.clone(), detail));
        }
    }

    /// Graph for a new run: the active version, or the latest one when
    /// `require_active` is off.
    async fn entry_graph(&self, flow_id: &FlowId) -> Result<Arc<FlowGraph>> {
        let flow = if self.options.require_active {
            match self.flows.active_flow(flow_id).await? {
                Some(flow) => flow,
                None if self.flows.latest_flow(flow_id).await?.is_some() => {
                    return Err(ChatflowError::FlowInactive(flow_id.to_string()));
                }
                None => return Err(ChatflowError::FlowNotFound(flow_id.to_string())),
            }
        } else {
            self.flows
                .latest_flow(flow_id)
                .await?
                .ok_or_else(|| ChatflowError::FlowNotFound(flow_id.to_string()))?
        };
        self.compile(flow)
    }

    /// Graph for the version a run is pinned to.
    async fn pinned_graph(&self, state: &ExecutionState) -> Result<Arc<FlowGraph>> {
        if let Some(graph) = self.cached(&state.flow_id, state.flow_version) {
            return Ok(graph);
        }
        let flow = self
            .flows
            .get_flow(&state.flow_id, state.flow_version)
            .await?
            .ok_or_else(|| StateError::MissingFlowVersion {
                flow_id: state.flow_id.to_string(),
                version: state.flow_version,
            })?;
        self.compile(flow).map_err(|e| match e {
            ChatflowError::Validation(_) => ChatflowError::State(StateError::Corrupted(format!(
                "flow {} version {} no longer validates",
                state.flow_id, state.flow_version
            ))),
            other => other,
        })
    }

    fn cached(&self, flow_id: &FlowId, version: u32) -> Option<Arc<FlowGraph>> {
        let graphs = self.graphs.lock().unwrap_or_else(|e| e.into_inner());
        graphs.get(&(flow_id.clone(), version)).cloned()
    }

    fn compile(&self, flow: FlowDefinition) -> Result<Arc<FlowGraph>> {
        let key = (flow.id.clone(), flow.version);
        if let Some(graph) = self.cached(&key.0, key.1) {
            return Ok(graph);
        }
        let graph = Arc::new(FlowGraph::compile(flow)?);
        let mut graphs = self.graphs.lock().unwrap_or_else(|e| e.into_inner());
        graphs.insert(key, graph.clone());
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatflow_core::flow::{FlowStatus, HttpRequestProps, NodeKind, SubBotProps};
    use chatflow_core::traits::HttpResponse;
    use chatflow_core::types::{HandoffTarget, TagAction, Value};
    use chatflow_core::validation::InputType;
    use chatflow_store::InMemoryStore;
    use chatflow_test_utils::builder::{email_question_flow, greeting_menu_flow};
    use chatflow_test_utils::*;

    struct Harness {
        engine: ExecutionEngine,
        store: Arc<InMemoryStore>,
        sink: RecordingSink,
    }

    fn services() -> Services {
        Services {
            http: Arc::new(MockHttpClient::ok("{}")),
            completion: Some(Arc::new(MockCompletionClient::new("hello"))),
            sub_bot: Arc::new(MockSubBot::new()),
            contacts: Arc::new(RecordingContacts::default()),
        }
    }

    fn harness_with(flows: Vec<FlowDefinition>, services: Services, options: EngineOptions) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        for flow in flows {
            store.put_flow(flow).unwrap();
        }
        let sink = RecordingSink::default();
        let engine = ExecutionEngine::new(
            store.clone(),
            store.clone(),
            services,
            Arc::new(sink.clone()),
            Arc::new(EventBus::default()),
            options,
        );
        Harness { engine, store, sink }
    }

    fn harness(flows: Vec<FlowDefinition>) -> Harness {
        harness_with(flows, services(), EngineOptions::default())
    }

    /// Harness whose state commits can be made to fail.
    fn failing_harness(flows: Vec<FlowDefinition>) -> (Harness, Arc<FailingStates>) {
        let store = Arc::new(InMemoryStore::new());
        for flow in flows {
            store.put_flow(flow).unwrap();
        }
        let states = Arc::new(FailingStates::new(store.clone()));
        let sink = RecordingSink::default();
        let engine = ExecutionEngine::new(
            store.clone(),
            states.clone(),
            services(),
            Arc::new(sink.clone()),
            Arc::new(EventBus::default()),
            EngineOptions::default(),
        );
        (Harness { engine, store, sink }, states)
    }

    fn contact() -> ContactId {
        ContactId::from_str("c1")
    }

    fn flow(id: &str) -> FlowId {
        FlowId::from_str(id)
    }

    impl Harness {
        async fn send(&self, flow_id: &str, event: InboundEvent) -> AdvanceResult {
            self.engine.advance(&contact(), &flow(flow_id), event).await.unwrap()
        }

        async fn say(&self, flow_id: &str, body: &str) -> AdvanceResult {
            self.send(flow_id, text_event("c1", "web", body)).await
        }

        async fn live(&self, flow_id: &str) -> Option<ExecutionState> {
            self.store
                .load_state(&PairKey::new(flow(flow_id), contact()))
                .await
                .unwrap()
        }

        fn last_archived(&self) -> ExecutionState {
            self.store.archived().unwrap().pop().unwrap()
        }
    }

    #[tokio::test]
    async fn test_menu_selection_hands_off() {
        let h = harness(vec![greeting_menu_flow()]);

        let first = h.say("greeting", "hello").await;
        assert_eq!(first.texts(), vec!["Hi", "How can we help?"]);
        assert_eq!(first.outgoing()[1].options, vec!["Support", "Sales"]);
        assert_eq!(first.status, Some(RunStatus::WaitingInput));
        assert_eq!(first.node_id.as_deref(), Some("menu"));

        let second = h.say("greeting", "Sales").await;
        assert_eq!(second.status, Some(RunStatus::Completed));
        let handoffs = second.handoffs();
        assert_eq!(handoffs.len(), 1);
        assert_eq!(handoffs[0].target, HandoffTarget::Queue("queueB".into()));

        assert!(h.live("greeting").await.is_none());
        assert_eq!(h.last_archived().status, RunStatus::Completed);
        assert_eq!(h.sink.handoffs().len(), 1);
        assert_eq!(h.sink.texts(), vec!["Hi", "How can we help?"]);
    }

    #[tokio::test]
    async fn test_menu_mismatch_takes_default() {
        let h = harness(vec![greeting_menu_flow()]);
        h.say("greeting", "hello").await;
        let result = h.say("greeting", "xyz").await;
        assert_eq!(result.status, Some(RunStatus::Completed));
        assert!(result.handoffs().is_empty());
        assert_eq!(h.last_archived().current_node_id, "end");
    }

    #[tokio::test]
    async fn test_menu_mismatch_without_default_asks_again() {
        let flow = FlowBuilder::new("pick")
            .start("s")
            .node(
                "m",
                NodeKind::Menu(chatflow_core::flow::MenuProps {
                    prompt: "Pick".into(),
                    options: vec![chatflow_core::flow::MenuOption::new("A")],
                    retry_prompt: Some("Please pick A".into()),
                }),
            )
            .end("a")
            .link("s", "m")
            .edge("m", OutputKey::Option(0), "a")
            .active()
            .build();
        let h = harness(vec![flow]);

        h.say("pick", "hi").await;
        let retry = h.say("pick", "zzz").await;
        assert_eq!(retry.status, Some(RunStatus::WaitingInput));
        assert_eq!(retry.node_id.as_deref(), Some("m"));
        assert_eq!(retry.texts(), vec!["Please pick A"]);
        assert_eq!(retry.outgoing()[0].options, vec!["A"]);
    }

    #[tokio::test]
    async fn test_question_validation_keeps_waiting() {
        let h = harness(vec![email_question_flow()]);
        let first = h.say("signup", "hi").await;
        assert_eq!(first.texts(), vec!["What's your email?"]);

        let bad = h.say("signup", "not-an-email").await;
        assert_eq!(bad.status, Some(RunStatus::WaitingInput));
        assert_eq!(bad.node_id.as_deref(), Some("ask"));
        assert_eq!(bad.texts(), vec!["What's your email?"]);
        assert!(h.live("signup").await.unwrap().var("email").is_none());

        let good = h.say("signup", "a@b.com").await;
        assert_eq!(good.texts(), vec!["Thanks a@b.com"]);
        assert_eq!(good.status, Some(RunStatus::Completed));
        assert_eq!(h.last_archived().var("email"), Some(&Value::string("a@b.com")));
    }

    #[tokio::test]
    async fn test_duplicate_event_applies_once() {
        let h = harness(vec![greeting_menu_flow()]);
        let first = h.send("greeting", text_event_with_id("m1", "c1", "web", "hello")).await;
        assert_eq!(first.disposition, Disposition::Applied);
        let dup = h.send("greeting", text_event_with_id("m1", "c1", "web", "hello")).await;
        assert_eq!(dup.disposition, Disposition::Duplicate);
        assert!(dup.effects.is_empty());
        assert_eq!(h.sink.texts().len(), 2);

        let done = h.send("greeting", text_event_with_id("m2", "c1", "web", "Sales")).await;
        assert_eq!(done.status, Some(RunStatus::Completed));

        // Redelivery after the run closed must not start a new run
        let late = h.send("greeting", text_event_with_id("m2", "c1", "web", "Sales")).await;
        assert_eq!(late.disposition, Disposition::Duplicate);
        assert!(h.live("greeting").await.is_none());
        assert_eq!(h.sink.handoffs().len(), 1);
    }

    fn webhook_flow(timeout_secs: u64, with_error_edge: bool) -> FlowDefinition {
        let mut props = HttpRequestProps::post("https://hooks.example.com/order");
        props.timeout_secs = Some(timeout_secs);
        let builder = FlowBuilder::new("hook")
            .fallback("We are having trouble, try later")
            .start("s")
            .webhook("w", props)
            .message("ok", "Done")
            .end("e")
            .link("s", "w")
            .link("w", "ok")
            .link("ok", "e");
        if !with_error_edge {
            return builder.active().build();
        }
        builder
            .message("failed", "Could not reach the store")
            .edge("w", OutputKey::Error, "failed")
            .link("failed", "e")
            .active()
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_webhook_timeout_takes_error_output() {
        let http = Arc::new(MockHttpClient::hanging());
        let services = Services {
            http: http.clone(),
            ..services()
        };
        let h = harness_with(vec![webhook_flow(2, true)], services, EngineOptions::default());

        let started = tokio::time::Instant::now();
        let result = h.say("hook", "order").await;
        let elapsed = started.elapsed();

        assert_eq!(result.texts(), vec!["Could not reach the store"]);
        assert_eq!(result.status, Some(RunStatus::Completed));
        assert_eq!(http.call_count(), 1);
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_unrouted_integration_failure_sends_fallback_once() {
        let flow = webhook_flow(2, false);
        let http = Arc::new(MockHttpClient::status(500));
        let services = Services {
            http: http.clone(),
            ..services()
        };
        let h = harness_with(vec![flow], services, EngineOptions::default());

        let result = h.say("hook", "order").await;
        assert_eq!(result.texts(), vec!["We are having trouble, try later"]);
        assert_eq!(result.status, Some(RunStatus::Error));
        let archived = h.last_archived();
        assert!(archived.error_reason.unwrap().contains("HTTP 500"));

        // The pair is free again
        let again = h.say("hook", "order").await;
        assert_eq!(again.status, Some(RunStatus::Error));
        assert_eq!(h.store.archived().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_webhook_binds_response_path() {
        let mut props = HttpRequestProps::post("https://crm.example.com/lookup");
        props.response_variable = Some("tier".into());
        props.response_path = Some("customer.tier".into());
        let flow = FlowBuilder::new("crm")
            .start("s")
            .api_request("lookup", props)
            .message("m", "You are {{tier}}")
            .end("e")
            .link("s", "lookup")
            .link("lookup", "m")
            .link("m", "e")
            .active()
            .build();
        let http = Arc::new(MockHttpClient::ok(r#"{"customer":{"tier":"gold"}}"#));
        let services = Services {
            http: http.clone(),
            ..services()
        };
        let h = harness_with(vec![flow], services, EngineOptions::default());

        let result = h.say("crm", "hi").await;
        assert_eq!(result.texts(), vec!["You are gold"]);
        // apiRequest sends no envelope
        assert!(http.requests()[0].body.is_none());
    }

    #[tokio::test]
    async fn test_webhook_sends_context_envelope() {
        let flow = webhook_flow(5, true);
        let http = Arc::new(MockHttpClient::ok("{}").with_reply(Ok(HttpResponse {
            status: 204,
            body: String::new(),
        })));
        let services = Services {
            http: http.clone(),
            ..services()
        };
        let h = harness_with(vec![flow], services, EngineOptions::default());

        let result = h.say("hook", "order 42").await;
        assert_eq!(result.texts(), vec!["Done"]);
        let body: serde_json::Value =
            serde_json::from_str(http.requests()[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(body["contact"]["id"], "c1");
        assert_eq!(body["flow"]["id"], "hook");
        assert_eq!(body["message"], "order 42");
    }

    fn switching_flows() -> Vec<FlowDefinition> {
        let a = FlowBuilder::new("a")
            .start("s")
            .question("name", "Your name?", "name", InputType::Text)
            .switch_flow("go", "b", true)
            .link("s", "name")
            .link("name", "go")
            .active()
            .build();
        let b = FlowBuilder::new("b")
            .start("s")
            .message("hello", "Welcome {{name}}")
            .question("topic", "Topic?", "topic", InputType::Text)
            .end("e")
            .link("s", "hello")
            .link("hello", "topic")
            .link("topic", "e")
            .active()
            .build();
        vec![a, b]
    }

    #[tokio::test]
    async fn test_switch_flow_carries_variables() {
        let h = harness(switching_flows());
        h.say("a", "hi").await;
        let result = h.say("a", "Ana").await;

        assert_eq!(result.texts(), vec!["Welcome Ana", "Topic?"]);
        assert_eq!(result.flow_id, flow("b"));
        assert_eq!(result.status, Some(RunStatus::WaitingInput));

        assert!(h.live("a").await.is_none());
        let b = h.live("b").await.unwrap();
        assert_eq!(b.var("name"), Some(&Value::string("Ana")));
        assert_eq!(b.current_node_id, "topic");
        assert_eq!(h.last_archived().flow_id, flow("a"));
    }

    #[tokio::test]
    async fn test_failed_switch_commit_is_redone_on_redelivery() {
        let (h, states) = failing_harness(switching_flows());
        h.say("a", "hi").await;
        h.sink.clear();

        let event = text_event_with_id("m2", "c1", "web", "Ana");
        states.fail_commits(1);
        let err = h.engine.advance(&contact(), &flow("a"), event.clone()).await.unwrap_err();
        assert!(matches!(err, ChatflowError::Storage(_)));
        assert!(h.sink.texts().is_empty());

        // Nothing from the failed switch was stored
        let a = h.live("a").await.unwrap();
        assert_eq!(a.current_node_id, "name");
        assert!(!a.has_applied("m2"));
        assert!(h.live("b").await.is_none());
        assert!(h.store.archived().unwrap().is_empty());

        let again = h.send("a", event).await;
        assert_eq!(again.disposition, Disposition::Applied);
        assert_eq!(again.flow_id, flow("b"));
        assert_eq!(h.sink.texts(), vec!["Welcome Ana", "Topic?"]);
        assert!(h.live("a").await.is_none());
        assert_eq!(h.live("b").await.unwrap().current_node_id, "topic");
        assert_eq!(h.last_archived().flow_id, flow("a"));
        assert_eq!(states.commit_attempts(), 3);
    }

    #[tokio::test]
    async fn test_failed_save_commit_is_redone_on_redelivery() {
        let (h, states) = failing_harness(vec![email_question_flow()]);

        let event = text_event_with_id("m1", "c1", "web", "hi");
        states.fail_commits(1);
        assert!(h.engine.advance(&contact(), &flow("signup"), event.clone()).await.is_err());
        assert!(h.sink.texts().is_empty());
        assert!(h.live("signup").await.is_none());

        let again = h.send("signup", event.clone()).await;
        assert_eq!(again.disposition, Disposition::Applied);
        assert_eq!(h.sink.texts(), vec!["What's your email?"]);
        let live = h.live("signup").await.unwrap();
        assert_eq!(live.revision, 1);
        assert!(live.has_applied("m1"));

        assert_eq!(h.send("signup", event).await.disposition, Disposition::Duplicate);
        assert_eq!(h.sink.texts().len(), 1);
    }

    #[tokio::test]
    async fn test_switch_to_missing_flow_is_fatal() {
        let mut flows = switching_flows();
        flows.truncate(1);
        let h = harness(flows);
        let mut events = h.engine.bus().subscribe();

        h.say("a", "hi").await;
        let result = h.say("a", "Ana").await;
        assert_eq!(result.status, Some(RunStatus::Error));
        assert!(result.texts().is_empty());

        let mut saw_incident = false;
        while let Ok(event) = events.try_recv() {
            if let FlowEvent::RunFailed { fatal_state, .. } = event {
                saw_incident |= fatal_state;
            }
        }
        assert!(saw_incident);
    }

    #[tokio::test]
    async fn test_stop_cancels_live_run() {
        let h = harness(vec![greeting_menu_flow()]);
        h.say("greeting", "hello").await;

        assert!(h.engine.stop(&flow("greeting"), &contact()).await.unwrap());
        let archived = h.last_archived();
        assert_eq!(archived.status, RunStatus::Error);
        assert_eq!(archived.error_reason.as_deref(), Some("cancelled"));
        assert!(!h.engine.stop(&flow("greeting"), &contact()).await.unwrap());

        // next message starts over
        let fresh = h.say("greeting", "hello").await;
        assert_eq!(fresh.texts(), vec!["Hi", "How can we help?"]);
    }

    fn sub_bot_flow(idle_timeout_secs: Option<u64>) -> FlowDefinition {
        FlowBuilder::new("delegate")
            .start("s")
            .node(
                "bot",
                NodeKind::SubBotDelegate(SubBotProps {
                    base_url: "https://bots.example.com".into(),
                    flow_id: "billing".into(),
                    token: None,
                    variable: Some("result".into()),
                    timeout_secs: None,
                    idle_timeout_secs,
                }),
            )
            .message("back", "Result: {{result}}")
            .message("expired", "The assistant timed out")
            .end("e")
            .link("s", "bot")
            .link("bot", "back")
            .edge("bot", OutputKey::Timeout, "expired")
            .link("back", "e")
            .link("expired", "e")
            .active()
            .build()
    }

    #[tokio::test]
    async fn test_sub_bot_keeps_then_returns_control() {
        let bot = Arc::new(
            MockSubBot::new()
                .with_reply(MockSubBot::keep(&["Billing here, what's up?"]))
                .with_reply(MockSubBot::done(Some("42"))),
        );
        let services = Services {
            sub_bot: bot.clone(),
            ..services()
        };
        let h = harness_with(vec![sub_bot_flow(None)], services, EngineOptions::default());

        let first = h.say("delegate", "hi").await;
        assert_eq!(first.texts(), vec!["Billing here, what's up?"]);
        assert_eq!(first.status, Some(RunStatus::WaitingInput));
        assert!(first.wake.is_none());

        let second = h.say("delegate", "my invoice").await;
        assert_eq!(second.texts(), vec!["Result: 42"]);
        assert_eq!(second.status, Some(RunStatus::Completed));

        let requests = bot.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].message.is_none());
        assert_eq!(requests[1].message.as_deref(), Some("my invoice"));
    }

    #[tokio::test]
    async fn test_timer_expires_sub_bot() {
        let bot = Arc::new(MockSubBot::new().with_reply(MockSubBot::keep(&["hold on"])));
        let services = Services {
            sub_bot: bot,
            ..services()
        };
        let h = harness_with(vec![sub_bot_flow(Some(60))], services, EngineOptions::default());

        let first = h.say("delegate", "hi").await;
        assert_eq!(
            first.wake,
            Some(WakeUp {
                node_id: "bot".into(),
                after: Duration::from_secs(60)
            })
        );

        let timer = InboundEvent::Timer {
            id: "t1".into(),
            channel_id: "web".into(),
            node_id: "bot".into(),
        };
        let result = h.engine.advance(&contact(), &flow("delegate"), timer).await.unwrap();
        assert_eq!(result.texts(), vec!["The assistant timed out"]);
        assert_eq!(result.status, Some(RunStatus::Completed));
    }

    #[tokio::test]
    async fn test_callback_returns_control() {
        let bot = Arc::new(MockSubBot::new().with_reply(MockSubBot::keep(&[])));
        let services = Services {
            sub_bot: bot,
            ..services()
        };
        let h = harness_with(vec![sub_bot_flow(None)], services, EngineOptions::default());
        h.say("delegate", "hi").await;

        let callback = InboundEvent::Callback {
            id: "cb1".into(),
            channel_id: "web".into(),
            node_id: "bot".into(),
            payload: serde_json::json!({"messages": ["All settled"], "result": "paid"}),
        };
        let result = h.engine.advance(&contact(), &flow("delegate"), callback).await.unwrap();
        assert_eq!(result.texts(), vec!["All settled", "Result: paid"]);
    }

    #[tokio::test]
    async fn test_timer_on_menu_is_ignored() {
        let h = harness(vec![greeting_menu_flow()]);
        h.say("greeting", "hello").await;
        let before = h.live("greeting").await.unwrap().revision;

        let timer = InboundEvent::Timer {
            id: "t1".into(),
            channel_id: "web".into(),
            node_id: "menu".into(),
        };
        let result = h.engine.advance(&contact(), &flow("greeting"), timer).await.unwrap();
        assert_eq!(result.disposition, Disposition::Ignored);
        assert_eq!(result.status, Some(RunStatus::WaitingInput));
        assert_eq!(h.live("greeting").await.unwrap().revision, before);

        // and with no run at all
        let orphan = InboundEvent::Timer {
            id: "t2".into(),
            channel_id: "web".into(),
            node_id: "menu".into(),
        };
        let other = ContactId::from_str("nobody");
        let result = h.engine.advance(&other, &flow("greeting"), orphan).await.unwrap();
        assert_eq!(result.disposition, Disposition::Ignored);
        assert!(result.status.is_none());
    }

    #[tokio::test]
    async fn test_step_budget_is_fatal() {
        let mut builder = FlowBuilder::new("long").start("s").end("e");
        let mut prev = "s".to_string();
        for i in 0..5 {
            let id = format!("m{}", i);
            builder = builder.message(&id, "tick").link(&prev, &id);
            prev = id;
        }
        let flow = builder.link(&prev, "e").active().build();
        let options = EngineOptions {
            max_steps: 3,
            ..EngineOptions::default()
        };
        let h = harness_with(vec![flow], services(), options);

        let result = h.say("long", "go").await;
        assert_eq!(result.status, Some(RunStatus::Error));
        assert!(h.last_archived().error_reason.unwrap().contains("exceeded 3 steps"));
    }

    #[tokio::test]
    async fn test_missing_pinned_version_closes_run() {
        let h = harness(vec![greeting_menu_flow()]);
        let mut orphan = ExecutionState::new(flow("greeting"), 9, contact(), "web", "menu");
        orphan.status = RunStatus::WaitingInput;
        orphan.revision = 1;
        h.store.save_state(&orphan).await.unwrap();

        let result = h.say("greeting", "Sales").await;
        assert_eq!(result.status, Some(RunStatus::Error));
        assert!(h.last_archived().error_reason.unwrap().contains("version 9"));

        // fresh run on the next message
        let fresh = h.say("greeting", "hello").await;
        assert_eq!(fresh.status, Some(RunStatus::WaitingInput));
    }

    #[tokio::test]
    async fn test_deactivation_blocks_new_runs_only() {
        let h = harness(vec![greeting_menu_flow()]);
        h.say("greeting", "hello").await;
        h.store
            .set_status(&flow("greeting"), 1, FlowStatus::Inactive)
            .await
            .unwrap();

        let finished = h.say("greeting", "Support").await;
        assert_eq!(finished.status, Some(RunStatus::Completed));

        let blocked = h
            .engine
            .advance(&ContactId::from_str("c2"), &flow("greeting"), text_event("c2", "web", "hi"))
            .await;
        assert!(matches!(blocked, Err(ChatflowError::FlowInactive(_))));
    }

    #[tokio::test]
    async fn test_language_model_replies_and_binds() {
        let completion = Arc::new(MockCompletionClient::new("unused").with_reply(Ok(" 42 ".into())));
        let services = Services {
            completion: Some(completion.clone()),
            ..services()
        };
        let flow = FlowBuilder::new("llm")
            .start("s")
            .language_model("ask", "Answer briefly: {{message.body}}", "answer")
            .end("e")
            .link("s", "ask")
            .link("ask", "e")
            .active()
            .build();
        let h = harness_with(vec![flow], services, EngineOptions::default());

        let result = h.say("llm", "what is six times seven").await;
        assert_eq!(result.texts(), vec!["42"]);
        assert_eq!(h.last_archived().var("answer"), Some(&Value::string("42")));

        let request = &completion.requests()[0];
        let last = request.messages.last().unwrap();
        assert_eq!(last.content, "Answer briefly: what is six times seven");
        assert_eq!(request.messages[0].content, "what is six times seven");
    }

    #[tokio::test]
    async fn test_missing_completion_provider_takes_error_edge() {
        let flow = FlowBuilder::new("llm")
            .start("s")
            .language_model("ask", "Hi", "answer")
            .message("sorry", "No assistant today")
            .end("e")
            .link("s", "ask")
            .link("ask", "e")
            .edge("ask", OutputKey::Error, "sorry")
            .link("sorry", "e")
            .active()
            .build();
        let services = Services {
            completion: None,
            ..services()
        };
        let h = harness_with(vec![flow], services, EngineOptions::default());
        let result = h.say("llm", "hi").await;
        assert_eq!(result.texts(), vec!["No assistant today"]);
    }

    #[tokio::test]
    async fn test_tag_op_calls_directory() {
        let contacts = Arc::new(RecordingContacts::default());
        let services = Services {
            contacts: contacts.clone(),
            ..services()
        };
        let flow = FlowBuilder::new("tagging")
            .start("s")
            .tags("t", TagAction::Add, &["lead", "{{source}}"])
            .end("e")
            .link("s", "t")
            .link("t", "e")
            .active()
            .build();
        let h = harness_with(vec![flow], services, EngineOptions::default());
        h.say("tagging", "hi").await;

        let calls = contacts.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, contact());
        // unresolved token renders empty and is dropped
        assert_eq!(calls[0].2, vec!["lead".to_string()]);
    }

    #[tokio::test]
    async fn test_render_warning_is_published() {
        let flow = FlowBuilder::new("warn")
            .start("s")
            .message("m", "Order {{order_id}}")
            .end("e")
            .link("s", "m")
            .link("m", "e")
            .active()
            .build();
        let h = harness(vec![flow]);
        let mut events = h.engine.bus().subscribe();

        let result = h.say("warn", "hi").await;
        assert_eq!(result.texts(), vec!["Order "]);

        let mut tokens = vec![];
        while let Ok(event) = events.try_recv() {
            if let FlowEvent::RenderWarning { token, .. } = event {
                tokens.push(token);
            }
        }
        assert_eq!(tokens, vec!["order_id".to_string()]);
    }

    #[tokio::test]
    async fn test_revision_advances_per_commit() {
        let h = harness(vec![email_question_flow()]);
        h.say("signup", "hi").await;
        assert_eq!(h.live("signup").await.unwrap().revision, 1);
        h.say("signup", "nope").await;
        assert_eq!(h.live("signup").await.unwrap().revision, 2);
    }
}
