use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{ChatflowError, Result};
use crate::flow::{FlowDefinition, FlowStatus, FlowSummary, HttpAuth, HttpMethod};
use crate::state::ExecutionState;
use crate::types::*;

/// Outbound HTTP call issued by webhook / apiRequest nodes.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub auth: Option<HttpAuth>,
    /// When set, the adapter signs the body with HMAC-SHA256.
    pub signing_secret: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.body).ok()
    }
}

/// HTTP client: webhook and API request nodes.
pub trait HttpClient: Send + Sync + 'static {
    /// Perform the request. Non-2xx responses are returned, not raised.
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMessage {
    /// "user" or "assistant".
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// Overrides the configured model when set.
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub messages: Vec<CompletionMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
}

/// Completion provider: language model nodes.
pub trait CompletionClient: Send + Sync + 'static {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>>;

    /// Convert text to speech. Providers without voice support fail the call.
    fn synthesize(&self, text: &str, voice: &str) -> BoxFuture<'_, Result<MediaRef>> {
        let _ = (text, voice);
        Box::pin(async {
            Err(ChatflowError::Integration {
                target: "completion".into(),
                message: "voice synthesis not supported by this provider".into(),
            })
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubBotRequest {
    pub base_url: String,
    pub flow_id: String,
    #[serde(skip)]
    pub token: Option<String>,
    pub contact_id: ContactId,
    pub channel_id: String,
    /// Message forwarded to the sub-bot; `None` on the initial hand-over.
    pub message: Option<String>,
    pub variables: Variables,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubBotReply {
    #[serde(default)]
    pub messages: Vec<String>,
    /// True when the sub-bot hands control back.
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub result: Option<String>,
}

/// External sub-flow provider: sub-bot delegate nodes.
pub trait SubBotClient: Send + Sync + 'static {
    fn delegate(&self, request: SubBotRequest) -> BoxFuture<'_, Result<SubBotReply>>;
}

/// Contact record collaborator: tag operations.
pub trait ContactDirectory: Send + Sync + 'static {
    fn apply_tags(
        &self,
        contact: &ContactId,
        action: TagAction,
        tags: &[String],
    ) -> BoxFuture<'_, Result<()>>;
}

/// Destination of side effects produced by a committed transition.
pub trait EffectSink: Send + Sync + 'static {
    fn deliver(&self, message: &OutgoingMessage) -> BoxFuture<'_, Result<()>>;

    fn handoff(&self, record: &HandoffRecord) -> BoxFuture<'_, Result<()>>;
}

/// Flow definition persistence. Versions are immutable once stored.
pub trait FlowStore: Send + Sync + 'static {
    /// Store `flow` as a new version (`max + 1`) and return it.
    fn create_flow(&self, flow: FlowDefinition) -> BoxFuture<'_, Result<FlowDefinition>>;

    fn get_flow(&self, id: &FlowId, version: u32) -> BoxFuture<'_, Result<Option<FlowDefinition>>>;

    fn latest_flow(&self, id: &FlowId) -> BoxFuture<'_, Result<Option<FlowDefinition>>>;

    fn active_flow(&self, id: &FlowId) -> BoxFuture<'_, Result<Option<FlowDefinition>>>;

    /// Active flow whose channel binding is `channel`, if any.
    fn active_for_channel(&self, channel: &str) -> BoxFuture<'_, Result<Option<FlowDefinition>>>;

    /// Every stored version, ordered by id then version.
    fn list_flows(&self) -> BoxFuture<'_, Result<Vec<FlowSummary>>>;

    /// Activating a version deactivates every other version of the flow.
    fn set_status(&self, id: &FlowId, version: u32, status: FlowStatus) -> BoxFuture<'_, Result<()>>;

    /// Delete every version; returns the number removed.
    fn delete_flow(&self, id: &FlowId) -> BoxFuture<'_, Result<usize>>;
}

/// Execution state persistence: one live state per (flow, contact).
pub trait StateStore: Send + Sync + 'static {
    fn load_state(&self, pair: &PairKey) -> BoxFuture<'_, Result<Option<ExecutionState>>>;

    /// Compare-and-swap commit: the stored revision must be `state.revision - 1`
    /// (or absent when `state.revision == 1`), otherwise `ChatflowError::Conflict`.
    fn save_state(&self, state: &ExecutionState) -> BoxFuture<'_, Result<()>>;

    /// Commit a closed state: same revision check as `save_state`, then the
    /// live row is removed so the pair is free for a new run.
    fn archive_state(&self, state: &ExecutionState) -> BoxFuture<'_, Result<()>>;

    /// Archive every state in `closed`, in order, then save `live`, as one
    /// unit. Each write carries its own revision check; if any check or
    /// write fails nothing is stored.
    fn commit_states(
        &self,
        closed: &[ExecutionState],
        live: Option<&ExecutionState>,
    ) -> BoxFuture<'_, Result<()>>;

    /// Most recently archived state of the pair.
    fn last_archived(&self, pair: &PairKey) -> BoxFuture<'_, Result<Option<ExecutionState>>>;

    fn delete_state(&self, pair: &PairKey) -> BoxFuture<'_, Result<bool>>;

    fn live_for_contact(&self, contact: &ContactId) -> BoxFuture<'_, Result<Vec<ExecutionState>>>;

    fn list_live(&self, flow_id: &FlowId) -> BoxFuture<'_, Result<Vec<ExecutionState>>>;
}

/// Channel adapter: a chat transport.
pub trait ChannelAdapter: Send + Sync + 'static {
    /// Channel id this adapter serves.
    fn name(&self) -> &str;

    /// Start receiving messages, sending them via the provided sender.
    fn start(&self, tx: mpsc::Sender<InboundMessage>) -> BoxFuture<'_, Result<()>>;

    fn send(&self, message: &OutgoingMessage) -> BoxFuture<'_, Result<()>>;

    /// Stop the adapter gracefully.
    fn stop(&self) -> BoxFuture<'_, Result<()>>;
}
