use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ChatflowError, Result};
use crate::types::{FlowId, MediaRef, TagAction};
use crate::validation::InputType;

/// Tag written into exported flow documents.
pub const DOCUMENT_FORMAT: &str = "chatflow/v1";

/// Whether new runs may start against a flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Active,
    #[default]
    Inactive,
}

/// An authored conversation script.
///
/// A stored definition is immutable: edits are saved as a new `version`, and a
/// run stays pinned to the version it started on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    pub id: FlowId,
    pub name: String,
    /// Channel whose new conversations start this flow.
    #[serde(default)]
    pub channel_binding: Option<String>,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub status: FlowStatus,
    #[serde(default)]
    pub version: u32,
    /// Sent once when an integration failure closes a run.
    #[serde(default)]
    pub fallback_message: Option<String>,
}

impl FlowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: FlowId(id.into()),
            name: name.into(),
            channel_binding: None,
            nodes: vec![],
            edges: vec![],
            status: FlowStatus::Inactive,
            version: 0,
            fallback_message: None,
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| matches!(n.kind, NodeKind::Start))
    }

    pub fn is_active(&self) -> bool {
        self.status == FlowStatus::Active
    }

    pub fn summary(&self) -> FlowSummary {
        FlowSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version,
            status: self.status,
            channel_binding: self.channel_binding.clone(),
        }
    }
}

/// Listing row for a stored flow version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSummary {
    pub id: FlowId,
    pub name: String,
    pub version: u32,
    pub status: FlowStatus,
    pub channel_binding: Option<String>,
}

/// Portable export/import envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDocument {
    pub format: String,
    pub flow: FlowDefinition,
}

impl FlowDocument {
    pub fn export(flow: &FlowDefinition) -> Result<String> {
        let doc = FlowDocument {
            format: DOCUMENT_FORMAT.to_string(),
            flow: flow.clone(),
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    /// Parse an exported document. Status and version are reset: an import is always a new draft.
    pub fn import(json: &str) -> Result<FlowDefinition> {
        let doc: FlowDocument = serde_json::from_str(json)?;
        if doc.format != DOCUMENT_FORMAT {
            return Err(ChatflowError::Config(format!(
                "Unsupported flow document format: {}",
                doc.format
            )));
        }
        let mut flow = doc.flow;
        flow.status = FlowStatus::Inactive;
        flow.version = 0;
        Ok(flow)
    }
}

/// A typed step of the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            label: None,
            kind,
        }
    }
}

/// Closed set of node kinds with their kind-specific properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "properties", rename_all = "camelCase")]
pub enum NodeKind {
    Start,
    Message(MessageProps),
    Menu(MenuProps),
    Question(QuestionProps),
    Conditional(ConditionalProps),
    Webhook(HttpRequestProps),
    ApiRequest(HttpRequestProps),
    LanguageModel(LanguageModelProps),
    SubBotDelegate(SubBotProps),
    QueueHandoff(QueueHandoffProps),
    AttendantHandoff(AttendantHandoffProps),
    TagOp(TagOpProps),
    SwitchFlow(SwitchFlowProps),
    End,
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Message(_) => "message",
            Self::Menu(_) => "menu",
            Self::Question(_) => "question",
            Self::Conditional(_) => "conditional",
            Self::Webhook(_) => "webhook",
            Self::ApiRequest(_) => "apiRequest",
            Self::LanguageModel(_) => "languageModel",
            Self::SubBotDelegate(_) => "subBotDelegate",
            Self::QueueHandoff(_) => "queueHandoff",
            Self::AttendantHandoff(_) => "attendantHandoff",
            Self::TagOp(_) => "tagOp",
            Self::SwitchFlow(_) => "switchFlow",
            Self::End => "end",
        }
    }

    /// Output keys this kind may route through.
    pub fn declared_outputs(&self) -> Vec<OutputKey> {
        match self {
            Self::Start | Self::Message(_) | Self::TagOp(_) => vec![OutputKey::Default],
            Self::Menu(p) => {
                let mut keys: Vec<_> = (0..p.options.len()).map(OutputKey::Option).collect();
                keys.push(OutputKey::Default);
                keys
            }
            Self::Question(_) => vec![OutputKey::Default, OutputKey::ValidationError],
            Self::Conditional(p) => {
                let mut keys: Vec<_> = (0..p.tests.len()).map(OutputKey::Match).collect();
                keys.push(OutputKey::Default);
                keys
            }
            Self::Webhook(_) | Self::ApiRequest(_) | Self::LanguageModel(_) => {
                vec![OutputKey::Default, OutputKey::Error]
            }
            Self::SubBotDelegate(_) => {
                vec![OutputKey::Default, OutputKey::Error, OutputKey::Timeout]
            }
            Self::QueueHandoff(_) | Self::AttendantHandoff(_) | Self::SwitchFlow(_) | Self::End => {
                vec![]
            }
        }
    }

    /// Kinds that end automated execution in this flow.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::QueueHandoff(_) | Self::AttendantHandoff(_) | Self::SwitchFlow(_) | Self::End
        )
    }

    /// Kinds that stop the run to wait for an inbound event.
    pub fn is_suspending(&self) -> bool {
        matches!(self, Self::Menu(_) | Self::Question(_) | Self::SubBotDelegate(_))
    }

    /// Kinds that suspend on every entry, whatever their collaborators answer.
    pub fn always_waits(&self) -> bool {
        matches!(self, Self::Menu(_) | Self::Question(_))
    }

    /// Kinds that call an external system and may fail.
    pub fn is_integration(&self) -> bool {
        matches!(
            self,
            Self::Webhook(_) | Self::ApiRequest(_) | Self::LanguageModel(_) | Self::SubBotDelegate(_)
        )
    }
}

/// A labeled exit of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OutputKey {
    Default,
    Error,
    Timeout,
    ValidationError,
    Option(usize),
    Match(usize),
}

impl std::fmt::Display for OutputKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Error => write!(f, "error"),
            Self::Timeout => write!(f, "timeout"),
            Self::ValidationError => write!(f, "validationError"),
            Self::Option(i) => write!(f, "option:{}", i),
            Self::Match(i) => write!(f, "match:{}", i),
        }
    }
}

impl std::str::FromStr for OutputKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "default" => return Ok(Self::Default),
            "error" => return Ok(Self::Error),
            "timeout" => return Ok(Self::Timeout),
            "validationError" => return Ok(Self::ValidationError),
            _ => {}
        }
        let (prefix, index) = s
            .split_once(':')
            .ok_or_else(|| format!("Unknown output key: {}", s))?;
        let index: usize = index
            .parse()
            .map_err(|_| format!("Invalid output index in '{}'", s))?;
        match prefix {
            "option" => Ok(Self::Option(index)),
            "match" => Ok(Self::Match(index)),
            _ => Err(format!("Unknown output key: {}", s)),
        }
    }
}

impl TryFrom<String> for OutputKey {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, String> {
        s.parse()
    }
}

impl From<OutputKey> for String {
    fn from(key: OutputKey) -> Self {
        key.to_string()
    }
}

/// Connects a node's output to the next node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub source_node_id: String,
    pub source_output_key: OutputKey,
    pub target_node_id: String,
}

impl Edge {
    pub fn new(source: impl Into<String>, key: OutputKey, target: impl Into<String>) -> Self {
        Self {
            source_node_id: source.into(),
            source_output_key: key,
            target_node_id: target.into(),
        }
    }

    /// Create a `default` edge.
    pub fn default_of(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(source, OutputKey::Default, target)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageProps {
    pub text: String,
    #[serde(default)]
    pub media: Option<MediaRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuOption {
    pub label: String,
    /// Text matched against replies; the label is used when absent.
    #[serde(default)]
    pub trigger: Option<String>,
}

impl MenuOption {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            trigger: None,
        }
    }

    pub fn trigger(&self) -> &str {
        self.trigger.as_deref().unwrap_or(&self.label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuProps {
    pub prompt: String,
    pub options: Vec<MenuOption>,
    /// Sent when a reply matches nothing and there is no default edge.
    #[serde(default)]
    pub retry_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionProps {
    pub prompt: String,
    pub variable: String,
    #[serde(default)]
    pub input_type: InputType,
    #[serde(default)]
    pub retry_prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionOperator {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionTest {
    pub operator: ConditionOperator,
    pub value: String,
}

impl ConditionTest {
    pub fn new(operator: ConditionOperator, value: impl Into<String>) -> Self {
        Self {
            operator,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalProps {
    /// Variable (or system value such as `message.body`) under test.
    pub variable: String,
    pub tests: Vec<ConditionTest>,
    #[serde(default)]
    pub case_sensitive: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    pub fn has_body(&self) -> bool {
        !matches!(self, Self::Get | Self::Delete)
    }
}

/// Authentication scheme applied by the HTTP adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "camelCase")]
pub enum HttpAuth {
    Bearer { token: String },
    Basic { username: String, password: String },
    ApiKey { header: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestProps {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Body template. Webhook nodes send a context envelope when absent.
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub response_variable: Option<String>,
    /// Dot path into the JSON response, e.g. `data.items.0.name`.
    #[serde(default)]
    pub response_path: Option<String>,
    /// HMAC-SHA256 key used to sign the request body.
    #[serde(default)]
    pub signing_secret: Option<String>,
    #[serde(default)]
    pub auth: Option<HttpAuth>,
}

impl HttpRequestProps {
    pub fn post(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Post,
            headers: BTreeMap::new(),
            body: None,
            timeout_secs: None,
            retries: 0,
            response_variable: None,
            response_path: None,
            signing_secret: None,
            auth: None,
        }
    }
}

fn default_history_window() -> usize {
    10
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageModelProps {
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Number of recent conversation turns included in the prompt.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    pub variable: String,
    #[serde(default = "default_true")]
    pub send_reply: bool,
    /// Voice id; when set the reply is synthesized to audio.
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubBotProps {
    pub base_url: String,
    pub flow_id: String,
    #[serde(default)]
    pub token: Option<String>,
    /// Variable receiving the sub-bot result when it returns control.
    #[serde(default)]
    pub variable: Option<String>,
    /// Bound on each delegation call.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// How long the sub-bot may hold the conversation before `timeout` fires.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHandoffProps {
    pub queue: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendantHandoffProps {
    pub attendant: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagOpProps {
    pub action: TagAction,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchFlowProps {
    pub flow_id: FlowId,
    #[serde(default = "default_true")]
    pub carry_variables: bool,
}
