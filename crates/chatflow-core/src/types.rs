use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a flow definition (stable across versions).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct FlowId(pub String);

impl FlowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for FlowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an end-user contact on a channel.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ContactId(pub String);

impl ContactId {
    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ContactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key of a logically single-threaded conversation lane.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct PairKey {
    pub flow_id: FlowId,
    pub contact_id: ContactId,
}

impl PairKey {
    pub fn new(flow_id: FlowId, contact_id: ContactId) -> Self {
        Self {
            flow_id,
            contact_id,
        }
    }
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.flow_id, self.contact_id)
    }
}

/// Reference to a media object held by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A variable value bound during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Value {
    String(String),
    Number(f64),
    Boolean(bool),
    MediaRef(MediaRef),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Text form used by the renderer and condition tests.
    pub fn to_text(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            Self::Number(n) => n.to_string(),
            Self::Boolean(b) => b.to_string(),
            Self::MediaRef(m) => m.url.clone(),
        }
    }

    /// Convert a JSON value into a variable value. Composite values keep their JSON text.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or_default()),
            serde_json::Value::Bool(b) => Self::Boolean(*b),
            serde_json::Value::Null => Self::String(String::new()),
            other => Self::String(other.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Number(n) => serde_json::json!(n),
            Self::Boolean(b) => serde_json::Value::Bool(*b),
            Self::MediaRef(m) => serde_json::json!({ "url": m.url, "mimeType": m.mime_type }),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

/// Variable bindings of a run, ordered for stable serialization.
pub type Variables = BTreeMap<String, Value>;

/// An incoming chat message from the transport collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Transport message id, used as the idempotence key.
    pub id: String,
    pub contact_id: ContactId,
    pub channel_id: String,
    pub body: String,
    #[serde(default)]
    pub media_refs: Vec<MediaRef>,
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn text(contact_id: &ContactId, channel_id: &str, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            contact_id: contact_id.clone(),
            channel_id: channel_id.to_string(),
            body: body.into(),
            media_refs: vec![],
            timestamp: Utc::now(),
        }
    }
}

/// Anything that can wake a conversation up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundEvent {
    /// A reply from the contact.
    Message(InboundMessage),
    /// A scheduled wake-up for the node that armed it (expires a pending delegation).
    Timer {
        id: String,
        channel_id: String,
        node_id: String,
    },
    /// An external system handing control back (e.g. a sub-bot finishing).
    Callback {
        id: String,
        channel_id: String,
        node_id: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl InboundEvent {
    pub fn id(&self) -> &str {
        match self {
            Self::Message(m) => &m.id,
            Self::Timer { id, .. } | Self::Callback { id, .. } => id,
        }
    }

    pub fn channel_id(&self) -> &str {
        match self {
            Self::Message(m) => &m.channel_id,
            Self::Timer { channel_id, .. } | Self::Callback { channel_id, .. } => channel_id,
        }
    }

    pub fn message_body(&self) -> Option<&str> {
        match self {
            Self::Message(m) => Some(&m.body),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Timer { .. } => "timer",
            Self::Callback { .. } => "callback",
        }
    }
}

/// Kind of outgoing content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Text,
    Options,
    Media,
    Audio,
}

/// A message the engine wants the sending gateway to deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub contact_id: ContactId,
    pub channel_id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
}

impl OutgoingMessage {
    pub fn text(contact_id: &ContactId, channel_id: &str, content: impl Into<String>) -> Self {
        Self {
            contact_id: contact_id.clone(),
            channel_id: channel_id.to_string(),
            message_type: MessageType::Text,
            content: content.into(),
            options: vec![],
            media: None,
        }
    }
}

/// Where a handed-off conversation goes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum HandoffTarget {
    Queue(String),
    Attendant(String),
}

impl std::fmt::Display for HandoffTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queue(q) => write!(f, "queue:{}", q),
            Self::Attendant(a) => write!(f, "attendant:{}", a),
        }
    }
}

/// Record surfaced to the ticketing collaborator when automation ends in a handoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub contact_id: ContactId,
    pub channel_id: String,
    pub flow_id: FlowId,
    pub target: HandoffTarget,
    pub variables: Variables,
    pub created_at: DateTime<Utc>,
}

/// Add or remove labels on a contact.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TagAction {
    Add,
    Remove,
}

/// Engine lifecycle event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    RunStarted {
        pair: PairKey,
        flow_version: u32,
    },
    NodeEntered {
        pair: PairKey,
        node_id: String,
        kind: &'static str,
    },
    Suspended {
        pair: PairKey,
        node_id: String,
    },
    RunCompleted {
        pair: PairKey,
        steps: usize,
    },
    Handoff {
        pair: PairKey,
        target: HandoffTarget,
    },
    FlowSwitched {
        from: PairKey,
        to: FlowId,
    },
    IntegrationCalled {
        pair: PairKey,
        node_id: String,
        kind: &'static str,
        succeeded: bool,
        elapsed_ms: u64,
    },
    RenderWarning {
        pair: PairKey,
        node_id: String,
        token: String,
    },
    /// A run closed as `error`. `fatal_state` marks incidents needing operator review.
    RunFailed {
        pair: PairKey,
        node_id: Option<String>,
        reason: String,
        fatal_state: bool,
    },
}
