use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ContactId, FlowId, PairKey, Value, Variables};

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Running,
    WaitingInput,
    Completed,
    Error,
}

impl RunStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::WaitingInput => "waitingInput",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One visited node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub node_id: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Contact,
    Bot,
}

/// A line of the conversation kept for language-model prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub speaker: Speaker,
    pub text: String,
}

/// Persisted progress of one contact's run through one flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub flow_id: FlowId,
    pub flow_version: u32,
    pub contact_id: ContactId,
    pub channel_id: String,
    pub current_node_id: String,
    #[serde(default)]
    pub variables: Variables,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub conversation: VecDeque<ConversationTurn>,
    /// Ids of inbound events already applied, newest last.
    #[serde(default)]
    pub applied_events: VecDeque<String>,
    /// Commit counter; the store only accepts a save whose base revision matches.
    #[serde(default)]
    pub revision: u64,
    /// Why the run closed as `error`.
    #[serde(default)]
    pub error_reason: Option<String>,
}

impl ExecutionState {
    pub fn new(
        flow_id: FlowId,
        flow_version: u32,
        contact_id: ContactId,
        channel_id: impl Into<String>,
        start_node_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            flow_id,
            flow_version,
            contact_id,
            channel_id: channel_id.into(),
            current_node_id: start_node_id.into(),
            variables: Variables::new(),
            status: RunStatus::Running,
            started_at: now,
            updated_at: now,
            history: vec![],
            conversation: VecDeque::new(),
            applied_events: VecDeque::new(),
            revision: 0,
            error_reason: None,
        }
    }

    pub fn pair(&self) -> PairKey {
        PairKey::new(self.flow_id.clone(), self.contact_id.clone())
    }

    pub fn enter(&mut self, node_id: &str) {
        self.current_node_id = node_id.to_string();
        self.history.push(HistoryEntry {
            node_id: node_id.to_string(),
            at: Utc::now(),
        });
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn has_applied(&self, event_id: &str) -> bool {
        self.applied_events.iter().any(|id| id == event_id)
    }

    /// Remember an applied event id, keeping at most `window` ids.
    pub fn mark_applied(&mut self, event_id: &str, window: usize) {
        self.applied_events.push_back(event_id.to_string());
        while self.applied_events.len() > window.max(1) {
            self.applied_events.pop_front();
        }
    }

    /// Append a conversation line, keeping at most `window` lines.
    pub fn record_turn(&mut self, speaker: Speaker, text: &str, window: usize) {
        if text.is_empty() {
            return;
        }
        self.conversation.push_back(ConversationTurn {
            speaker,
            text: text.to_string(),
        });
        while self.conversation.len() > window.max(1) {
            self.conversation.pop_front();
        }
    }

    pub fn close(&mut self, status: RunStatus, reason: Option<String>) {
        self.status = status;
        self.error_reason = reason;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ExecutionState {
        ExecutionState::new(
            FlowId::from_str("f1"),
            1,
            ContactId::from_str("c1"),
            "web",
            "start",
        )
    }

    #[test]
    fn test_applied_events_window() {
        let mut s = state();
        for i in 0..5 {
            s.mark_applied(&format!("e{}", i), 3);
        }
        assert_eq!(s.applied_events.len(), 3);
        assert!(!s.has_applied("e0"));
        assert!(!s.has_applied("e1"));
        assert!(s.has_applied("e4"));
    }

    #[test]
    fn test_conversation_window() {
        let mut s = state();
        s.record_turn(Speaker::Contact, "hi", 2);
        s.record_turn(Speaker::Bot, "", 2);
        s.record_turn(Speaker::Bot, "hello", 2);
        s.record_turn(Speaker::Contact, "help", 2);
        let texts: Vec<_> = s.conversation.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["hello", "help"]);
    }

    #[test]
    fn test_enter_records_history() {
        let mut s = state();
        s.enter("a");
        s.enter("b");
        assert_eq!(s.current_node_id, "b");
        assert_eq!(s.history.len(), 2);
        assert_eq!(s.pair().to_string(), "f1:c1");
    }

    #[test]
    fn test_state_serde_round_trip() {
        let mut s = state();
        s.set_var("email", "a@b.com");
        s.status = RunStatus::WaitingInput;
        let json = serde_json::to_string(&s).unwrap();
        let back: ExecutionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, RunStatus::WaitingInput);
        assert_eq!(back.var("email"), Some(&Value::string("a@b.com")));
    }
}
