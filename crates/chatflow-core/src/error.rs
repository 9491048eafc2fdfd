use thiserror::Error;

/// Structural defect found by the graph validator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphIssue {
    #[error("flow must have exactly one start node (found {0})")]
    StartCount(usize),

    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("edge from '{source_node}' references unknown node '{missing}'")]
    DanglingEdge { source_node: String, missing: String },

    #[error("node '{node}' has no output '{key}'")]
    UndeclaredOutput { node: String, key: String },

    #[error("node '{node}' maps output '{key}' more than once")]
    DuplicateOutput { node: String, key: String },

    #[error("terminal node '{0}' has outgoing edges")]
    TerminalWithEdges(String),

    #[error("node '{node}' output '{key}' is not mapped and no default edge exists")]
    UnmappedOutput { node: String, key: String },

    #[error("node '{0}' is not reachable from start")]
    Unreachable(String),

    #[error("node '{node}': {message}")]
    InvalidProperty { node: String, message: String },

    #[error("cycle without a waiting node through: {}", .0.join(" -> "))]
    AutoAdvanceCycle(Vec<String>),
}

/// Runtime inconsistency. Always fatal for the run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateError {
    #[error("node '{0}' not found in flow")]
    MissingNode(String),

    #[error("node '{node}' output '{key}' has no edge")]
    DanglingOutput { node: String, key: String },

    #[error("flow {flow_id} version {version} not found")]
    MissingFlowVersion { flow_id: String, version: u32 },

    #[error("switch target flow '{0}' has no active version")]
    MissingSwitchTarget(String),

    #[error("run exceeded {0} steps without waiting for input")]
    StepBudgetExceeded(usize),

    #[error("corrupted state: {0}")]
    Corrupted(String),
}

#[derive(Debug, Error)]
pub enum ChatflowError {
    // Flow authoring errors
    #[error("Flow validation failed: {}", format_issues(.0))]
    Validation(Vec<GraphIssue>),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Flow has no active version: {0}")]
    FlowInactive(String),

    #[error("Flow {flow_id} still has {live_runs} live run(s)")]
    FlowInUse { flow_id: String, live_runs: usize },

    // Integration errors
    #[error("Integration failed ({target}): {message}")]
    Integration { target: String, message: String },

    #[error("Integration timeout after {timeout_secs}s ({target})")]
    IntegrationTimeout { target: String, timeout_secs: u64 },

    // Runtime errors
    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Run cancelled")]
    Cancelled,

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Revision conflict for {pair}: expected {expected}, found {found}")]
    Conflict {
        pair: String,
        expected: u64,
        found: u64,
    },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Channel errors
    #[error("Channel error: {channel}: {message}")]
    Channel { channel: String, message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChatflowError {
    /// Whether this failure came from an external integration.
    pub fn is_integration(&self) -> bool {
        matches!(self, Self::Integration { .. } | Self::IntegrationTimeout { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::IntegrationTimeout { .. })
    }
}

fn format_issues(issues: &[GraphIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, ChatflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_lists_issues() {
        let err = ChatflowError::Validation(vec![
            GraphIssue::StartCount(0),
            GraphIssue::Unreachable("orphan".into()),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("exactly one start node"));
        assert!(msg.contains("'orphan' is not reachable"));
    }

    #[test]
    fn test_integration_classification() {
        let timeout = ChatflowError::IntegrationTimeout {
            target: "http".into(),
            timeout_secs: 2,
        };
        assert!(timeout.is_integration());
        assert!(timeout.is_timeout());
        assert!(!ChatflowError::Cancelled.is_integration());
    }

    #[test]
    fn test_cycle_issue_display() {
        let issue = GraphIssue::AutoAdvanceCycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(issue.to_string(), "cycle without a waiting node through: a -> b -> a");
    }
}
