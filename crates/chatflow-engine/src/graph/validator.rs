use std::collections::{HashMap, HashSet, VecDeque};

use regex::Regex;

use chatflow_core::error::{ChatflowError, GraphIssue, Result};
use chatflow_core::flow::{ConditionOperator, FlowDefinition, Node, NodeKind, OutputKey};
use chatflow_core::validation::InputType;

/// Run every static check on a candidate definition. An empty list means valid.
///
/// Checks: a single start node, unique node ids, edge endpoints that exist,
/// edges only from declared outputs (and never from terminal kinds), at most
/// one edge per output, required outputs mapped (directly or through
/// `default`), kind-specific properties, reachability from start, and no cycle
/// that can be traversed without waiting for the contact.
pub fn validate_flow(flow: &FlowDefinition) -> Vec<GraphIssue> {
    let mut issues = Vec::new();

    let starts = flow
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Start))
        .count();
    if starts != 1 {
        issues.push(GraphIssue::StartCount(starts));
    }

    let mut index: HashMap<&str, &Node> = HashMap::new();
    let mut reported_dupes = HashSet::new();
    for node in &flow.nodes {
        if index.insert(node.id.as_str(), node).is_some() && reported_dupes.insert(node.id.as_str()) {
            issues.push(GraphIssue::DuplicateNode(node.id.clone()));
        }
        check_properties(node, &mut issues);
    }

    let mut mapped: HashMap<&str, HashSet<OutputKey>> = HashMap::new();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut reported_terminal = HashSet::new();
    for edge in &flow.edges {
        let source = edge.source_node_id.as_str();
        let target = edge.target_node_id.as_str();
        let Some(node) = index.get(source) else {
            issues.push(GraphIssue::DanglingEdge {
                source_node: source.to_string(),
                missing: source.to_string(),
            });
            continue;
        };
        if !index.contains_key(target) {
            issues.push(GraphIssue::DanglingEdge {
                source_node: source.to_string(),
                missing: target.to_string(),
            });
            continue;
        }
        if node.kind.is_terminal() {
            if reported_terminal.insert(source) {
                issues.push(GraphIssue::TerminalWithEdges(source.to_string()));
            }
            continue;
        }
        let key = edge.source_output_key;
        if !node.kind.declared_outputs().contains(&key) {
            issues.push(GraphIssue::UndeclaredOutput {
                node: source.to_string(),
                key: key.to_string(),
            });
            continue;
        }
        if !mapped.entry(source).or_default().insert(key) {
            issues.push(GraphIssue::DuplicateOutput {
                node: source.to_string(),
                key: key.to_string(),
            });
            continue;
        }
        adjacency.entry(source).or_default().push(target);
    }

    let empty = HashSet::new();
    for node in &flow.nodes {
        let keys = mapped.get(node.id.as_str()).unwrap_or(&empty);
        for key in required_outputs(&node.kind) {
            let covered = keys.contains(&key)
                || (matches!(key, OutputKey::Option(_) | OutputKey::Match(_))
                    && keys.contains(&OutputKey::Default));
            if !covered {
                issues.push(GraphIssue::UnmappedOutput {
                    node: node.id.clone(),
                    key: key.to_string(),
                });
            }
        }
    }

    if let Some(start) = flow.start_node().filter(|_| starts == 1) {
        let reached = reachable_from(start.id.as_str(), &adjacency);
        let mut seen = HashSet::new();
        for node in &flow.nodes {
            if !reached.contains(node.id.as_str()) && seen.insert(node.id.as_str()) {
                issues.push(GraphIssue::Unreachable(node.id.clone()));
            }
        }
    }

    for cycle in auto_advance_cycles(&index, &adjacency) {
        issues.push(GraphIssue::AutoAdvanceCycle(cycle));
    }

    issues
}

/// `Err(Validation)` carrying every issue, or `Ok` for a valid definition.
pub fn ensure_valid(flow: &FlowDefinition) -> Result<()> {
    let issues = validate_flow(flow);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(ChatflowError::Validation(issues))
    }
}

/// Outputs that must resolve to an edge. Menu options and conditional
/// matches are satisfied by a `default` edge.
fn required_outputs(kind: &NodeKind) -> Vec<OutputKey> {
    match kind {
        NodeKind::Menu(p) => (0..p.options.len()).map(OutputKey::Option).collect(),
        k if k.is_terminal() => vec![],
        _ => vec![OutputKey::Default],
    }
}

fn reachable_from<'a>(start: &'a str, adjacency: &HashMap<&'a str, Vec<&'a str>>) -> HashSet<&'a str> {
    let mut seen = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(id) = queue.pop_front() {
        for next in adjacency.get(id).into_iter().flatten() {
            if seen.insert(*next) {
                queue.push_back(*next);
            }
        }
    }
    seen
}

/// Cycles made only of nodes that can run without waiting for the contact.
/// Such a loop would spin until the step budget trips.
fn auto_advance_cycles(
    index: &HashMap<&str, &Node>,
    adjacency: &HashMap<&str, Vec<&str>>,
) -> Vec<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Open,
        Done,
    }

    fn visit<'a>(
        id: &'a str,
        index: &HashMap<&str, &Node>,
        adjacency: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        marks.insert(id, Mark::Open);
        path.push(id);
        for next in adjacency.get(id).into_iter().flatten() {
            let waits = index.get(next).map(|n| n.kind.always_waits()).unwrap_or(true);
            if waits {
                continue;
            }
            match marks.get(next) {
                Some(Mark::Open) => {
                    if let Some(pos) = path.iter().position(|p| p == next) {
                        let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
                        cycle.push(next.to_string());
                        cycles.push(cycle);
                    }
                }
                Some(Mark::Done) => {}
                None => visit(next, index, adjacency, marks, path, cycles),
            }
        }
        path.pop();
        marks.insert(id, Mark::Done);
    }

    let mut ids: Vec<&str> = index.keys().copied().collect();
    ids.sort_unstable();

    let mut marks = HashMap::new();
    let mut cycles = Vec::new();
    for id in ids {
        let waits = index.get(id).map(|n| n.kind.always_waits()).unwrap_or(true);
        if waits || marks.contains_key(id) {
            continue;
        }
        let mut path = Vec::new();
        visit(id, index, adjacency, &mut marks, &mut path, &mut cycles);
    }
    cycles
}

fn invalid(node: &Node, message: impl Into<String>) -> GraphIssue {
    GraphIssue::InvalidProperty {
        node: node.id.clone(),
        message: message.into(),
    }
}

fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

/// Literal URLs must be http(s); templated URLs are checked once rendered.
fn url_is_plausible(url: &str) -> bool {
    let url = url.trim();
    url.starts_with("http://") || url.starts_with("https://") || url.starts_with("{{")
}

fn check_properties(node: &Node, issues: &mut Vec<GraphIssue>) {
    match &node.kind {
        NodeKind::Start | NodeKind::End => {}
        NodeKind::Message(p) => {
            if is_blank(&p.text) && p.media.is_none() {
                issues.push(invalid(node, "message has neither text nor media"));
            }
        }
        NodeKind::Menu(p) => {
            if is_blank(&p.prompt) {
                issues.push(invalid(node, "menu prompt is empty"));
            }
            if p.options.is_empty() {
                issues.push(invalid(node, "menu needs at least one option"));
            }
            for (i, option) in p.options.iter().enumerate() {
                if is_blank(&option.label) {
                    issues.push(invalid(node, format!("menu option {} has an empty label", i)));
                }
            }
        }
        NodeKind::Question(p) => {
            if is_blank(&p.prompt) {
                issues.push(invalid(node, "question prompt is empty"));
            }
            if is_blank(&p.variable) {
                issues.push(invalid(node, "question has no target variable"));
            }
            if let InputType::Custom { pattern } = &p.input_type {
                if let Err(e) = Regex::new(pattern) {
                    issues.push(invalid(node, format!("invalid validation pattern: {}", e)));
                }
            }
        }
        NodeKind::Conditional(p) => {
            if is_blank(&p.variable) {
                issues.push(invalid(node, "conditional has no variable under test"));
            }
            if p.tests.is_empty() {
                issues.push(invalid(node, "conditional needs at least one test"));
            }
            for (i, test) in p.tests.iter().enumerate() {
                if test.operator == ConditionOperator::Regex {
                    if let Err(e) = Regex::new(&test.value) {
                        issues.push(invalid(node, format!("test {} has an invalid regex: {}", i, e)));
                    }
                }
            }
        }
        NodeKind::Webhook(p) | NodeKind::ApiRequest(p) => {
            if is_blank(&p.url) {
                issues.push(invalid(node, "request URL is empty"));
            } else if !url_is_plausible(&p.url) {
                issues.push(invalid(node, format!("request URL is not http(s): {}", p.url)));
            }
            if p.response_path.is_some() && p.response_variable.is_none() {
                issues.push(invalid(node, "response path set without a response variable"));
            }
        }
        NodeKind::LanguageModel(p) => {
            if is_blank(&p.prompt) {
                issues.push(invalid(node, "language model prompt is empty"));
            }
            if is_blank(&p.variable) {
                issues.push(invalid(node, "language model has no target variable"));
            }
        }
        NodeKind::SubBotDelegate(p) => {
            if is_blank(&p.base_url) {
                issues.push(invalid(node, "sub-bot base URL is empty"));
            } else if !url_is_plausible(&p.base_url) {
                issues.push(invalid(node, format!("sub-bot base URL is not http(s): {}", p.base_url)));
            }
            if is_blank(&p.flow_id) {
                issues.push(invalid(node, "sub-bot flow id is empty"));
            }
        }
        NodeKind::QueueHandoff(p) => {
            if is_blank(&p.queue) {
                issues.push(invalid(node, "handoff queue is empty"));
            }
        }
        NodeKind::AttendantHandoff(p) => {
            if is_blank(&p.attendant) {
                issues.push(invalid(node, "handoff attendant is empty"));
            }
        }
        NodeKind::TagOp(p) => {
            if p.tags.is_empty() || p.tags.iter().any(|t| is_blank(t)) {
                issues.push(invalid(node, "tag operation needs non-empty tags"));
            }
        }
        NodeKind::SwitchFlow(p) => {
            if is_blank(&p.flow_id.0) {
                issues.push(invalid(node, "switch target flow id is empty"));
            }
        }
    }
}
