pub mod validator;

use std::collections::HashMap;

use chatflow_core::error::{ChatflowError, GraphIssue, Result};
use chatflow_core::flow::{FlowDefinition, Node, NodeKind, OutputKey};
use chatflow_core::types::FlowId;

pub use validator::{ensure_valid, validate_flow};

/// Position of a node in a compiled graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIdx(usize);

/// A validated flow version with its edges resolved through an index.
///
/// Nodes are addressed by [`NodeIdx`] into the definition's node list; edges
/// are a `(source, output) -> target` table. Only definitions that pass
/// [`validate_flow`] compile, so every edge points at a real node.
#[derive(Debug)]
pub struct FlowGraph {
    flow: FlowDefinition,
    index: HashMap<String, NodeIdx>,
    edges: HashMap<(NodeIdx, OutputKey), NodeIdx>,
    start: NodeIdx,
}

impl FlowGraph {
    pub fn compile(flow: FlowDefinition) -> Result<Self> {
        ensure_valid(&flow)?;

        let index: HashMap<String, NodeIdx> = flow
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), NodeIdx(i)))
            .collect();

        let mut edges = HashMap::with_capacity(flow.edges.len());
        for edge in &flow.edges {
            if let (Some(from), Some(to)) = (
                index.get(&edge.source_node_id),
                index.get(&edge.target_node_id),
            ) {
                edges.insert((*from, edge.source_output_key), *to);
            }
        }

        let start = flow
            .nodes
            .iter()
            .position(|n| matches!(n.kind, NodeKind::Start))
            .map(NodeIdx)
            .ok_or_else(|| ChatflowError::Validation(vec![GraphIssue::StartCount(0)]))?;

        Ok(Self {
            flow,
            index,
            edges,
            start,
        })
    }

    pub fn id(&self) -> &FlowId {
        &self.flow.id
    }

    pub fn version(&self) -> u32 {
        self.flow.version
    }

    pub fn definition(&self) -> &FlowDefinition {
        &self.flow
    }

    pub fn start(&self) -> NodeIdx {
        self.start
    }

    pub fn node(&self, idx: NodeIdx) -> &Node {
        &self.flow.nodes[idx.0]
    }

    pub fn lookup(&self, node_id: &str) -> Option<NodeIdx> {
        self.index.get(node_id).copied()
    }

    /// Target of `key` on `from`, without any fallback.
    pub fn target(&self, from: NodeIdx, key: OutputKey) -> Option<NodeIdx> {
        self.edges.get(&(from, key)).copied()
    }

    pub fn len(&self) -> usize {
        self.flow.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flow.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatflow_test_utils::builder::greeting_menu_flow;
    use chatflow_test_utils::FlowBuilder;

    #[test]
    fn test_compile_resolves_edges() {
        let graph = FlowGraph::compile(greeting_menu_flow()).unwrap();
        assert_eq!(graph.len(), 6);
        assert_eq!(graph.node(graph.start()).id, "start");

        let menu = graph.lookup("menu").unwrap();
        let sales = graph.target(menu, OutputKey::Option(1)).unwrap();
        assert_eq!(graph.node(sales).id, "queue_b");
        assert!(graph.target(menu, OutputKey::Error).is_none());
    }

    #[test]
    fn test_compile_rejects_invalid() {
        let flow = FlowBuilder::new("f").start("s").message("m", "hi").link("s", "m").build();
        assert!(matches!(
            FlowGraph::compile(flow),
            Err(ChatflowError::Validation(_))
        ));
    }
}
