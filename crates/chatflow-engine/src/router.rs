use chatflow_core::flow::{NodeKind, OutputKey};

use crate::graph::{FlowGraph, NodeIdx};

/// Where a node's output leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Next(NodeIdx),
    /// Input mismatch with nowhere to go: stay on the node and ask again.
    Retry,
    /// No edge and no fallback. Fatal for the run.
    Unrouted,
}

/// Resolve `key` on `from`.
///
/// Fallbacks when the key has no edge:
/// - `option:i` / `match:i` use `default`;
/// - `timeout` uses `error`;
/// - a menu mismatch (`default`) or `validationError` retries the node.
pub fn route(graph: &FlowGraph, from: NodeIdx, key: OutputKey) -> Route {
    if let Some(next) = graph.target(from, key) {
        return Route::Next(next);
    }
    let fallback = match key {
        OutputKey::Option(_) | OutputKey::Match(_) => graph.target(from, OutputKey::Default),
        OutputKey::Timeout => graph.target(from, OutputKey::Error),
        _ => None,
    };
    if let Some(next) = fallback {
        return Route::Next(next);
    }
    match (key, &graph.node(from).kind) {
        (OutputKey::Default | OutputKey::Option(_), NodeKind::Menu(_)) => Route::Retry,
        (OutputKey::ValidationError, _) => Route::Retry,
        _ => Route::Unrouted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatflow_core::flow::{ConditionOperator, ConditionTest, HttpRequestProps};
    use chatflow_core::validation::InputType;
    use chatflow_test_utils::builder::greeting_menu_flow;
    use chatflow_test_utils::FlowBuilder;

    fn id_of(graph: &FlowGraph, route: Route) -> String {
        match route {
            Route::Next(idx) => graph.node(idx).id.clone(),
            other => panic!("expected a next node, got {:?}", other),
        }
    }

    #[test]
    fn test_menu_routes() {
        let graph = FlowGraph::compile(greeting_menu_flow()).unwrap();
        let menu = graph.lookup("menu").unwrap();
        assert_eq!(id_of(&graph, route(&graph, menu, OutputKey::Option(1))), "queue_b");
        assert_eq!(id_of(&graph, route(&graph, menu, OutputKey::Default)), "end");
    }

    #[test]
    fn test_menu_without_default_retries() {
        let flow = FlowBuilder::new("f")
            .start("s")
            .menu("m", "Pick", &["A"])
            .end("a")
            .link("s", "m")
            .edge("m", OutputKey::Option(0), "a")
            .build();
        let graph = FlowGraph::compile(flow).unwrap();
        let menu = graph.lookup("m").unwrap();
        assert_eq!(route(&graph, menu, OutputKey::Default), Route::Retry);
    }

    #[test]
    fn test_match_falls_back_to_default() {
        let flow = FlowBuilder::new("f")
            .start("s")
            .conditional(
                "c",
                "tier",
                vec![
                    ConditionTest::new(ConditionOperator::Equals, "vip"),
                    ConditionTest::new(ConditionOperator::Contains, "v"),
                ],
            )
            .end("x")
            .end("other")
            .link("s", "c")
            .edge("c", OutputKey::Match(0), "x")
            .link("c", "other")
            .build();
        let graph = FlowGraph::compile(flow).unwrap();
        let c = graph.lookup("c").unwrap();
        assert_eq!(id_of(&graph, route(&graph, c, OutputKey::Match(0))), "x");
        assert_eq!(id_of(&graph, route(&graph, c, OutputKey::Match(1))), "other");
    }

    #[test]
    fn test_validation_error_without_edge_retries() {
        let flow = FlowBuilder::new("f")
            .start("s")
            .question("q", "Email?", "email", InputType::Email)
            .end("e")
            .link("s", "q")
            .link("q", "e")
            .build();
        let graph = FlowGraph::compile(flow).unwrap();
        let q = graph.lookup("q").unwrap();
        assert_eq!(route(&graph, q, OutputKey::ValidationError), Route::Retry);
    }

    #[test]
    fn test_timeout_uses_error_edge_then_unrouted() {
        let with_error = FlowBuilder::new("f")
            .start("s")
            .webhook("w", HttpRequestProps::post("https://example.com/hook"))
            .end("ok")
            .end("failed")
            .link("s", "w")
            .link("w", "ok")
            .edge("w", OutputKey::Error, "failed")
            .build();
        let graph = FlowGraph::compile(with_error).unwrap();
        let w = graph.lookup("w").unwrap();
        assert_eq!(id_of(&graph, route(&graph, w, OutputKey::Timeout)), "failed");

        let without = FlowBuilder::new("f")
            .start("s")
            .webhook("w", HttpRequestProps::post("https://example.com/hook"))
            .end("ok")
            .link("s", "w")
            .link("w", "ok")
            .build();
        let graph = FlowGraph::compile(without).unwrap();
        let w = graph.lookup("w").unwrap();
        assert_eq!(route(&graph, w, OutputKey::Timeout), Route::Unrouted);
        assert_eq!(route(&graph, w, OutputKey::Error), Route::Unrouted);
    }
}
