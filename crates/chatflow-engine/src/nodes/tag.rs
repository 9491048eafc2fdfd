use tracing::warn;

use chatflow_core::flow::{OutputKey, TagOpProps};

use super::{NodeContext, NodeResult};

/// Tag failures are logged; the node always continues through `default`.
pub(super) async fn apply(ctx: &mut NodeContext<'_>, props: &TagOpProps) -> NodeResult {
    let tags: Vec<String> = props
        .tags
        .iter()
        .map(|t| ctx.render(t))
        .filter(|t| !t.trim().is_empty())
        .collect();
    if tags.is_empty() {
        return NodeResult::Next(OutputKey::Default);
    }
    let contact = ctx.state.contact_id.clone();
    if let Err(e) = ctx.services.contacts.apply_tags(&contact, props.action, &tags).await {
        warn!(node_id = %ctx.node.id, contact = %contact, error = %e, "Tag operation failed");
    }
    NodeResult::Next(OutputKey::Default)
}
