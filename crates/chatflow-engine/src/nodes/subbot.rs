use std::time::Instant;

use tracing::{debug, warn};

use chatflow_core::error::ChatflowError;
use chatflow_core::flow::{OutputKey, SubBotProps};
use chatflow_core::traits::{SubBotReply, SubBotRequest};
use chatflow_core::types::InboundEvent;

use super::{call_with_retries, NodeContext, NodeResult};

fn target(props: &SubBotProps) -> String {
    format!("subbot:{}", props.flow_id)
}

/// Initial hand-over. The sub-bot gets the run's variables but no message.
pub(super) async fn delegate(ctx: &mut NodeContext<'_>, props: &SubBotProps) -> NodeResult {
    exchange(ctx, props, None).await
}

/// While the sub-bot holds the conversation: messages are forwarded, a timer
/// armed for this node expires it, and a callback returns control.
pub(super) async fn resume(ctx: &mut NodeContext<'_>, props: &SubBotProps) -> NodeResult {
    let event = ctx.event;
    match event {
        InboundEvent::Message(m) => exchange(ctx, props, Some(m.body.clone())).await,
        InboundEvent::Timer { node_id, .. } if *node_id == ctx.node.id => {
            debug!(node_id = %node_id, "Sub-bot delegation expired");
            NodeResult::Failed {
                key: OutputKey::Timeout,
                error: ChatflowError::IntegrationTimeout {
                    target: target(props),
                    timeout_secs: props.idle_timeout_secs.unwrap_or_default(),
                },
            }
        }
        InboundEvent::Callback { node_id, payload, .. } if *node_id == ctx.node.id => {
            let reply = serde_json::from_value::<SubBotReply>(payload.clone()).unwrap_or_else(|e| {
                warn!(node_id = %node_id, error = %e, "Unreadable sub-bot callback payload");
                SubBotReply::default()
            });
            settle(ctx, props, SubBotReply { done: true, ..reply })
        }
        _ => NodeResult::Ignored,
    }
}

async fn exchange(ctx: &mut NodeContext<'_>, props: &SubBotProps, message: Option<String>) -> NodeResult {
    let request = SubBotRequest {
        base_url: ctx.render(&props.base_url),
        flow_id: props.flow_id.clone(),
        token: props.token.clone(),
        contact_id: ctx.state.contact_id.clone(),
        channel_id: ctx.state.channel_id.clone(),
        message,
        variables: ctx.state.variables.clone(),
    };
    let client = ctx.services.sub_bot.clone();
    let target = target(props);
    let started = Instant::now();
    let result = call_with_retries(&target, 0, ctx.timeout(props.timeout_secs), || {
        let client = client.clone();
        let request = request.clone();
        async move { client.delegate(request).await }
    })
    .await;
    ctx.integration_called(&target, result.is_ok(), started);

    match result {
        Ok(reply) => settle(ctx, props, reply),
        Err(e) => NodeResult::failed(e),
    }
}

fn settle(ctx: &mut NodeContext<'_>, props: &SubBotProps, reply: SubBotReply) -> NodeResult {
    for text in reply.messages {
        ctx.say(text);
    }
    if !reply.done {
        return NodeResult::Suspend;
    }
    if let (Some(variable), Some(result)) = (&props.variable, reply.result) {
        ctx.state.set_var(variable.clone(), result);
    }
    NodeResult::Next(OutputKey::Default)
}
