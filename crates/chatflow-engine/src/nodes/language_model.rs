use std::time::Instant;

use tracing::{debug, warn};

use chatflow_core::error::ChatflowError;
use chatflow_core::flow::{LanguageModelProps, OutputKey};
use chatflow_core::state::{ExecutionState, Speaker};
use chatflow_core::traits::{CompletionMessage, CompletionRequest};
use chatflow_core::types::{MessageType, OutgoingMessage};

use super::{call_with_retries, NodeContext, NodeResult};

const TARGET: &str = "completion";

pub(super) async fn complete(ctx: &mut NodeContext<'_>, props: &LanguageModelProps) -> NodeResult {
    let Some(client) = ctx.services.completion.clone() else {
        return NodeResult::failed(ChatflowError::Integration {
            target: TARGET.into(),
            message: "no completion provider configured".into(),
        });
    };

    let prompt = ctx.render(&props.prompt);
    let system_prompt = props.system_prompt.as_deref().map(|s| ctx.render(s));
    let mut messages = history(ctx.state, props.history_window);
    messages.push(CompletionMessage {
        role: "user".into(),
        content: prompt,
    });
    let request = CompletionRequest {
        model: props.model.clone(),
        system_prompt,
        messages,
        temperature: props.temperature,
        max_tokens: props.max_tokens,
    };

    let timeout = ctx.timeout(props.timeout_secs);
    let started = Instant::now();
    let result = call_with_retries(TARGET, props.retries, timeout, || {
        let client = client.clone();
        let request = request.clone();
        async move { client.complete(request).await }
    })
    .await;
    ctx.integration_called(TARGET, result.is_ok(), started);

    let text = match result {
        Ok(response) => response.text.trim().to_string(),
        Err(e) => return NodeResult::failed(e),
    };
    debug!(node_id = %ctx.node.id, chars = text.len(), "Completion bound");
    ctx.state.set_var(props.variable.clone(), text.clone());

    if props.send_reply && !text.is_empty() {
        match &props.voice {
            Some(voice) => {
                let synthesized = tokio::time::timeout(timeout, client.synthesize(&text, voice)).await;
                match synthesized {
                    Ok(Ok(media)) => {
                        let mut message = OutgoingMessage::text(&ctx.state.contact_id, &ctx.state.channel_id, text);
                        message.message_type = MessageType::Audio;
                        message.media = Some(media);
                        ctx.emit(message);
                    }
                    Ok(Err(e)) => {
                        warn!(node_id = %ctx.node.id, error = %e, "Voice synthesis failed, sending text");
                        ctx.say(text);
                    }
                    Err(_) => {
                        warn!(node_id = %ctx.node.id, "Voice synthesis timed out, sending text");
                        ctx.say(text);
                    }
                }
            }
            None => ctx.say(text),
        }
    }
    NodeResult::Next(OutputKey::Default)
}

/// The last `window` conversation turns as chat messages.
fn history(state: &ExecutionState, window: usize) -> Vec<CompletionMessage> {
    let skip = state.conversation.len().saturating_sub(window);
    state
        .conversation
        .iter()
        .skip(skip)
        .map(|turn| CompletionMessage {
            role: match turn.speaker {
                Speaker::Contact => "user".into(),
                Speaker::Bot => "assistant".into(),
            },
            content: turn.text.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatflow_core::types::{ContactId, FlowId};

    #[test]
    fn test_history_window() {
        let mut state = ExecutionState::new(FlowId::from_str("f"), 1, ContactId::from_str("c"), "web", "s");
        state.record_turn(Speaker::Contact, "hi", 10);
        state.record_turn(Speaker::Bot, "hello", 10);
        state.record_turn(Speaker::Contact, "refund please", 10);

        let recent = history(&state, 2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].role, "assistant");
        assert_eq!(recent[1].content, "refund please");
        assert!(history(&state, 0).is_empty());
    }
}
