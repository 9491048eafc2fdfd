use chatflow_core::flow::{MessageProps, OutputKey};
use chatflow_core::types::{MessageType, OutgoingMessage};

use super::{NodeContext, NodeResult};

pub(super) fn message(ctx: &mut NodeContext<'_>, props: &MessageProps) -> NodeResult {
    let text = ctx.render(&props.text);
    match &props.media {
        Some(media) => {
            let mut message = OutgoingMessage::text(&ctx.state.contact_id, &ctx.state.channel_id, text);
            message.message_type = MessageType::Media;
            message.media = Some(media.clone());
            ctx.emit(message);
        }
        None => ctx.say(text),
    }
    NodeResult::Next(OutputKey::Default)
}
