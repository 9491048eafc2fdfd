use chrono::Utc;

use chatflow_core::types::{HandoffRecord, HandoffTarget};

use crate::effects::Effect;

use super::{NodeContext, NodeResult};

pub(super) fn hand_off(ctx: &mut NodeContext<'_>, target: HandoffTarget, message: Option<&str>) -> NodeResult {
    if let Some(template) = message {
        let text = ctx.render(template);
        ctx.say(text);
    }
    let record = HandoffRecord {
        contact_id: ctx.state.contact_id.clone(),
        channel_id: ctx.state.channel_id.clone(),
        flow_id: ctx.state.flow_id.clone(),
        target: target.clone(),
        variables: ctx.state.variables.clone(),
        created_at: Utc::now(),
    };
    ctx.effects.push(Effect::Handoff(record));
    NodeResult::Handoff(target)
}
