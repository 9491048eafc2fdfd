use serde::Serialize;

use chatflow_core::types::{HandoffRecord, OutgoingMessage};

/// Something an advance did, in the order it happened.
///
/// Messages and handoffs are handed to the effect sink once the state is
/// committed; integration calls already happened and are kept for the trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "effect", rename_all = "camelCase")]
pub enum Effect {
    Message(OutgoingMessage),
    Handoff(HandoffRecord),
    #[serde(rename_all = "camelCase")]
    IntegrationCall {
        node_id: String,
        kind: String,
        target: String,
        succeeded: bool,
        elapsed_ms: u64,
    },
}

/// Ordered effect buffer for one advance.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    items: Vec<Effect>,
}

impl Effects {
    pub(crate) fn push(&mut self, effect: Effect) {
        self.items.push(effect);
    }

    pub(crate) fn into_vec(self) -> Vec<Effect> {
        self.items
    }
}
