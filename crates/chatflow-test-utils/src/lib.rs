//! Shared fixtures for chatflow tests: a fluent flow builder and recording
//! mocks for every collaborator trait.

pub mod builder;
pub mod mocks;

pub use builder::FlowBuilder;
pub use mocks::*;

use chatflow_core::types::{ContactId, InboundEvent, InboundMessage};

/// Inbound text message event with a fresh id.
pub fn text_event(contact: &str, channel: &str, body: &str) -> InboundEvent {
    InboundEvent::Message(InboundMessage::text(&ContactId::from_str(contact), channel, body))
}

/// Inbound text message event with a fixed id, for idempotence tests.
pub fn text_event_with_id(id: &str, contact: &str, channel: &str, body: &str) -> InboundEvent {
    let mut msg = InboundMessage::text(&ContactId::from_str(contact), channel, body);
    msg.id = id.to_string();
    InboundEvent::Message(msg)
}
